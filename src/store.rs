use sqlx::QueryBuilder;
use thiserror::Error;

use crate::aggregate::{self, InsightEngine, InsightInputs};
use crate::db::Db;
use crate::models::*;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    /// The session schema mandates a chapter row id; this is the one
    /// failure the store refuses to soften.
    #[error("chapterRowId is required by the session schema")]
    MissingChapterRowId,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read/write operations over the analytics tables plus aggregation entry
/// points. Every operation is its own unit of work and returns an explicit
/// `Result`; callers decide whether to log-and-default or surface.
#[derive(Clone)]
pub struct AnalyticsStore {
    pub(crate) db: Db,
}

impl AnalyticsStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    // --- catalog ---

    pub async fn create_course(&self, req: &CreateCourseReq) -> StoreResult<Course> {
        let course = sqlx::query_as::<_, Course>(
            "INSERT INTO courseList (courseId, name, category, level, courseOutput, createdBy) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(&req.course_id)
        .bind(&req.name)
        .bind(&req.category)
        .bind(&req.level)
        .bind(req.course_output.to_string())
        .bind(&req.created_by)
        .fetch_one(&self.db)
        .await?;
        Ok(course)
    }

    pub async fn create_chapter(&self, req: &CreateChapterReq) -> StoreResult<Chapter> {
        let chapter = sqlx::query_as::<_, Chapter>(
            "INSERT INTO courseChapters (courseId, chapterId, content, videoId) \
             VALUES (?, ?, ?, ?) RETURNING *",
        )
        .bind(&req.course_id)
        .bind(req.chapter_id)
        .bind(req.content.to_string())
        .bind(&req.video_id)
        .fetch_one(&self.db)
        .await?;
        Ok(chapter)
    }

    /// Row id for an external course identifier; `None` on a miss.
    pub async fn find_course_row_id(&self, external_id: &str) -> StoreResult<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM courseList WHERE courseId = ?")
            .bind(external_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(id)
    }

    /// Row id for a chapter, keyed by external course id + chapter number.
    pub async fn find_chapter_row_id(
        &self,
        external_course_id: &str,
        chapter_number: i64,
    ) -> StoreResult<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM courseChapters WHERE courseId = ? AND chapterId = ?",
        )
        .bind(external_course_id)
        .bind(chapter_number)
        .fetch_optional(&self.db)
        .await?;
        Ok(id)
    }

    // --- session lifecycle ---

    /// Opens a study session with `startTime = now` and returns its id.
    pub async fn start_session(
        &self,
        user_id: &str,
        course_row_id: i64,
        chapter_row_id: Option<i64>,
        session_type: Option<&str>,
    ) -> StoreResult<i64> {
        let chapter_row_id = chapter_row_id.ok_or(StoreError::MissingChapterRowId)?;
        let res = sqlx::query(
            "INSERT INTO userStudySessions (userId, courseRowId, chapterRowId, startTime, sessionType) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(course_row_id)
        .bind(chapter_row_id)
        .bind(unix_now())
        .bind(session_type)
        .execute(&self.db)
        .await?;
        Ok(res.last_insert_rowid())
    }

    /// Finalizes a session: `endTime = now`, duration recomputed from the
    /// stored start time. An unknown session id is a no-op.
    pub async fn end_session(&self, session_id: i64) -> StoreResult<()> {
        let session = sqlx::query_as::<_, StudySession>(
            "SELECT * FROM userStudySessions WHERE sessionId = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.db)
        .await?;
        let Some(session) = session else {
            return Ok(());
        };
        let end_time = unix_now();
        sqlx::query("UPDATE userStudySessions SET endTime = ?, duration = ? WHERE sessionId = ?")
            .bind(end_time)
            .bind(end_time - session.start_time)
            .bind(session_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Unconditional duration overwrite, used by the heartbeat. Does not
    /// recompute from the start time.
    pub async fn update_session_duration(&self, session_id: i64, duration: i64) -> StoreResult<()> {
        sqlx::query("UPDATE userStudySessions SET duration = ? WHERE sessionId = ?")
            .bind(duration)
            .bind(session_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Most recently started session for the (user, course, chapter) triple.
    pub async fn get_active_session(
        &self,
        user_id: &str,
        course_row_id: i64,
        chapter_row_id: i64,
    ) -> StoreResult<Option<SessionRecord>> {
        let session = sqlx::query_as::<_, StudySession>(
            "SELECT * FROM userStudySessions \
             WHERE userId = ? AND courseRowId = ? AND chapterRowId = ? \
             ORDER BY startTime DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(course_row_id)
        .bind(chapter_row_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(session.map(SessionRecord::from))
    }

    /// Sessions for a user, newest first. With a range, keeps the sessions
    /// whose start time falls inside it, both ends inclusive.
    pub async fn sessions_in_range(
        &self,
        user_id: &str,
        range: Option<DateRange>,
    ) -> StoreResult<Vec<SessionRecord>> {
        let rows = match range {
            Some(r) => {
                sqlx::query_as::<_, StudySession>(
                    "SELECT * FROM userStudySessions \
                     WHERE userId = ? AND startTime >= ? AND startTime <= ? \
                     ORDER BY startTime DESC",
                )
                .bind(user_id)
                .bind(r.start)
                .bind(r.end)
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query_as::<_, StudySession>(
                    "SELECT * FROM userStudySessions WHERE userId = ? ORDER BY startTime DESC",
                )
                .bind(user_id)
                .fetch_all(&self.db)
                .await?
            }
        };
        Ok(rows.into_iter().map(SessionRecord::from).collect())
    }

    // --- progress ---

    /// Writes the `Some` fields of the update to an existing row. Progress
    /// rows are created by the content pipeline, not here, so a missing
    /// row is a no-op.
    pub async fn update_chapter_progress(
        &self,
        user_id: &str,
        course_row_id: i64,
        chapter_row_id: i64,
        update: &ChapterProgressUpdate,
    ) -> StoreResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<sqlx::Sqlite>::new("UPDATE chapterProgress SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(v) = update.is_completed {
                set.push("isCompleted = ").push_bind_unseparated(v);
            }
            if let Some(v) = update.time_spent {
                set.push("timeSpent = ").push_bind_unseparated(v);
            }
            if let Some(v) = update.completion_date {
                set.push("completionDate = ").push_bind_unseparated(v);
            }
            if let Some(v) = update.progress_percentage {
                set.push("progressPercentage = ").push_bind_unseparated(v);
            }
        }
        qb.push(" WHERE userId = ")
            .push_bind(user_id)
            .push(" AND courseRowId = ")
            .push_bind(course_row_id)
            .push(" AND chapterRowId = ")
            .push_bind(chapter_row_id);
        qb.build().execute(&self.db).await?;
        Ok(())
    }

    pub async fn get_chapter_progress(
        &self,
        user_id: &str,
        course_row_id: i64,
        chapter_row_id: i64,
    ) -> StoreResult<Option<ChapterProgressRow>> {
        let row = sqlx::query_as::<_, ChapterProgressRow>(
            "SELECT * FROM chapterProgress \
             WHERE userId = ? AND courseRowId = ? AND chapterRowId = ?",
        )
        .bind(user_id)
        .bind(course_row_id)
        .bind(chapter_row_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    pub async fn update_course_progress(
        &self,
        user_id: &str,
        course_row_id: i64,
        update: &CourseProgressUpdate,
    ) -> StoreResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<sqlx::Sqlite>::new("UPDATE courseProgress SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(v) = update.total_time_spent {
                set.push("totalTimeSpent = ").push_bind_unseparated(v);
            }
            if let Some(v) = update.completion_percentage {
                set.push("completionPercentage = ").push_bind_unseparated(v);
            }
            if let Some(v) = update.chapters_completed {
                set.push("chaptersCompleted = ").push_bind_unseparated(v);
            }
            if let Some(v) = update.last_accessed_date {
                set.push("lastAccessedDate = ").push_bind_unseparated(v);
            }
            if let Some(v) = update.is_completed {
                set.push("isCompleted = ").push_bind_unseparated(v);
            }
        }
        qb.push(" WHERE userId = ")
            .push_bind(user_id)
            .push(" AND courseRowId = ")
            .push_bind(course_row_id);
        qb.build().execute(&self.db).await?;
        Ok(())
    }

    pub async fn get_course_progress(
        &self,
        user_id: &str,
        course_row_id: i64,
    ) -> StoreResult<Option<CourseProgressRow>> {
        let row = sqlx::query_as::<_, CourseProgressRow>(
            "SELECT * FROM courseProgress WHERE userId = ? AND courseRowId = ?",
        )
        .bind(user_id)
        .bind(course_row_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    // --- aggregation entry points ---

    pub async fn daily_study_time(
        &self,
        user_id: &str,
        range: DateRange,
    ) -> StoreResult<Vec<StudyTimePoint>> {
        let sessions = self.sessions_in_range(user_id, Some(range)).await?;
        Ok(aggregate::daily_study_time(&sessions))
    }

    pub async fn chapter_progress_data(
        &self,
        user_id: &str,
    ) -> StoreResult<Vec<ChapterProgressPoint>> {
        let rows = self.all_chapter_progress(user_id).await?;
        Ok(aggregate::chapter_progress_data(&rows))
    }

    pub async fn course_analytics_data(&self, user_id: &str) -> StoreResult<Vec<CourseAnalytics>> {
        let rows = self.all_course_progress(user_id).await?;
        Ok(aggregate::course_analytics_data(&rows))
    }

    pub async fn total_study_time(&self, user_id: &str, range: DateRange) -> StoreResult<i64> {
        let sessions = self.sessions_in_range(user_id, Some(range)).await?;
        Ok(aggregate::total_study_time(&sessions))
    }

    pub async fn average_progress(&self, user_id: &str) -> StoreResult<f64> {
        let courses = self.course_analytics_data(user_id).await?;
        Ok(aggregate::average_progress(&courses))
    }

    pub async fn completion_rates(&self, user_id: &str) -> StoreResult<Vec<CompletionRate>> {
        let courses = self.course_analytics_data(user_id).await?;
        Ok(aggregate::completion_rates(&courses))
    }

    pub async fn study_streak(&self, user_id: &str) -> StoreResult<StudyStreak> {
        let sessions = self.sessions_in_range(user_id, None).await?;
        Ok(aggregate::study_streak(&sessions))
    }

    pub async fn analytics_summary(
        &self,
        user_id: &str,
        range: DateRange,
        engine: &dyn InsightEngine,
    ) -> StoreResult<AnalyticsSummary> {
        let in_range = self.sessions_in_range(user_id, Some(range)).await?;
        let all_sessions = self.sessions_in_range(user_id, None).await?;
        let courses = self.course_analytics_data(user_id).await?;
        let study_streak = aggregate::study_streak(&all_sessions);
        let insights = engine.insights(&InsightInputs {
            streak: &study_streak,
            courses: &courses,
            sessions: &all_sessions,
        });
        Ok(AnalyticsSummary {
            total_study_time: aggregate::total_study_time(&in_range),
            average_progress: aggregate::average_progress(&courses),
            completion_rates: aggregate::completion_rates(&courses),
            study_streak,
            insights,
        })
    }

    pub async fn study_patterns(
        &self,
        user_id: &str,
        engine: &dyn InsightEngine,
    ) -> StoreResult<Vec<String>> {
        let sessions = self.sessions_in_range(user_id, None).await?;
        let courses = self.course_analytics_data(user_id).await?;
        let streak = aggregate::study_streak(&sessions);
        Ok(engine.patterns(&InsightInputs {
            streak: &streak,
            courses: &courses,
            sessions: &sessions,
        }))
    }

    async fn all_chapter_progress(&self, user_id: &str) -> StoreResult<Vec<ChapterProgressRow>> {
        let rows = sqlx::query_as::<_, ChapterProgressRow>(
            "SELECT * FROM chapterProgress WHERE userId = ?",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn all_course_progress(&self, user_id: &str) -> StoreResult<Vec<CourseProgressRow>> {
        let rows = sqlx::query_as::<_, CourseProgressRow>(
            "SELECT * FROM courseProgress WHERE userId = ?",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::StaticInsights;
    use crate::db;
    use chrono::{Datelike, TimeZone, Utc};

    const USER: &str = "user-abc";

    async fn store() -> AnalyticsStore {
        let pool = db::open_in_memory().await.expect("in-memory db");
        AnalyticsStore::new(pool)
    }

    fn course_req(external_id: &str) -> CreateCourseReq {
        CreateCourseReq {
            course_id: external_id.into(),
            name: "Intro to ML".into(),
            category: "AI".into(),
            level: "Beginner".into(),
            course_output: serde_json::json!({"chapters": []}),
            created_by: Some(USER.into()),
        }
    }

    fn chapter_req(external_course_id: &str, number: i64) -> CreateChapterReq {
        CreateChapterReq {
            course_id: external_course_id.into(),
            chapter_id: number,
            content: serde_json::json!([]),
            video_id: "vid-1".into(),
        }
    }

    async fn seed_course_with_chapter(store: &AnalyticsStore) -> (i64, i64) {
        let course = store.create_course(&course_req("course-ext")).await.unwrap();
        let chapter = store
            .create_chapter(&chapter_req("course-ext", 1))
            .await
            .unwrap();
        (course.id, chapter.id)
    }

    async fn insert_session_at(store: &AnalyticsStore, start_time: i64, duration: i64) {
        sqlx::query(
            "INSERT INTO userStudySessions (userId, courseRowId, chapterRowId, startTime, duration) \
             VALUES (?, 1, 1, ?, ?)",
        )
        .bind(USER)
        .bind(start_time)
        .bind(duration)
        .execute(&store.db)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn resolves_external_ids_and_misses_return_none() {
        let store = store().await;
        let (course_row_id, chapter_row_id) = seed_course_with_chapter(&store).await;

        assert_eq!(
            store.find_course_row_id("course-ext").await.unwrap(),
            Some(course_row_id)
        );
        assert_eq!(store.find_course_row_id("no-such-course").await.unwrap(), None);
        assert_eq!(
            store.find_chapter_row_id("course-ext", 1).await.unwrap(),
            Some(chapter_row_id)
        );
        assert_eq!(store.find_chapter_row_id("course-ext", 99).await.unwrap(), None);
    }

    #[tokio::test]
    async fn start_without_chapter_row_id_is_a_contract_failure() {
        let store = store().await;
        let (course_row_id, _) = seed_course_with_chapter(&store).await;
        let err = store
            .start_session(USER, course_row_id, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingChapterRowId));
    }

    #[tokio::test]
    async fn ended_session_duration_equals_end_minus_start() {
        let store = store().await;
        let (course_row_id, chapter_row_id) = seed_course_with_chapter(&store).await;
        let session_id = store
            .start_session(USER, course_row_id, Some(chapter_row_id), Some("reading"))
            .await
            .unwrap();
        store.end_session(session_id).await.unwrap();

        let session = sqlx::query_as::<_, StudySession>(
            "SELECT * FROM userStudySessions WHERE sessionId = ?",
        )
        .bind(session_id)
        .fetch_one(&store.db)
        .await
        .unwrap();
        let end_time = session.end_time.expect("session closed");
        assert_eq!(session.duration, Some(end_time - session.start_time));
        assert_eq!(session.session_type.as_deref(), Some("reading"));
    }

    #[tokio::test]
    async fn ending_an_unknown_session_is_a_noop() {
        let store = store().await;
        store.end_session(424242).await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_overwrites_duration_unconditionally() {
        let store = store().await;
        let (course_row_id, chapter_row_id) = seed_course_with_chapter(&store).await;
        let session_id = store
            .start_session(USER, course_row_id, Some(chapter_row_id), None)
            .await
            .unwrap();

        store.update_session_duration(session_id, 30).await.unwrap();
        store.update_session_duration(session_id, 17).await.unwrap();
        let active = store
            .get_active_session(USER, course_row_id, chapter_row_id)
            .await
            .unwrap()
            .expect("active session");
        assert_eq!(active.duration, Some(17));
        assert!(active.end_time.is_none());
    }

    #[tokio::test]
    async fn active_session_is_the_most_recently_started() {
        let store = store().await;
        insert_session_at(&store, 1_000, 10).await;
        insert_session_at(&store, 2_000, 20).await;
        let active = store.get_active_session(USER, 1, 1).await.unwrap().unwrap();
        assert_eq!(active.start_time.timestamp(), 2_000);
    }

    #[tokio::test]
    async fn range_filter_is_inclusive_on_session_start() {
        let store = store().await;
        for day in 1..=5 {
            let start = Utc.with_ymd_and_hms(2025, 9, day, 12, 0, 0).unwrap();
            insert_session_at(&store, start.timestamp(), 60).await;
        }
        let range = DateRange {
            start: Utc.with_ymd_and_hms(2025, 9, 2, 0, 0, 0).unwrap().timestamp(),
            end: Utc.with_ymd_and_hms(2025, 9, 4, 23, 59, 59).unwrap().timestamp(),
        };
        let sessions = store.sessions_in_range(USER, Some(range)).await.unwrap();
        let days: Vec<u32> = sessions
            .iter()
            .map(|s| s.start_time.date_naive().day())
            .collect();
        assert_eq!(days, vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn partial_update_only_touches_present_fields() {
        let store = store().await;
        sqlx::query(
            "INSERT INTO chapterProgress (userId, courseRowId, chapterRowId, isCompleted, timeSpent, progressPercentage) \
             VALUES (?, 1, 1, 0, 120, 25)",
        )
        .bind(USER)
        .execute(&store.db)
        .await
        .unwrap();

        let update = ChapterProgressUpdate {
            progress_percentage: Some(50),
            ..Default::default()
        };
        store.update_chapter_progress(USER, 1, 1, &update).await.unwrap();

        let row = store.get_chapter_progress(USER, 1, 1).await.unwrap().unwrap();
        assert_eq!(row.progress_percentage, 50);
        assert_eq!(row.time_spent, Some(120));
        assert!(!row.is_completed);

        // all-None update issues no SQL and changes nothing
        store
            .update_chapter_progress(USER, 1, 1, &ChapterProgressUpdate::default())
            .await
            .unwrap();
        let row = store.get_chapter_progress(USER, 1, 1).await.unwrap().unwrap();
        assert_eq!(row.progress_percentage, 50);
    }

    #[tokio::test]
    async fn course_progress_update_of_missing_row_is_a_noop() {
        let store = store().await;
        let update = CourseProgressUpdate {
            completion_percentage: Some(75),
            ..Default::default()
        };
        store.update_course_progress(USER, 9, &update).await.unwrap();
        assert!(store.get_course_progress(USER, 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn summary_aggregates_sessions_and_progress() {
        let store = store().await;
        let today = Utc.with_ymd_and_hms(2025, 9, 10, 9, 0, 0).unwrap();
        let yesterday = Utc.with_ymd_and_hms(2025, 9, 9, 9, 0, 0).unwrap();
        insert_session_at(&store, today.timestamp(), 300).await;
        insert_session_at(&store, yesterday.timestamp(), 200).await;
        sqlx::query(
            "INSERT INTO courseProgress (userId, courseRowId, totalTimeSpent, completionPercentage, chaptersCompleted) \
             VALUES (?, 1, 500, 60, 3)",
        )
        .bind(USER)
        .execute(&store.db)
        .await
        .unwrap();

        let range = DateRange {
            start: yesterday.timestamp(),
            end: today.timestamp(),
        };
        let summary = store
            .analytics_summary(USER, range, &StaticInsights)
            .await
            .unwrap();
        assert_eq!(summary.total_study_time, 500);
        assert_eq!(summary.average_progress, 60.0);
        assert_eq!(summary.study_streak.streak_length, 2);
        assert_eq!(summary.study_streak.last_active_date, "2025-09-10");
        assert_eq!(summary.completion_rates.len(), 1);
        assert!(!summary.insights.is_empty());

        let patterns = store.study_patterns(USER, &StaticInsights).await.unwrap();
        assert_eq!(patterns.len(), 2);
    }
}
