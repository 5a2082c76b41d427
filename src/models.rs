use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch; the persisted layout stores every
/// timestamp this way.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

pub fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
#[sqlx(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: i64,
    /// External string identifier, distinct from the row id.
    pub course_id: String,
    pub name: String,
    pub category: String,
    pub level: String,
    pub course_output: String,
    pub is_video: String,
    pub username: Option<String>,
    pub userprofileimage: Option<String>,
    pub created_by: Option<String>,
    pub course_banner: Option<String>,
    pub is_published: bool,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
#[sqlx(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: i64,
    /// External course identifier, not the courseList row id.
    pub course_id: String,
    /// Chapter number within the course.
    pub chapter_id: i64,
    pub content: String,
    pub video_id: String,
}

/// Raw `userStudySessions` row. A session with no `end_time` is open.
#[derive(sqlx::FromRow, Debug, Clone)]
#[sqlx(rename_all = "camelCase")]
pub struct StudySession {
    pub session_id: i64,
    pub user_id: String,
    pub course_row_id: i64,
    pub chapter_row_id: i64,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub duration: Option<i64>,
    pub session_type: Option<String>,
}

/// API view of a session with epoch-second fields converted to dates.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: i64,
    pub user_id: String,
    pub course_row_id: i64,
    pub chapter_row_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub session_type: Option<String>,
}

impl From<StudySession> for SessionRecord {
    fn from(s: StudySession) -> Self {
        SessionRecord {
            session_id: s.session_id,
            user_id: s.user_id,
            course_row_id: s.course_row_id,
            chapter_row_id: s.chapter_row_id,
            start_time: ts_to_datetime(s.start_time),
            end_time: s.end_time.map(ts_to_datetime),
            duration: s.duration,
            session_type: s.session_type,
        }
    }
}

#[derive(sqlx::FromRow, Serialize, Debug, Clone)]
#[sqlx(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct ChapterProgressRow {
    pub progress_id: i64,
    pub user_id: String,
    pub course_row_id: i64,
    pub chapter_row_id: i64,
    pub is_completed: bool,
    pub time_spent: Option<i64>,
    pub completion_date: Option<i64>,
    pub progress_percentage: i64,
}

#[derive(sqlx::FromRow, Serialize, Debug, Clone)]
#[sqlx(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct CourseProgressRow {
    pub progress_id: i64,
    pub user_id: String,
    pub course_row_id: i64,
    pub total_time_spent: Option<i64>,
    pub completion_percentage: i64,
    pub chapters_completed: i64,
    pub last_accessed_date: Option<i64>,
    pub is_completed: bool,
}

/// Partial update for a `chapterProgress` row. A field is written iff it
/// is `Some`; an all-`None` update issues no SQL.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChapterProgressUpdate {
    pub is_completed: Option<bool>,
    pub time_spent: Option<i64>,
    pub completion_date: Option<i64>,
    pub progress_percentage: Option<i64>,
}

impl ChapterProgressUpdate {
    pub fn is_empty(&self) -> bool {
        self.is_completed.is_none()
            && self.time_spent.is_none()
            && self.completion_date.is_none()
            && self.progress_percentage.is_none()
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct CourseProgressUpdate {
    pub total_time_spent: Option<i64>,
    pub completion_percentage: Option<i64>,
    pub chapters_completed: Option<i64>,
    pub last_accessed_date: Option<i64>,
    pub is_completed: Option<bool>,
}

impl CourseProgressUpdate {
    pub fn is_empty(&self) -> bool {
        self.total_time_spent.is_none()
            && self.completion_percentage.is_none()
            && self.chapters_completed.is_none()
            && self.last_accessed_date.is_none()
            && self.is_completed.is_none()
    }
}

// --- chart shapes ---

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StudyTimePoint {
    /// Calendar date, `YYYY-MM-DD` (UTC portion of the session start).
    pub date: String,
    pub duration: i64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChapterProgressPoint {
    pub chapter: String,
    pub progress: i64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CourseAnalytics {
    pub course_row_id: i64,
    pub total_time_spent: i64,
    pub completion_percentage: i64,
    pub chapters_completed: i64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DistributionSlice {
    pub name: String,
    pub value: i64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRate {
    pub course_row_id: i64,
    pub rate: i64,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StudyStreak {
    pub streak_length: u32,
    /// `YYYY-MM-DD` of the most recent study date, empty when there are
    /// no sessions at all.
    pub last_active_date: String,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InsightKind {
    Strength,
    Opportunity,
    Trend,
}

#[derive(Serialize, Debug, Clone)]
pub struct LearningInsight {
    pub title: String,
    pub description: String,
    pub kind: InsightKind,
}

#[derive(Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    pub total_study_time: i64,
    pub average_progress: f64,
    pub completion_rates: Vec<CompletionRate>,
    pub study_streak: StudyStreak,
    pub insights: Vec<LearningInsight>,
}

// --- date ranges ---

/// Inclusive range in epoch-seconds. Session queries filter on the start
/// time of each session falling within the range.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: i64,
    pub end: i64,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TimeRange {
    Week,
    Month,
    All,
}

impl TimeRange {
    /// Range ending at `now`: the last 7 calendar days, the current
    /// month from the 1st, or everything since 2000-01-01.
    pub fn date_range(self, now: DateTime<Utc>) -> DateRange {
        let today = now.date_naive();
        let start_date = match self {
            TimeRange::Week => today.checked_sub_days(Days::new(6)).unwrap_or(today),
            TimeRange::Month => today.with_day(1).unwrap_or(today),
            TimeRange::All => NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or(today),
        };
        DateRange {
            start: start_date.and_time(NaiveTime::MIN).and_utc().timestamp(),
            end: now.timestamp(),
        }
    }
}

// --- request bodies ---

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateCourseReq {
    pub course_id: String,
    pub name: String,
    pub category: String,
    pub level: String,
    pub course_output: serde_json::Value,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateChapterReq {
    pub course_id: String,
    pub chapter_id: i64,
    pub content: serde_json::Value,
    pub video_id: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionReq {
    pub user_id: String,
    /// External course identifier.
    pub course_id: String,
    /// Chapter number within the course; a resolution miss is treated as
    /// "no chapter", which the session schema then rejects.
    pub chapter_id: Option<i64>,
    #[serde(default)]
    pub session_type: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct HeartbeatReq {
    pub duration: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn week_range_covers_seven_calendar_days() {
        let now = Utc.with_ymd_and_hms(2025, 9, 10, 15, 30, 0).unwrap();
        let range = TimeRange::Week.date_range(now);
        let start = ts_to_datetime(range.start);
        assert_eq!(start.date_naive().to_string(), "2025-09-04");
        assert_eq!(range.end, now.timestamp());
    }

    #[test]
    fn month_range_starts_on_the_first() {
        let now = Utc.with_ymd_and_hms(2025, 9, 10, 0, 0, 0).unwrap();
        let range = TimeRange::Month.date_range(now);
        assert_eq!(
            ts_to_datetime(range.start).date_naive().to_string(),
            "2025-09-01"
        );
    }

    #[test]
    fn empty_updates_are_detected() {
        assert!(ChapterProgressUpdate::default().is_empty());
        assert!(CourseProgressUpdate::default().is_empty());
        let update = ChapterProgressUpdate {
            progress_percentage: Some(40),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}
