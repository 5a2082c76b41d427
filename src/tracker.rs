//! Session tracker: opens a study session for a viewing context, keeps its
//! duration current on a heartbeat, and closes it when the view is left.
//! Tracking is best-effort telemetry; store failures are logged, never
//! surfaced to the view.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::aggregate::elapsed_secs;
use crate::models::unix_now;
use crate::store::AnalyticsStore;

/// How often an active tracker persists its elapsed duration.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

pub struct SessionTracker;

impl SessionTracker {
    /// Resolves the viewing context and opens a session for it.
    ///
    /// Returns an inactive handle (no session, no timer) when the user is
    /// unauthenticated, the course cannot be resolved, or the store
    /// refuses the insert. A chapter number that fails to resolve is
    /// treated as absent, not fatal.
    pub async fn begin(
        store: AnalyticsStore,
        user_id: Option<&str>,
        course_external_id: &str,
        chapter_number: Option<i64>,
        session_type: Option<&str>,
    ) -> TrackerHandle {
        Self::begin_with_period(
            store,
            user_id,
            course_external_id,
            chapter_number,
            session_type,
            HEARTBEAT_PERIOD,
        )
        .await
    }

    async fn begin_with_period(
        store: AnalyticsStore,
        user_id: Option<&str>,
        course_external_id: &str,
        chapter_number: Option<i64>,
        session_type: Option<&str>,
        period: Duration,
    ) -> TrackerHandle {
        let Some(user_id) = user_id else {
            return TrackerHandle::inactive(store);
        };

        let course_row_id = match store.find_course_row_id(course_external_id).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                tracing::debug!(course = course_external_id, "unknown course, not tracking");
                return TrackerHandle::inactive(store);
            }
            Err(e) => {
                tracing::warn!(error = %e, "course lookup failed, not tracking");
                return TrackerHandle::inactive(store);
            }
        };

        let chapter_row_id = match chapter_number {
            Some(n) => match store.find_chapter_row_id(course_external_id, n).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(error = %e, "chapter lookup failed, treating as absent");
                    None
                }
            },
            None => None,
        };

        let session_id = match store
            .start_session(user_id, course_row_id, chapter_row_id, session_type)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "could not open study session");
                return TrackerHandle::inactive(store);
            }
        };
        let start_time = unix_now();

        let heartbeat = tokio::spawn(heartbeat_loop(store.clone(), session_id, start_time, period));
        TrackerHandle {
            session_id: Some(session_id),
            store,
            heartbeat: Some(heartbeat),
        }
    }
}

async fn heartbeat_loop(store: AnalyticsStore, session_id: i64, start_time: i64, period: Duration) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    tick.tick().await;
    loop {
        tick.tick().await;
        let elapsed = elapsed_secs(start_time, unix_now());
        if let Err(e) = store.update_session_duration(session_id, elapsed).await {
            tracing::warn!(error = %e, session_id, "duration heartbeat failed");
        }
    }
}

/// Scoped handle for one tracked session. Owns the heartbeat task: going
/// out of scope cancels the timer, so an abandoned view can never leak a
/// ticking task. Only `close` finalizes the session record.
pub struct TrackerHandle {
    session_id: Option<i64>,
    store: AnalyticsStore,
    heartbeat: Option<JoinHandle<()>>,
}

impl TrackerHandle {
    fn inactive(store: AnalyticsStore) -> Self {
        TrackerHandle {
            session_id: None,
            store,
            heartbeat: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session_id.is_some()
    }

    pub fn session_id(&self) -> Option<i64> {
        self.session_id
    }

    /// Cancels the heartbeat and finalizes the session (end time plus
    /// duration recomputed from the stored start). Failure to close is
    /// logged, not surfaced; the handle is consumed either way.
    pub async fn close(mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if let Some(session_id) = self.session_id.take() {
            if let Err(e) = self.store.end_session(session_id).await {
                tracing::warn!(error = %e, session_id, "could not close study session");
            }
        }
    }
}

impl Drop for TrackerHandle {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{CreateChapterReq, CreateCourseReq, StudySession};

    const USER: &str = "user-abc";

    async fn seeded_store() -> AnalyticsStore {
        let pool = db::open_in_memory().await.expect("in-memory db");
        let store = AnalyticsStore::new(pool);
        store
            .create_course(&CreateCourseReq {
                course_id: "course-ext".into(),
                name: "Intro to ML".into(),
                category: "AI".into(),
                level: "Beginner".into(),
                course_output: serde_json::json!({}),
                created_by: None,
            })
            .await
            .unwrap();
        store
            .create_chapter(&CreateChapterReq {
                course_id: "course-ext".into(),
                chapter_id: 1,
                content: serde_json::json!([]),
                video_id: "vid-1".into(),
            })
            .await
            .unwrap();
        store
    }

    async fn fetch_session(store: &AnalyticsStore, session_id: i64) -> StudySession {
        sqlx::query_as::<_, StudySession>("SELECT * FROM userStudySessions WHERE sessionId = ?")
            .bind(session_id)
            .fetch_one(&store.db)
            .await
            .unwrap()
    }

    async fn session_count(store: &AnalyticsStore) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM userStudySessions")
            .fetch_one(&store.db)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unauthenticated_user_suppresses_tracking() {
        let store = seeded_store().await;
        let handle = SessionTracker::begin(store.clone(), None, "course-ext", Some(1), None).await;
        assert!(!handle.is_active());
        assert_eq!(session_count(&store).await, 0);
    }

    #[tokio::test]
    async fn unknown_course_suppresses_tracking() {
        let store = seeded_store().await;
        let handle =
            SessionTracker::begin(store.clone(), Some(USER), "nope", Some(1), None).await;
        assert!(!handle.is_active());
        assert_eq!(session_count(&store).await, 0);
    }

    #[tokio::test]
    async fn course_only_context_opens_no_session() {
        // the session schema requires a chapter row id, so a context that
        // resolves no chapter tracks nothing
        let store = seeded_store().await;
        let handle =
            SessionTracker::begin(store.clone(), Some(USER), "course-ext", None, None).await;
        assert!(!handle.is_active());
        let missing_chapter =
            SessionTracker::begin(store.clone(), Some(USER), "course-ext", Some(42), None).await;
        assert!(!missing_chapter.is_active());
        assert_eq!(session_count(&store).await, 0);
    }

    #[tokio::test]
    async fn heartbeat_persists_a_non_negative_duration() {
        let store = seeded_store().await;
        let handle = SessionTracker::begin_with_period(
            store.clone(),
            Some(USER),
            "course-ext",
            Some(1),
            Some("reading"),
            Duration::from_millis(20),
        )
        .await;
        let session_id = handle.session_id().expect("active session");

        // wait out a few heartbeats
        tokio::time::sleep(Duration::from_millis(80)).await;
        let session = fetch_session(&store, session_id).await;
        let duration = session.duration.expect("heartbeat wrote a duration");
        assert!(duration >= 0);
        assert!(session.end_time.is_none());

        handle.close().await;
    }

    #[tokio::test]
    async fn close_finalizes_end_time_and_duration() {
        let store = seeded_store().await;
        let handle =
            SessionTracker::begin(store.clone(), Some(USER), "course-ext", Some(1), None).await;
        let session_id = handle.session_id().expect("active session");

        handle.close().await;
        let session = fetch_session(&store, session_id).await;
        let end_time = session.end_time.expect("session closed");
        assert_eq!(session.duration, Some(end_time - session.start_time));
    }

    #[tokio::test]
    async fn dropping_the_handle_cancels_the_timer_but_leaves_the_session_open() {
        let store = seeded_store().await;
        let handle = SessionTracker::begin_with_period(
            store.clone(),
            Some(USER),
            "course-ext",
            Some(1),
            None,
            Duration::from_millis(20),
        )
        .await;
        let session_id = handle.session_id().expect("active session");

        drop(handle);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let session = fetch_session(&store, session_id).await;
        assert!(session.end_time.is_none());
    }
}
