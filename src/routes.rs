use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Html,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::aggregate::{self, InsightEngine};
use crate::models::*;
use crate::store::{AnalyticsStore, StoreError};

#[derive(Clone)]
pub struct AppState {
    pub store: AnalyticsStore,
    pub insights: Arc<dyn InsightEngine>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // catalog registration (content pipeline)
        .route("/api/courses", post(create_course))
        .route("/api/chapters", post(create_chapter))
        // session lifecycle
        .route("/api/sessions", post(start_session).get(list_sessions))
        .route("/api/sessions/active", get(active_session))
        .route("/api/sessions/:session_id/heartbeat", post(session_heartbeat))
        .route("/api/sessions/:session_id/finish", post(finish_session))
        // progress
        .route(
            "/api/progress/chapter",
            get(chapter_progress).patch(patch_chapter_progress),
        )
        .route(
            "/api/progress/course",
            get(course_progress).patch(patch_course_progress),
        )
        // chart data
        .route("/api/analytics/study-time", get(study_time))
        .route("/api/analytics/chapters", get(chapters_chart))
        .route("/api/analytics/courses", get(courses_chart))
        .route("/api/analytics/distribution", get(distribution_chart))
        .route("/api/analytics/summary", get(summary))
        .route("/api/analytics/patterns", get(patterns))
        .route("/dashboard", get(dashboard_shell))
        .with_state(state)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserQuery {
    user_id: String,
    range: Option<TimeRange>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionsQuery {
    user_id: String,
    from: Option<i64>,
    to: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChapterKeyQuery {
    user_id: String,
    course_row_id: i64,
    chapter_row_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CourseKeyQuery {
    user_id: String,
    course_row_id: i64,
}

// --- catalog ---

async fn create_course(
    State(st): State<AppState>,
    Json(req): Json<CreateCourseReq>,
) -> Result<Json<Course>, (StatusCode, String)> {
    let course = st.store.create_course(&req).await.map_err(e500)?;
    Ok(Json(course))
}

async fn create_chapter(
    State(st): State<AppState>,
    Json(req): Json<CreateChapterReq>,
) -> Result<Json<Chapter>, (StatusCode, String)> {
    let chapter = st.store.create_chapter(&req).await.map_err(e500)?;
    Ok(Json(chapter))
}

// --- session lifecycle ---

async fn start_session(
    State(st): State<AppState>,
    Json(req): Json<StartSessionReq>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let course_row_id = st
        .store
        .find_course_row_id(&req.course_id)
        .await
        .map_err(e500)?;
    let Some(course_row_id) = course_row_id else {
        return Err(e400("course not found"));
    };
    // a chapter that fails to resolve is treated as absent; the store
    // then decides whether the schema allows it
    let chapter_row_id = match req.chapter_id {
        Some(n) => st
            .store
            .find_chapter_row_id(&req.course_id, n)
            .await
            .map_err(e500)?,
        None => None,
    };
    match st
        .store
        .start_session(
            &req.user_id,
            course_row_id,
            chapter_row_id,
            req.session_type.as_deref(),
        )
        .await
    {
        Ok(session_id) => Ok(Json(json!({ "sessionId": session_id }))),
        Err(e @ StoreError::MissingChapterRowId) => {
            Err((StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))
        }
        Err(e) => Err(e500(e)),
    }
}

async fn session_heartbeat(
    State(st): State<AppState>,
    Path(session_id): Path<i64>,
    Json(req): Json<HeartbeatReq>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    st.store
        .update_session_duration(session_id, req.duration)
        .await
        .map_err(e500)?;
    Ok(Json(json!({ "ok": true })))
}

async fn finish_session(
    State(st): State<AppState>,
    Path(session_id): Path<i64>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    st.store.end_session(session_id).await.map_err(e500)?;
    Ok(Json(json!({ "ok": true })))
}

async fn active_session(
    State(st): State<AppState>,
    Query(q): Query<ChapterKeyQuery>,
) -> Json<Option<SessionRecord>> {
    Json(read_or_default(
        st.store
            .get_active_session(&q.user_id, q.course_row_id, q.chapter_row_id)
            .await,
        "get_active_session",
    ))
}

async fn list_sessions(
    State(st): State<AppState>,
    Query(q): Query<SessionsQuery>,
) -> Json<Vec<SessionRecord>> {
    let range = match (q.from, q.to) {
        (Some(start), Some(end)) => Some(DateRange { start, end }),
        _ => None,
    };
    Json(read_or_default(
        st.store.sessions_in_range(&q.user_id, range).await,
        "sessions_in_range",
    ))
}

// --- progress ---

async fn chapter_progress(
    State(st): State<AppState>,
    Query(q): Query<ChapterKeyQuery>,
) -> Json<Option<ChapterProgressRow>> {
    Json(read_or_default(
        st.store
            .get_chapter_progress(&q.user_id, q.course_row_id, q.chapter_row_id)
            .await,
        "get_chapter_progress",
    ))
}

async fn patch_chapter_progress(
    State(st): State<AppState>,
    Query(q): Query<ChapterKeyQuery>,
    Json(update): Json<ChapterProgressUpdate>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    st.store
        .update_chapter_progress(&q.user_id, q.course_row_id, q.chapter_row_id, &update)
        .await
        .map_err(e500)?;
    Ok(Json(json!({ "ok": true })))
}

async fn course_progress(
    State(st): State<AppState>,
    Query(q): Query<CourseKeyQuery>,
) -> Json<Option<CourseProgressRow>> {
    Json(read_or_default(
        st.store.get_course_progress(&q.user_id, q.course_row_id).await,
        "get_course_progress",
    ))
}

async fn patch_course_progress(
    State(st): State<AppState>,
    Query(q): Query<CourseKeyQuery>,
    Json(update): Json<CourseProgressUpdate>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    st.store
        .update_course_progress(&q.user_id, q.course_row_id, &update)
        .await
        .map_err(e500)?;
    Ok(Json(json!({ "ok": true })))
}

// --- chart data ---

async fn study_time(
    State(st): State<AppState>,
    Query(q): Query<UserQuery>,
) -> Json<Vec<StudyTimePoint>> {
    let range = q.range.unwrap_or(TimeRange::Week).date_range(Utc::now());
    Json(read_or_default(
        st.store.daily_study_time(&q.user_id, range).await,
        "daily_study_time",
    ))
}

async fn chapters_chart(
    State(st): State<AppState>,
    Query(q): Query<UserQuery>,
) -> Json<Vec<ChapterProgressPoint>> {
    Json(read_or_default(
        st.store.chapter_progress_data(&q.user_id).await,
        "chapter_progress_data",
    ))
}

async fn courses_chart(
    State(st): State<AppState>,
    Query(q): Query<UserQuery>,
) -> Json<Vec<CourseAnalytics>> {
    Json(read_or_default(
        st.store.course_analytics_data(&q.user_id).await,
        "course_analytics_data",
    ))
}

async fn distribution_chart(
    State(st): State<AppState>,
    Query(q): Query<UserQuery>,
) -> Json<Vec<DistributionSlice>> {
    let courses = read_or_default(
        st.store.course_analytics_data(&q.user_id).await,
        "course_analytics_data",
    );
    Json(aggregate::course_distribution(&courses))
}

async fn summary(State(st): State<AppState>, Query(q): Query<UserQuery>) -> Json<AnalyticsSummary> {
    let range = q.range.unwrap_or(TimeRange::Week).date_range(Utc::now());
    Json(read_or_default(
        st.store
            .analytics_summary(&q.user_id, range, st.insights.as_ref())
            .await,
        "analytics_summary",
    ))
}

async fn patterns(State(st): State<AppState>, Query(q): Query<UserQuery>) -> Json<Vec<String>> {
    Json(read_or_default(
        st.store.study_patterns(&q.user_id, st.insights.as_ref()).await,
        "study_patterns",
    ))
}

async fn dashboard_shell() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

// --- helpers ---

/// Read-path policy: a store failure is logged and the caller gets a
/// neutral value, so the dashboard renders "no data" instead of an error.
fn read_or_default<T: Default>(res: Result<T, StoreError>, op: &'static str) -> T {
    match res {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, op, "analytics read failed, returning empty data");
            T::default()
        }
    }
}

fn e400<T: Into<String>>(msg: T) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, msg.into())
}

fn e500<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    tracing::error!(error=%e, "internal error");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Study Analytics</title>
  <style>
    body{font-family:sans-serif;margin:0;background:#fafafa;color:#222}
    .bar{height:36px;background:#eee;border-bottom:1px solid #ddd;display:flex;align-items:center;padding:0 12px}
    main{max-width:860px;margin:24px auto;padding:0 12px}
    .cards{display:flex;gap:12px;flex-wrap:wrap}
    .card{flex:1 1 180px;background:#fff;border:1px solid #ddd;border-radius:6px;padding:12px}
    .card h3{margin:0 0 4px;font-size:13px;color:#666;font-weight:normal}
    .card .v{font-size:22px}
    .row{display:flex;align-items:center;gap:8px;margin:4px 0}
    .row .fill{height:14px;background:#4a90d9;border-radius:3px}
    .row .lbl{width:90px;font-size:12px;color:#666}
    section{margin-top:24px}
    ul{padding-left:18px}
  </style>
</head>
<body>
<div class='bar'>Study Analytics &bull; <span id='who'></span></div>
<main>
  <div class='cards'>
    <div class='card'><h3>Total Study Time</h3><div class='v' id='total'>&ndash;</div></div>
    <div class='card'><h3>Avg. Progress</h3><div class='v' id='avg'>&ndash;</div></div>
    <div class='card'><h3>Streak</h3><div class='v' id='streak'>&ndash;</div></div>
    <div class='card'><h3>Courses</h3><div class='v' id='courses'>&ndash;</div></div>
  </div>
  <section><h2>Daily study time</h2><div id='daily'></div></section>
  <section><h2>Insights</h2><ul id='insights'></ul></section>
</main>
<script>
(function(){
  const params = new URLSearchParams(location.search);
  const userId = params.get('userId') || '';
  const range = params.get('range') || 'week';
  document.getElementById('who').textContent = userId || 'no user';

  async function load(path){
    const res = await fetch(path + '?userId=' + encodeURIComponent(userId) + '&range=' + range);
    return res.json();
  }

  load('/api/analytics/summary').then(s => {
    document.getElementById('total').textContent = Math.round(s.totalStudyTime / 60) + ' min';
    document.getElementById('avg').textContent = Math.round(s.averageProgress) + '%';
    document.getElementById('streak').textContent =
      s.studyStreak.streakLength + (s.studyStreak.lastActiveDate ? ' (' + s.studyStreak.lastActiveDate + ')' : '');
    document.getElementById('courses').textContent = s.completionRates.length;
    const ul = document.getElementById('insights');
    for (const i of s.insights) {
      const li = document.createElement('li');
      li.textContent = i.title + ' - ' + i.description;
      ul.appendChild(li);
    }
  }).catch(e => console.warn('summary failed', e));

  load('/api/analytics/study-time').then(points => {
    const max = Math.max(1, ...points.map(p => p.duration));
    const box = document.getElementById('daily');
    for (const p of points) {
      const row = document.createElement('div');
      row.className = 'row';
      row.innerHTML = "<span class='lbl'>" + p.date + "</span>" +
        "<div class='fill' style='width:" + Math.round(300 * p.duration / max) + "px'></div>" +
        "<span>" + Math.round(p.duration / 60) + " min</span>";
      box.appendChild(row);
    }
  }).catch(e => console.warn('study-time failed', e));
})();
</script>
</body>
</html>"#;
