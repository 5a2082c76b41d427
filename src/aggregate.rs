//! Pure aggregation over query results. Nothing here touches the store;
//! every function is a plain transformation so the chart shapes can be
//! tested without a database.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, NaiveTime};

use crate::models::{
    ChapterProgressPoint, ChapterProgressRow, CompletionRate, CourseAnalytics, CourseProgressRow,
    DateRange, DistributionSlice, InsightKind, LearningInsight, SessionRecord, StudyStreak,
    StudyTimePoint,
};

/// Elapsed whole seconds between two clock reads, clamped so a backwards
/// clock step never yields a negative duration.
pub fn elapsed_secs(start_ts: i64, now_ts: i64) -> i64 {
    (now_ts - start_ts).max(0)
}

/// Buckets sessions by the UTC calendar date of their start time and sums
/// durations per date. Output is sorted by date ascending.
pub fn daily_study_time(sessions: &[SessionRecord]) -> Vec<StudyTimePoint> {
    let mut buckets: BTreeMap<NaiveDate, i64> = BTreeMap::new();
    for s in sessions {
        *buckets.entry(s.start_time.date_naive()).or_insert(0) += s.duration.unwrap_or(0);
    }
    buckets
        .into_iter()
        .map(|(date, duration)| StudyTimePoint {
            date: date.format("%Y-%m-%d").to_string(),
            duration,
        })
        .collect()
}

pub fn chapter_progress_data(rows: &[ChapterProgressRow]) -> Vec<ChapterProgressPoint> {
    rows.iter()
        .map(|c| ChapterProgressPoint {
            chapter: format!("Chapter {}", c.chapter_row_id),
            progress: c.progress_percentage,
        })
        .collect()
}

pub fn course_analytics_data(rows: &[CourseProgressRow]) -> Vec<CourseAnalytics> {
    rows.iter()
        .map(|c| CourseAnalytics {
            course_row_id: c.course_row_id,
            total_time_spent: c.total_time_spent.unwrap_or(0),
            completion_percentage: c.completion_percentage,
            chapters_completed: c.chapters_completed,
        })
        .collect()
}

pub fn total_study_time(sessions: &[SessionRecord]) -> i64 {
    sessions.iter().map(|s| s.duration.unwrap_or(0)).sum()
}

/// Mean completion percentage across courses; 0 for an empty set.
pub fn average_progress(courses: &[CourseAnalytics]) -> f64 {
    if courses.is_empty() {
        return 0.0;
    }
    let sum: i64 = courses.iter().map(|c| c.completion_percentage).sum();
    sum as f64 / courses.len() as f64
}

pub fn completion_rates(courses: &[CourseAnalytics]) -> Vec<CompletionRate> {
    courses
        .iter()
        .map(|c| CompletionRate {
            course_row_id: c.course_row_id,
            rate: c.completion_percentage,
        })
        .collect()
}

/// Pie-chart shape: one slice per course, valued by chapters completed.
pub fn course_distribution(courses: &[CourseAnalytics]) -> Vec<DistributionSlice> {
    courses
        .iter()
        .map(|c| DistributionSlice {
            name: format!("Course {}", c.course_row_id),
            value: c.chapters_completed,
        })
        .collect()
}

/// Consecutive-day run ending at the most recent study date. Any gap other
/// than exactly one calendar day breaks the run.
pub fn study_streak(sessions: &[SessionRecord]) -> StudyStreak {
    let mut dates: Vec<NaiveDate> = sessions.iter().map(|s| s.start_time.date_naive()).collect();
    dates.sort_unstable();
    dates.dedup();
    dates.reverse();

    let Some(latest) = dates.first().copied() else {
        return StudyStreak::default();
    };

    let mut streak_length = 1;
    for pair in dates.windows(2) {
        if pair[0] - pair[1] == Duration::days(1) {
            streak_length += 1;
        } else {
            break;
        }
    }
    StudyStreak {
        streak_length,
        last_active_date: latest.format("%Y-%m-%d").to_string(),
    }
}

/// Keeps the points whose bucketed date falls inside the inclusive range.
pub fn filter_by_date(points: &[StudyTimePoint], range: &DateRange) -> Vec<StudyTimePoint> {
    points
        .iter()
        .filter(|p| {
            NaiveDate::parse_from_str(&p.date, "%Y-%m-%d")
                .map(|d| {
                    let ts = d.and_time(NaiveTime::MIN).and_utc().timestamp();
                    ts >= range.start && ts <= range.end
                })
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Inputs handed to an insight engine, already aggregated.
pub struct InsightInputs<'a> {
    pub streak: &'a StudyStreak,
    pub courses: &'a [CourseAnalytics],
    pub sessions: &'a [SessionRecord],
}

/// Extension point for insight generation and pattern detection. There is
/// no real algorithm yet, so the default implementation returns fixed
/// copy; a real engine plugs in here.
pub trait InsightEngine: Send + Sync {
    fn insights(&self, inputs: &InsightInputs<'_>) -> Vec<LearningInsight>;
    fn patterns(&self, inputs: &InsightInputs<'_>) -> Vec<String>;
}

/// Default engine with the dashboard's placeholder copy.
pub struct StaticInsights;

impl InsightEngine for StaticInsights {
    fn insights(&self, _inputs: &InsightInputs<'_>) -> Vec<LearningInsight> {
        vec![
            LearningInsight {
                title: "Consistent Study".into(),
                description: "You have a strong study streak!".into(),
                kind: InsightKind::Strength,
            },
            LearningInsight {
                title: "Opportunity".into(),
                description: "Try to complete more chapters for higher progress.".into(),
                kind: InsightKind::Opportunity,
            },
        ]
    }

    fn patterns(&self, _inputs: &InsightInputs<'_>) -> Vec<String> {
        vec![
            "You study most on weekends.".into(),
            "Your average session duration is increasing.".into(),
        ]
    }
}
