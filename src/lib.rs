//! Study-session tracking and learning analytics: session lifecycle,
//! per-chapter and per-course progress, and chart-ready aggregations over
//! the persisted analytics tables.

pub mod aggregate;
pub mod db;
pub mod models;
pub mod routes;
pub mod store;
pub mod tracker;
