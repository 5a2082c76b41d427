use std::env;
use std::str::FromStr;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

pub type Db = Pool<Sqlite>;

pub async fn connect() -> Result<Db> {
    let url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://studytrack.db".into());
    let opts = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
    Ok(SqlitePoolOptions::new().connect_with(opts).await?)
}

/// Fresh in-memory database with the migrations applied. Pinned to a
/// single connection: every SQLite `:memory:` connection is its own
/// database.
pub async fn open_in_memory() -> Result<Db> {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(opts)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}
