// crates/pdk-db/src/lib.rs
//
// Postgres access for the two coordination tables, repo_locks and
// model_streams. Query functions live in the table modules; this file owns
// pool bootstrap, migrations, and the store-health view the diagnostics
// collaborator reads.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub const ENV_DB_URL: &str = "PDK_DATABASE_URL";

/// Lock acquisition already retries on its own clock; a pool checkout that
/// takes longer than this means the store is down, not busy.
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_MAX_CONNECTIONS: u32 = 10;

pub mod locks;
pub mod streams;

pub use locks::{
    lock_delete, lock_touch_heartbeat, lock_try_insert, locks_list, locks_reap_stale, LockAttempt,
    NewRepoLock, ReapedLock, RepoLockRow,
};
pub use streams::{
    stream_delete, stream_find_active, stream_touch_heartbeat, stream_try_insert,
    streams_count_active, streams_reap_stale, ModelStreamRow, NewModelStream, StreamClaim,
};

/// Open a pool against the coordination store.
pub async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(POOL_MAX_CONNECTIONS)
        .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
        .connect(url)
        .await
        .context("coordination store is unreachable")
}

/// Open a pool using the url in PDK_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("{ENV_DB_URL} is not set"))?;
    connect(&url).await
}

/// Apply the embedded coordination-table migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("coordination migrations failed")?;
    Ok(())
}

/// Health view of the coordination store: connectivity, schema presence per
/// table, and non-stale row counts. Feeds the diagnostics surface next to
/// `locks_list` and `streams_count_active`.
#[derive(Debug, Clone)]
pub struct CoordinationStatus {
    pub connected: bool,
    pub has_repo_locks: bool,
    pub has_model_streams: bool,
    /// Locks with a heartbeat inside the stale window; zero when the table
    /// is missing.
    pub live_locks: i64,
    /// Stream records with a heartbeat inside the stale window; zero when
    /// the table is missing.
    pub live_streams: i64,
}

pub async fn status(pool: &PgPool, stale_secs: i64) -> Result<CoordinationStatus> {
    let one: i32 = sqlx::query_scalar("select 1")
        .fetch_one(pool)
        .await
        .context("coordination store liveness probe failed")?;

    let present: Vec<String> = sqlx::query_scalar(
        r#"
        select table_name::text
        from information_schema.tables
        where table_schema = 'public'
          and table_name in ('repo_locks', 'model_streams')
        "#,
    )
    .fetch_all(pool)
    .await
    .context("coordination schema probe failed")?;

    let has_repo_locks = present.iter().any(|t| t == "repo_locks");
    let has_model_streams = present.iter().any(|t| t == "model_streams");

    let live_locks = if has_repo_locks {
        sqlx::query_scalar::<_, i64>(
            r#"
            select count(*)::bigint
            from repo_locks
            where last_heartbeat_at > now() - ($1 * interval '1 second')
            "#,
        )
        .bind(stale_secs as f64)
        .fetch_one(pool)
        .await
        .context("live lock count failed")?
    } else {
        0
    };

    let live_streams = if has_model_streams {
        sqlx::query_scalar::<_, i64>(
            r#"
            select count(*)::bigint
            from model_streams
            where last_heartbeat_at > now() - ($1 * interval '1 second')
            "#,
        )
        .bind(stale_secs as f64)
        .fetch_one(pool)
        .await
        .context("live stream count failed")?
    } else {
        0
    };

    Ok(CoordinationStatus {
        connected: one == 1,
        has_repo_locks,
        has_model_streams,
        live_locks,
        live_streams,
    })
}
