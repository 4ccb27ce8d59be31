//! model_streams queries.
//!
//! The stream directory records which host currently owns the model stream
//! for a (plan, branch). At most one non-expired row exists per key across
//! the fleet; the claim protocol (advisory lock + existence check) enforces
//! this, not a DB constraint, because expired rows may linger until a reap
//! pass and must not block new claims.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ModelStreamRow {
    pub id: Uuid,
    pub org_id: String,
    pub plan_id: String,
    /// Empty string for the plan root (streams always target a concrete
    /// key, so no NULL here unlike repo_locks).
    pub branch: String,
    pub internal_ip: String,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewModelStream {
    pub org_id: String,
    pub plan_id: String,
    pub branch: String,
    pub internal_ip: String,
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone)]
pub enum StreamClaim {
    Claimed(Uuid),
    /// A non-expired record already exists; the row tells the caller which
    /// host owns the stream.
    Conflict(ModelStreamRow),
}

fn row_to_stream(row: &sqlx::postgres::PgRow) -> Result<ModelStreamRow> {
    Ok(ModelStreamRow {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        plan_id: row.try_get("plan_id")?,
        branch: row.try_get("branch")?,
        internal_ip: row.try_get("internal_ip")?,
        created_at: row.try_get("created_at")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
    })
}

/// Return the non-expired stream record for (plan, branch), if any.
pub async fn stream_find_active(
    pool: &PgPool,
    plan_id: &str,
    branch: &str,
    stale_secs: i64,
) -> Result<Option<ModelStreamRow>> {
    let row = sqlx::query(
        r#"
        select id, org_id, plan_id, branch, internal_ip, created_at, last_heartbeat_at
        from model_streams
        where plan_id = $1
          and branch = $2
          and last_heartbeat_at > now() - ($3 * interval '1 second')
        order by last_heartbeat_at desc
        limit 1
        "#,
    )
    .bind(plan_id)
    .bind(branch)
    .bind(stale_secs as f64)
    .fetch_optional(pool)
    .await
    .context("stream_find_active failed")?;

    row.as_ref().map(row_to_stream).transpose()
}

/// One claim attempt: under a per-key advisory lock, sweep expired rows for
/// the key, then insert unless a live row exists.
pub async fn stream_try_insert(
    pool: &PgPool,
    new: &NewModelStream,
    stale_secs: i64,
) -> Result<StreamClaim> {
    let mut tx = pool.begin().await.context("begin stream claim tx")?;

    sqlx::query("select pg_advisory_xact_lock(hashtext($1 || '|' || $2))")
        .bind(&new.plan_id)
        .bind(&new.branch)
        .execute(&mut *tx)
        .await
        .context("acquire per-stream advisory lock")?;

    sqlx::query(
        r#"
        delete from model_streams
        where plan_id = $1
          and branch = $2
          and last_heartbeat_at <= now() - ($3 * interval '1 second')
        "#,
    )
    .bind(&new.plan_id)
    .bind(&new.branch)
    .bind(stale_secs as f64)
    .execute(&mut *tx)
    .await
    .context("sweep expired stream rows")?;

    let existing = sqlx::query(
        r#"
        select id, org_id, plan_id, branch, internal_ip, created_at, last_heartbeat_at
        from model_streams
        where plan_id = $1 and branch = $2
        limit 1
        "#,
    )
    .bind(&new.plan_id)
    .bind(&new.branch)
    .fetch_optional(&mut *tx)
    .await
    .context("stream existence query failed")?;

    if let Some(row) = existing {
        let held = row_to_stream(&row)?;
        tx.rollback().await.context("rollback on stream conflict")?;
        return Ok(StreamClaim::Conflict(held));
    }

    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        insert into model_streams (id, org_id, plan_id, branch, internal_ip)
        values ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(id)
    .bind(&new.org_id)
    .bind(&new.plan_id)
    .bind(&new.branch)
    .bind(&new.internal_ip)
    .execute(&mut *tx)
    .await
    .context("insert model stream failed")?;

    tx.commit().await.context("commit stream claim tx")?;
    Ok(StreamClaim::Claimed(id))
}

/// Refresh a stream's heartbeat. Returns false when the row is gone
/// (reaped); the writer must stop and must not re-insert.
pub async fn stream_touch_heartbeat(pool: &PgPool, id: Uuid) -> Result<bool> {
    let affected = sqlx::query(
        r#"
        update model_streams
        set last_heartbeat_at = now()
        where id = $1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await
    .context("stream heartbeat update failed")?
    .rows_affected();

    Ok(affected > 0)
}

/// Delete a stream record. Idempotent.
pub async fn stream_delete(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("delete from model_streams where id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("stream delete failed")?;
    Ok(())
}

/// Remove expired stream records fleet-wide; returns removed ids.
pub async fn streams_reap_stale(pool: &PgPool, older_than_secs: i64) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"
        delete from model_streams
        where last_heartbeat_at < now() - ($1 * interval '1 second')
        returning id
        "#,
    )
    .bind(older_than_secs as f64)
    .fetch_all(pool)
    .await
    .context("streams_reap_stale failed")?;

    rows.iter()
        .map(|row| row.try_get("id").map_err(Into::into))
        .collect()
}

/// Count of non-expired streams for an org (diagnostics surface).
pub async fn streams_count_active(pool: &PgPool, org_id: &str, stale_secs: i64) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
        from model_streams
        where org_id = $1
          and last_heartbeat_at > now() - ($2 * interval '1 second')
        "#,
    )
    .bind(org_id)
    .bind(stale_secs as f64)
    .fetch_one(pool)
    .await
    .context("streams_count_active failed")?;

    Ok(n)
}
