//! repo_locks queries.
//!
//! Durable advisory read/write locks on (org, plan, branch). The conflict
//! rules live in one query (`lock_try_insert`) so every caller observes the
//! same compatibility matrix:
//!
//! | Acquiring        | Conflicts with                                   |
//! |------------------|--------------------------------------------------|
//! | write on branch  | any lock on that branch, any lock on the root    |
//! | write on root    | any lock anywhere on the plan                    |
//! | read on branch   | write on that branch, write on the root          |
//! | read on root     | any write anywhere on the plan                   |
//!
//! Rows whose heartbeat is older than the stale threshold are eligible for
//! reaping and are ignored (and swept) by the acquire path.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pdk_schemas::LockScope;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RepoLockRow {
    pub id: Uuid,
    pub org_id: String,
    pub plan_id: String,
    /// None for a lock on the plan root.
    pub branch: Option<String>,
    pub scope: LockScope,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRepoLock {
    pub org_id: String,
    pub plan_id: String,
    /// None locks the plan root.
    pub branch: Option<String>,
    pub scope: LockScope,
    pub reason: String,
}

/// Outcome of a single (non-retrying) acquire attempt.
#[derive(Debug, Clone)]
pub enum LockAttempt {
    Acquired(Uuid),
    /// A non-stale conflicting lock exists; `cause` describes it for the
    /// eventual timeout error.
    Conflict { cause: String },
}

fn row_to_lock(row: &sqlx::postgres::PgRow) -> Result<RepoLockRow> {
    Ok(RepoLockRow {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        plan_id: row.try_get("plan_id")?,
        branch: row.try_get("branch")?,
        scope: LockScope::parse(&row.try_get::<String, _>("scope")?)?,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
    })
}

/// One acquire attempt: sweep stale rows for the plan, check for conflicts,
/// insert if clear. The whole attempt runs in a transaction holding a
/// per-plan advisory lock, so two concurrent acquirers cannot both observe
/// "no conflict" and insert.
///
/// Retry/backoff on `Conflict` is the caller's job (pdk-locks).
pub async fn lock_try_insert(
    pool: &PgPool,
    new: &NewRepoLock,
    stale_secs: i64,
) -> Result<LockAttempt> {
    let mut tx = pool.begin().await.context("begin lock acquire tx")?;

    // Serialise acquire attempts per plan. Transaction-scoped: released on
    // commit or rollback, no cleanup path.
    sqlx::query("select pg_advisory_xact_lock(hashtext($1))")
        .bind(&new.plan_id)
        .execute(&mut *tx)
        .await
        .context("acquire per-plan advisory lock")?;

    // Stale rows are reap-eligible; sweep them here so a crashed holder
    // cannot block the plan for longer than the stale threshold.
    sqlx::query(
        r#"
        delete from repo_locks
        where plan_id = $1
          and last_heartbeat_at < now() - ($2 * interval '1 second')
        "#,
    )
    .bind(&new.plan_id)
    .bind(stale_secs as f64)
    .execute(&mut *tx)
    .await
    .context("sweep stale locks for plan")?;

    // Conflict matrix in one predicate:
    //   - reads conflict only with writes ($3 = 'write' or scope = 'write')
    //   - a NULL branch (root) on either side conflicts with everything on
    //     the plan; otherwise branches must match
    let conflict = sqlx::query(
        r#"
        select id, org_id, plan_id, branch, scope, reason, created_at, last_heartbeat_at
        from repo_locks
        where plan_id = $1
          and ($3 = 'write' or scope = 'write')
          and ($2::text is null or branch is null or branch = $2)
        order by created_at asc
        limit 1
        "#,
    )
    .bind(&new.plan_id)
    .bind(&new.branch)
    .bind(new.scope.as_str())
    .fetch_optional(&mut *tx)
    .await
    .context("lock conflict query failed")?;

    if let Some(row) = conflict {
        let held = row_to_lock(&row)?;
        tx.rollback().await.context("rollback on lock conflict")?;
        let held_on = match &held.branch {
            Some(b) => format!("branch '{b}'"),
            None => "plan root".to_string(),
        };
        return Ok(LockAttempt::Conflict {
            cause: format!(
                "{} lock held on {} (reason: {})",
                held.scope, held_on, held.reason
            ),
        });
    }

    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        insert into repo_locks (id, org_id, plan_id, branch, scope, reason)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(id)
    .bind(&new.org_id)
    .bind(&new.plan_id)
    .bind(&new.branch)
    .bind(new.scope.as_str())
    .bind(&new.reason)
    .execute(&mut *tx)
    .await
    .context("insert repo lock failed")?;

    tx.commit().await.context("commit lock acquire tx")?;
    Ok(LockAttempt::Acquired(id))
}

/// Refresh a lock's heartbeat. Returns false when the row is gone (reaped);
/// the caller must stop heartbeating and must not re-insert.
pub async fn lock_touch_heartbeat(pool: &PgPool, id: Uuid) -> Result<bool> {
    let affected = sqlx::query(
        r#"
        update repo_locks
        set last_heartbeat_at = now()
        where id = $1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await
    .context("lock heartbeat update failed")?
    .rows_affected();

    Ok(affected > 0)
}

/// Delete a lock row. Idempotent: deleting an already-released lock is fine.
pub async fn lock_delete(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("delete from repo_locks where id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("lock delete failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ReapedLock {
    pub id: Uuid,
    pub plan_id: String,
}

/// Remove stale locks for an org; returns what was removed for audit.
pub async fn locks_reap_stale(
    pool: &PgPool,
    org_id: &str,
    older_than_secs: i64,
) -> Result<Vec<ReapedLock>> {
    let rows = sqlx::query(
        r#"
        delete from repo_locks
        where org_id = $1
          and last_heartbeat_at < now() - ($2 * interval '1 second')
        returning id, plan_id
        "#,
    )
    .bind(org_id)
    .bind(older_than_secs as f64)
    .fetch_all(pool)
    .await
    .context("locks_reap_stale failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(ReapedLock {
            id: row.try_get("id")?,
            plan_id: row.try_get("plan_id")?,
        });
    }
    Ok(out)
}

/// List locks for an org (optionally narrowed to one plan), oldest first.
/// Staleness is judged by the caller against `last_heartbeat_at`.
pub async fn locks_list(
    pool: &PgPool,
    org_id: &str,
    plan_id: Option<&str>,
) -> Result<Vec<RepoLockRow>> {
    let rows = sqlx::query(
        r#"
        select id, org_id, plan_id, branch, scope, reason, created_at, last_heartbeat_at
        from repo_locks
        where org_id = $1
          and ($2::text is null or plan_id = $2)
        order by created_at asc
        "#,
    )
    .bind(org_id)
    .bind(plan_id)
    .fetch_all(pool)
    .await
    .context("locks_list failed")?;

    rows.iter().map(row_to_lock).collect()
}
