use crate::errors::QueueError;
use crate::schema::Job;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Bumped whenever the `jobs` schema changes.
const SCHEMA_VERSION: i64 = 1;

const CREATE_JOBS_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS jobs (
        id              TEXT PRIMARY KEY NOT NULL,
        name            TEXT NOT NULL,
        payload         TEXT NOT NULL,
        data            TEXT NOT NULL,
        priority        INTEGER NOT NULL DEFAULT 0,
        active          INTEGER NOT NULL DEFAULT 0,
        timeout         INTEGER NOT NULL DEFAULT 25000,
        created         INTEGER NOT NULL,
        failed          INTEGER,
        next_valid_time INTEGER NOT NULL,
        retry_delay     INTEGER NOT NULL DEFAULT 0
    )
";

const CREATE_CLAIM_INDEX: &str = r"
    CREATE INDEX IF NOT EXISTS jobs_claim_order
    ON jobs (active, failed, next_valid_time, priority DESC, created ASC)
";

const JOB_COLUMNS: &str =
    "id, name, payload, data, priority, active, timeout, created, failed, next_valid_time, retry_delay";

/// One shared pool per database path for the lifetime of the process.
static POOLS: OnceLock<Mutex<HashMap<PathBuf, SqlitePool>>> = OnceLock::new();

fn pools() -> &'static Mutex<HashMap<PathBuf, SqlitePool>> {
    POOLS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Opens (or creates) the job database at `path` and returns the shared
/// pool, initializing it lazily on first use.
///
/// The pool is capped at a single connection: one scheduler instance is
/// cooperative, and a single connection serializes the claim transaction
/// against the per-job bookkeeping transactions.
pub(crate) async fn open(path: &Path) -> Result<SqlitePool, QueueError> {
    let mut pools = pools().lock().await;
    if let Some(pool) = pools.get(path) {
        return Ok(pool.clone());
    }

    debug!(path = %path.display(), "Opening job database…");
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    pools.insert(path.to_owned(), pool.clone());
    Ok(pool)
}

/// Drops the shared pool for `path` and closes its connections.
pub(crate) async fn close(path: &Path) {
    let pool = pools().lock().await.remove(path);
    if let Some(pool) = pool {
        pool.close().await;
    }
}

async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await?;
    if version < SCHEMA_VERSION {
        sqlx::query(CREATE_JOBS_TABLE).execute(pool).await?;
        sqlx::query(CREATE_CLAIM_INDEX).execute(pool).await?;
        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Inserts a freshly created job row.
pub(crate) async fn insert_job(
    tx: &mut Transaction<'_, Sqlite>,
    job: &Job,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO jobs (id, name, payload, data, priority, active, timeout, created, failed, next_valid_time, retry_delay) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&job.id)
    .bind(&job.name)
    .bind(&job.payload)
    .bind(&job.data)
    .bind(job.priority)
    .bind(job.active)
    .bind(job.timeout)
    .bind(job.created)
    .bind(job.failed)
    .bind(job.next_valid_time)
    .bind(job.retry_delay)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Finds claimable jobs: inactive, not terminally failed, past their
/// retry gate, optionally fitting a lifespan window and filtered by name.
///
/// Rows come back in claim order (`priority DESC, created ASC`).
pub(crate) async fn select_eligible(
    tx: &mut Transaction<'_, Sqlite>,
    now: i64,
    timeout_upper: Option<i64>,
    name: Option<&str>,
    limit: Option<i64>,
) -> Result<Vec<Job>, sqlx::Error> {
    let mut query = format!(
        "SELECT {JOB_COLUMNS} FROM jobs \
         WHERE active = 0 AND failed IS NULL AND next_valid_time <= ?"
    );

    if timeout_upper.is_some() {
        query.push_str(" AND timeout > 0 AND timeout < ?");
    }
    if name.is_some() {
        query.push_str(" AND name = ?");
    }
    query.push_str(" ORDER BY priority DESC, created ASC");
    if limit.is_some() {
        query.push_str(" LIMIT ?");
    }

    let mut query_builder = sqlx::query_as::<_, Job>(&query).bind(now);
    if let Some(upper) = timeout_upper {
        query_builder = query_builder.bind(upper);
    }
    if let Some(name) = name {
        query_builder = query_builder.bind(name);
    }
    if let Some(limit) = limit {
        query_builder = query_builder.bind(limit);
    }

    query_builder.fetch_all(&mut **tx).await
}

/// Flips a job's claimed flag inside the claim transaction.
pub(crate) async fn mark_active(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE jobs SET active = 1 WHERE id = ?")
        .bind(job_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Deletes a job that has successfully completed running.
pub(crate) async fn delete_successful_job(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(job_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Writes the bookkeeping for a failed attempt: updated `data`, released
/// claim, advanced retry gate, and the terminal-failure stamp if any.
pub(crate) async fn update_failed_job(
    tx: &mut Transaction<'_, Sqlite>,
    job: &Job,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE jobs SET data = ?, active = 0, failed = ?, next_valid_time = ? WHERE id = ?")
        .bind(&job.data)
        .bind(job.failed)
        .bind(job.next_valid_time)
        .bind(&job.id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Deletes the row with `id` if present.
pub(crate) async fn delete_job(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(job_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Number of rows routed to `name`.
pub(crate) async fn count_by_name(
    tx: &mut Transaction<'_, Sqlite>,
    name: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE name = ?")
        .bind(name)
        .fetch_one(&mut **tx)
        .await
}

/// Deletes every row routed to `name`.
pub(crate) async fn delete_by_name(
    tx: &mut Transaction<'_, Sqlite>,
    name: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM jobs WHERE name = ?")
        .bind(name)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Deletes every row in the queue.
pub(crate) async fn delete_all(tx: &mut Transaction<'_, Sqlite>) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM jobs").execute(&mut **tx).await?;
    Ok(())
}

/// All rows, oldest first.
pub(crate) async fn select_all(pool: &SqlitePool) -> Result<Vec<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created ASC"
    ))
    .fetch_all(pool)
    .await
}

/// All rows, read inside a transaction snapshot.
pub(crate) async fn select_all_tx(
    tx: &mut Transaction<'_, Sqlite>,
) -> Result<Vec<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created ASC"
    ))
    .fetch_all(&mut **tx)
    .await
}

/// The number of jobs that have failed at least once.
pub(crate) async fn failed_job_count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM jobs WHERE json_extract(data, '$.failedAttempts') IS NOT NULL",
    )
    .fetch_one(pool)
    .await
}
