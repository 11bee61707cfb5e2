//! Retrieval batch domain - DB queries for the batch lifecycle
//!
//! A batch's status moves `running` -> `completed`/`failed` exactly once;
//! the guarded UPDATE in `finish_batch` enforces that at the storage layer.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Postgres};

use super::accounts::Account;

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

/// One execution of the retrieval pipeline
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Batch {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub since_at: Option<DateTime<Utc>>,
    pub until_at: Option<DateTime<Utc>>,
    pub status: String,
    pub error_message: Option<String>,
    pub post_count: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct BatchRowWithTotal {
    id: i64,
    created_at: DateTime<Utc>,
    since_at: Option<DateTime<Utc>>,
    until_at: Option<DateTime<Utc>>,
    status: String,
    error_message: Option<String>,
    post_count: i32,
    total_count: i64,
}

/// Insert a new batch in `running` status with the window as given
pub async fn insert_batch<'e, E>(
    executor: E,
    since_at: Option<DateTime<Utc>>,
    until_at: Option<DateTime<Utc>>,
) -> Result<Batch, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        INSERT INTO retrieval_batches (since_at, until_at, status)
        VALUES ($1, $2, 'running')
        RETURNING id, created_at, since_at, until_at, status, error_message, post_count
        "#,
    )
    .bind(since_at)
    .bind(until_at)
    .fetch_one(executor)
    .await
}

/// Associate an account with a batch
pub async fn add_batch_account<'e, E>(
    executor: E,
    batch_id: i64,
    account_id: i64,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("INSERT INTO retrieval_batch_accounts (batch_id, account_id) VALUES ($1, $2)")
        .bind(batch_id)
        .bind(account_id)
        .execute(executor)
        .await?;

    Ok(())
}

/// Get a batch by id
pub async fn get_batch<'e, E>(executor: E, batch_id: i64) -> Result<Option<Batch>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT id, created_at, since_at, until_at, status, error_message, post_count
        FROM retrieval_batches
        WHERE id = $1
        "#,
    )
    .bind(batch_id)
    .fetch_optional(executor)
    .await
}

/// List batches newest-first with pagination, returning total count in the
/// same query
pub async fn list_batches_with_count<'e, E>(
    executor: E,
    limit: i64,
    offset: i64,
) -> Result<(Vec<Batch>, i64), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows: Vec<BatchRowWithTotal> = sqlx::query_as(
        r#"
        SELECT id, created_at, since_at, until_at, status, error_message, post_count,
               COUNT(*) OVER() as total_count
        FROM retrieval_batches
        ORDER BY created_at DESC
        LIMIT $1 OFFSET $2
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(executor)
    .await?;

    let total = rows.first().map(|r| r.total_count).unwrap_or(0);
    let batches = rows
        .into_iter()
        .map(|r| Batch {
            id: r.id,
            created_at: r.created_at,
            since_at: r.since_at,
            until_at: r.until_at,
            status: r.status,
            error_message: r.error_message,
            post_count: r.post_count,
        })
        .collect();

    Ok((batches, total))
}

/// Accounts included in a batch
pub async fn accounts_for_batch<'e, E>(
    executor: E,
    batch_id: i64,
) -> Result<Vec<Account>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT a.id, a.username, a.display_name, a.x_user_id, a.profile_image_url,
               a.is_active, a.added_at, a.post_count
        FROM monitored_accounts a
        JOIN retrieval_batch_accounts rba ON rba.account_id = a.id
        WHERE rba.batch_id = $1
        ORDER BY a.username
        "#,
    )
    .bind(batch_id)
    .fetch_all(executor)
    .await
}

/// Live count of posts associated with a batch (the stored `post_count` is
/// only written at the terminal transition)
pub async fn count_posts_for_batch<'e, E>(executor: E, batch_id: i64) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE batch_id = $1")
        .bind(batch_id)
        .fetch_one(executor)
        .await?;

    Ok(count)
}

/// Move a batch to a terminal status (atomic - only succeeds while still
/// `running`, which keeps the status monotonic).
/// Returns true if the transition was applied
pub async fn finish_batch<'e, E>(
    executor: E,
    batch_id: i64,
    status: &str,
    error_message: Option<&str>,
    post_count: i32,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE retrieval_batches
        SET status = $2, error_message = $3, post_count = $4
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(batch_id)
    .bind(status)
    .bind(error_message)
    .bind(post_count)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// The `until_at` of the most recent completed batch, used as the default
/// `since` for the next retrieval
pub async fn latest_completed_until<'e, E>(
    executor: E,
) -> Result<Option<DateTime<Utc>>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar(
        r#"
        SELECT until_at FROM retrieval_batches
        WHERE status = 'completed' AND until_at IS NOT NULL
        ORDER BY until_at DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(executor)
    .await
}

/// Fail batches left `running` by a dead process (their tasks died with it,
/// so they could never reach a terminal status).
/// Returns the number of batches failed
pub async fn fail_interrupted_batches<'e, E>(executor: E) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE retrieval_batches
        SET status = 'failed', error_message = 'retrieval interrupted by restart'
        WHERE status = 'running'
        "#,
    )
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}
