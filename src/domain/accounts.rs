//! Monitored account domain - DB queries for tracked accounts

use chrono::{DateTime, Utc};
use sqlx::{Executor, Postgres};

/// A tracked X/Twitter account
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub display_name: Option<String>,
    pub x_user_id: Option<String>,
    pub profile_image_url: Option<String>,
    pub is_active: bool,
    pub added_at: DateTime<Utc>,
    pub post_count: i64,
}

/// Account row with total count from window function
#[derive(Debug, sqlx::FromRow)]
struct AccountRowWithTotal {
    id: i64,
    username: String,
    display_name: Option<String>,
    x_user_id: Option<String>,
    profile_image_url: Option<String>,
    is_active: bool,
    added_at: DateTime<Utc>,
    post_count: i64,
    total_count: i64,
}

/// List accounts with optional active filter and pagination, returning the
/// total count in the same query
pub async fn list_accounts_with_count<'e, E>(
    executor: E,
    is_active: Option<bool>,
    limit: i64,
    offset: i64,
) -> Result<(Vec<Account>, i64), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows: Vec<AccountRowWithTotal> = sqlx::query_as(
        r#"
        SELECT id, username, display_name, x_user_id, profile_image_url,
               is_active, added_at, post_count,
               COUNT(*) OVER() as total_count
        FROM monitored_accounts
        WHERE ($1::boolean IS NULL OR is_active = $1)
        ORDER BY added_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(is_active)
    .bind(limit)
    .bind(offset)
    .fetch_all(executor)
    .await?;

    let total = rows.first().map(|r| r.total_count).unwrap_or(0);
    let accounts = rows
        .into_iter()
        .map(|r| Account {
            id: r.id,
            username: r.username,
            display_name: r.display_name,
            x_user_id: r.x_user_id,
            profile_image_url: r.profile_image_url,
            is_active: r.is_active,
            added_at: r.added_at,
            post_count: r.post_count,
        })
        .collect();

    Ok((accounts, total))
}

/// Get a single account by id
pub async fn get_account<'e, E>(executor: E, account_id: i64) -> Result<Option<Account>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT id, username, display_name, x_user_id, profile_image_url,
               is_active, added_at, post_count
        FROM monitored_accounts
        WHERE id = $1
        "#,
    )
    .bind(account_id)
    .fetch_optional(executor)
    .await
}

/// Get all accounts matching the given ids (missing ids are simply absent
/// from the result - the caller decides whether that is an error)
pub async fn get_accounts_by_ids<'e, E>(
    executor: E,
    account_ids: &[i64],
) -> Result<Vec<Account>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT id, username, display_name, x_user_id, profile_image_url,
               is_active, added_at, post_count
        FROM monitored_accounts
        WHERE id = ANY($1)
        "#,
    )
    .bind(account_ids)
    .fetch_all(executor)
    .await
}

/// Look up an account by its (lowercased) username
pub async fn find_by_username<'e, E>(
    executor: E,
    username: &str,
) -> Result<Option<Account>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT id, username, display_name, x_user_id, profile_image_url,
               is_active, added_at, post_count
        FROM monitored_accounts
        WHERE username = $1
        "#,
    )
    .bind(username)
    .fetch_optional(executor)
    .await
}

/// Insert a new monitored account
pub async fn insert_account<'e, E>(
    executor: E,
    username: &str,
    display_name: Option<&str>,
    x_user_id: Option<&str>,
    profile_image_url: Option<&str>,
) -> Result<Account, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        INSERT INTO monitored_accounts (username, display_name, x_user_id, profile_image_url)
        VALUES ($1, $2, $3, $4)
        RETURNING id, username, display_name, x_user_id, profile_image_url,
                  is_active, added_at, post_count
        "#,
    )
    .bind(username)
    .bind(display_name)
    .bind(x_user_id)
    .bind(profile_image_url)
    .fetch_one(executor)
    .await
}

/// Set the active flag, returning the updated row
pub async fn set_active<'e, E>(
    executor: E,
    account_id: i64,
    is_active: bool,
) -> Result<Option<Account>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        UPDATE monitored_accounts
        SET is_active = $2
        WHERE id = $1
        RETURNING id, username, display_name, x_user_id, profile_image_url,
                  is_active, added_at, post_count
        "#,
    )
    .bind(account_id)
    .bind(is_active)
    .fetch_optional(executor)
    .await
}

/// Hard-delete an account (cascades to its posts).
/// Returns true if a row was deleted
pub async fn delete_account<'e, E>(executor: E, account_id: i64) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query("DELETE FROM monitored_accounts WHERE id = $1")
        .bind(account_id)
        .execute(executor)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Backfill resolution data from the source (external user id, display name,
/// avatar). Only fills columns that are still NULL
pub async fn backfill_resolution<'e, E>(
    executor: E,
    account_id: i64,
    x_user_id: &str,
    display_name: Option<&str>,
    profile_image_url: Option<&str>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE monitored_accounts
        SET x_user_id = COALESCE(x_user_id, $2),
            display_name = COALESCE(display_name, $3),
            profile_image_url = COALESCE(profile_image_url, $4)
        WHERE id = $1
        "#,
    )
    .bind(account_id)
    .bind(x_user_id)
    .bind(display_name)
    .bind(profile_image_url)
    .execute(executor)
    .await?;

    Ok(())
}

/// Bump the denormalized post counter (called in the same transaction as a
/// post insert)
pub async fn increment_post_count<'e, E>(executor: E, account_id: i64) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("UPDATE monitored_accounts SET post_count = post_count + 1 WHERE id = $1")
        .bind(account_id)
        .execute(executor)
        .await?;

    Ok(())
}
