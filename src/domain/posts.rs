//! Post domain - DB queries for retrieved posts
//!
//! Two queries here are the pipeline's concurrency guards: the dedup insert
//! (`insert_post_if_absent`, backed by the unique constraint on
//! `(account_id, external_post_id)`) and the generation claim
//! (`claim_for_generation`, a compare-and-set on `llm_status`).

use chrono::{DateTime, Utc};
use sqlx::{Executor, Postgres};

/// A retrieved post joined with its owning account's display fields
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PostWithAccount {
    pub id: i64,
    pub account_id: i64,
    pub batch_id: Option<i64>,
    pub account_username: String,
    pub account_display_name: Option<String>,
    pub account_profile_image_url: Option<String>,
    pub external_post_id: String,
    pub post_url: String,
    pub text_content: Option<String>,
    pub has_media: bool,
    pub media_urls: Option<serde_json::Value>,
    pub media_local_paths: Option<serde_json::Value>,
    pub post_type: String,
    pub posted_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
    pub llm_status: String,
    pub llm_error: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct PostRowWithTotal {
    id: i64,
    account_id: i64,
    batch_id: Option<i64>,
    account_username: String,
    account_display_name: Option<String>,
    account_profile_image_url: Option<String>,
    external_post_id: String,
    post_url: String,
    text_content: Option<String>,
    has_media: bool,
    media_urls: Option<serde_json::Value>,
    media_local_paths: Option<serde_json::Value>,
    post_type: String,
    posted_at: DateTime<Utc>,
    scraped_at: DateTime<Utc>,
    llm_status: String,
    llm_error: Option<String>,
    total_count: i64,
}

impl PostRowWithTotal {
    fn into_post(self) -> PostWithAccount {
        PostWithAccount {
            id: self.id,
            account_id: self.account_id,
            batch_id: self.batch_id,
            account_username: self.account_username,
            account_display_name: self.account_display_name,
            account_profile_image_url: self.account_profile_image_url,
            external_post_id: self.external_post_id,
            post_url: self.post_url,
            text_content: self.text_content,
            has_media: self.has_media,
            media_urls: self.media_urls,
            media_local_paths: self.media_local_paths,
            post_type: self.post_type,
            posted_at: self.posted_at,
            scraped_at: self.scraped_at,
            llm_status: self.llm_status,
            llm_error: self.llm_error,
        }
    }
}

const POST_SELECT: &str = r#"
    SELECT p.id, p.account_id, p.batch_id,
           a.username AS account_username,
           a.display_name AS account_display_name,
           a.profile_image_url AS account_profile_image_url,
           p.external_post_id, p.post_url, p.text_content, p.has_media,
           p.media_urls, p.media_local_paths, p.post_type,
           p.posted_at, p.scraped_at, p.llm_status, p.llm_error
    FROM posts p
    JOIN monitored_accounts a ON a.id = p.account_id
"#;

/// Fields for a new post row
#[derive(Debug)]
pub struct NewPost<'a> {
    pub account_id: i64,
    pub batch_id: i64,
    pub external_post_id: &'a str,
    pub post_url: &'a str,
    pub text_content: Option<&'a str>,
    pub media_urls: &'a [String],
    pub media_local_paths: &'a [String],
    pub post_type: &'a str,
    pub posted_at: DateTime<Utc>,
}

/// Check whether the dedup key already exists (cheap pre-check so callers can
/// skip media downloads; the unique constraint remains the real guard)
pub async fn post_exists<'e, E>(
    executor: E,
    account_id: i64,
    external_post_id: &str,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM posts WHERE account_id = $1 AND external_post_id = $2",
    )
    .bind(account_id)
    .bind(external_post_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.is_some())
}

/// Insert a post unless its dedup key is already present.
/// Returns the new post id, or None if another writer got there first
pub async fn insert_post_if_absent<'e, E>(
    executor: E,
    post: &NewPost<'_>,
) -> Result<Option<i64>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let media_urls = (!post.media_urls.is_empty()).then(|| serde_json::json!(post.media_urls));
    let media_local_paths =
        (!post.media_local_paths.is_empty()).then(|| serde_json::json!(post.media_local_paths));

    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO posts (account_id, batch_id, external_post_id, post_url,
                           text_content, has_media, media_urls, media_local_paths,
                           post_type, posted_at, llm_status)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending')
        ON CONFLICT (account_id, external_post_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(post.account_id)
    .bind(post.batch_id)
    .bind(post.external_post_id)
    .bind(post.post_url)
    .bind(post.text_content)
    .bind(!post.media_urls.is_empty())
    .bind(media_urls)
    .bind(media_local_paths)
    .bind(post.post_type)
    .bind(post.posted_at)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|(id,)| id))
}

/// Get a post with account fields
pub async fn get_post<'e, E>(
    executor: E,
    post_id: i64,
) -> Result<Option<PostWithAccount>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let query = format!("{POST_SELECT} WHERE p.id = $1");

    sqlx::query_as(&query).bind(post_id).fetch_optional(executor).await
}

/// List posts newest-first with optional filters and pagination, returning
/// the total count in the same query
pub async fn list_posts_with_count<'e, E>(
    executor: E,
    account_ids: Option<&[i64]>,
    batch_id: Option<i64>,
    post_type: Option<&str>,
    search: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<(Vec<PostWithAccount>, i64), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows: Vec<PostRowWithTotal> = sqlx::query_as(
        r#"
        SELECT p.id, p.account_id, p.batch_id,
               a.username AS account_username,
               a.display_name AS account_display_name,
               a.profile_image_url AS account_profile_image_url,
               p.external_post_id, p.post_url, p.text_content, p.has_media,
               p.media_urls, p.media_local_paths, p.post_type,
               p.posted_at, p.scraped_at, p.llm_status, p.llm_error,
               COUNT(*) OVER() as total_count
        FROM posts p
        JOIN monitored_accounts a ON a.id = p.account_id
        WHERE ($1::bigint[] IS NULL OR p.account_id = ANY($1))
          AND ($2::bigint IS NULL OR p.batch_id = $2)
          AND ($3::text IS NULL OR p.post_type = $3)
          AND ($4::text IS NULL OR p.text_content ILIKE '%' || $4 || '%')
        ORDER BY p.posted_at DESC
        LIMIT $5 OFFSET $6
        "#,
    )
        .bind(account_ids)
        .bind(batch_id)
        .bind(post_type)
        .bind(search)
        .bind(limit)
        .bind(offset)
        .fetch_all(executor)
        .await?;

    let total = rows.first().map(|r| r.total_count).unwrap_or(0);
    Ok((rows.into_iter().map(PostRowWithTotal::into_post).collect(), total))
}

/// All posts belonging to a batch, newest-first
pub async fn list_posts_for_batch<'e, E>(
    executor: E,
    batch_id: i64,
) -> Result<Vec<PostWithAccount>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let query = format!("{POST_SELECT} WHERE p.batch_id = $1 ORDER BY p.posted_at DESC");

    sqlx::query_as(&query).bind(batch_id).fetch_all(executor).await
}

/// Claim a post for reply generation (single-flight compare-and-set).
/// Only `pending`/`completed`/`failed` posts can move to `processing`; a
/// concurrent claimer sees `processing` and gets false. Each successful claim
/// starts a new attempt
pub async fn claim_for_generation<'e, E>(executor: E, post_id: i64) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE posts
        SET llm_status = 'processing', llm_error = NULL, llm_attempts = llm_attempts + 1
        WHERE id = $1 AND llm_status <> 'processing'
        "#,
    )
    .bind(post_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Mark the in-flight generation attempt completed (only valid from
/// `processing`; called inside the replace-replies transaction)
pub async fn mark_generation_completed<'e, E>(
    executor: E,
    post_id: i64,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE posts
        SET llm_status = 'completed', llm_error = NULL
        WHERE id = $1 AND llm_status = 'processing'
        "#,
    )
    .bind(post_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Mark the in-flight generation attempt failed with a reason
pub async fn mark_generation_failed<'e, E>(
    executor: E,
    post_id: i64,
    error: &str,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE posts
        SET llm_status = 'failed', llm_error = $2
        WHERE id = $1 AND llm_status = 'processing'
        "#,
    )
    .bind(post_id)
    .bind(error)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Startup recovery: posts left `processing` by a dead process can never be
/// claimed again (the CAS excludes `processing`), so move them back to
/// `pending` before re-enqueueing
pub async fn reset_stale_processing<'e, E>(executor: E) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result =
        sqlx::query("UPDATE posts SET llm_status = 'pending' WHERE llm_status = 'processing'")
            .execute(executor)
            .await?;

    Ok(result.rows_affected())
}

/// Ids of posts awaiting generation (startup recovery)
pub async fn pending_post_ids<'e, E>(executor: E) -> Result<Vec<i64>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar("SELECT id FROM posts WHERE llm_status = 'pending' ORDER BY id")
        .fetch_all(executor)
        .await
}
