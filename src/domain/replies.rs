//! Generated reply domain - DB queries for LLM reply candidates

use chrono::{DateTime, Utc};
use sqlx::{Executor, Postgres};

/// One LLM-generated candidate reply to a post
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Reply {
    pub id: i64,
    pub post_id: i64,
    pub reply_text: String,
    pub reply_index: i32,
    pub model_used: String,
    pub is_favorite: bool,
    pub was_used: bool,
    pub generated_at: DateTime<Utc>,
}

/// Delete all replies for a post (first half of the atomic replace that runs
/// inside the generation worker's transaction)
pub async fn delete_for_post<'e, E>(executor: E, post_id: i64) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query("DELETE FROM generated_replies WHERE post_id = $1")
        .bind(post_id)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

/// Insert one reply of a generation batch
pub async fn insert_reply<'e, E>(
    executor: E,
    post_id: i64,
    reply_index: i32,
    reply_text: &str,
    model_used: &str,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO generated_replies (post_id, reply_text, reply_index, model_used)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(post_id)
    .bind(reply_text)
    .bind(reply_index)
    .bind(model_used)
    .execute(executor)
    .await?;

    Ok(())
}

/// Replies for a post ordered by index
pub async fn list_for_post<'e, E>(executor: E, post_id: i64) -> Result<Vec<Reply>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT id, post_id, reply_text, reply_index, model_used,
               is_favorite, was_used, generated_at
        FROM generated_replies
        WHERE post_id = $1
        ORDER BY reply_index
        "#,
    )
    .bind(post_id)
    .fetch_all(executor)
    .await
}

/// Replies for a set of posts (batch fetch for list endpoints), ordered by
/// index within each post
pub async fn list_for_posts<'e, E>(
    executor: E,
    post_ids: &[i64],
) -> Result<Vec<Reply>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT id, post_id, reply_text, reply_index, model_used,
               is_favorite, was_used, generated_at
        FROM generated_replies
        WHERE post_id = ANY($1)
        ORDER BY post_id, reply_index
        "#,
    )
    .bind(post_ids)
    .fetch_all(executor)
    .await
}

/// Update the user-facing flags, returning the updated row
pub async fn update_flags<'e, E>(
    executor: E,
    reply_id: i64,
    is_favorite: Option<bool>,
    was_used: Option<bool>,
) -> Result<Option<Reply>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        UPDATE generated_replies
        SET is_favorite = COALESCE($2, is_favorite),
            was_used = COALESCE($3, was_used)
        WHERE id = $1
        RETURNING id, post_id, reply_text, reply_index, model_used,
                  is_favorite, was_used, generated_at
        "#,
    )
    .bind(reply_id)
    .bind(is_favorite)
    .bind(was_used)
    .fetch_optional(executor)
    .await
}
