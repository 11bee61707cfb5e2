//! Post endpoints: list/detail with embedded replies, and regenerate

use std::collections::HashMap;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;

use crate::AppState;
use crate::domain::posts::{self, PostWithAccount};
use crate::domain::replies::{self, Reply};
use crate::services::error::LogErr;
use crate::services::generation::{self, GenerationError};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/posts", get(list_posts))
        .route("/api/posts/{id}", get(get_post))
        .route("/api/posts/{id}/regenerate", post(regenerate_replies))
}

// ============================================================================
// DTOs
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ReplyResponse {
    pub id: i64,
    pub post_id: i64,
    pub reply_text: String,
    pub reply_index: i32,
    pub model_used: String,
    pub is_favorite: bool,
    pub was_used: bool,
    pub generated_at: DateTime<Utc>,
}

impl From<Reply> for ReplyResponse {
    fn from(reply: Reply) -> Self {
        ReplyResponse {
            id: reply.id,
            post_id: reply.post_id,
            reply_text: reply.reply_text,
            reply_index: reply.reply_index,
            model_used: reply.model_used,
            is_favorite: reply.is_favorite,
            was_used: reply.was_used,
            generated_at: reply.generated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PostResponse {
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
    pub replies: Vec<ReplyResponse>,
}

fn post_response(post: PostWithAccount, post_replies: Vec<Reply>) -> PostResponse {
    PostResponse {
        id: post.id,
        account_id: post.account_id,
        batch_id: post.batch_id,
        account_username: post.account_username,
        account_display_name: post.account_display_name,
        account_profile_image_url: post.account_profile_image_url,
        external_post_id: post.external_post_id,
        post_url: post.post_url,
        text_content: post.text_content,
        has_media: post.has_media,
        media_urls: post.media_urls,
        media_local_paths: post.media_local_paths,
        post_type: post.post_type,
        posted_at: post.posted_at,
        scraped_at: post.scraped_at,
        llm_status: post.llm_status,
        llm_error: post.llm_error,
        replies: post_replies.into_iter().map(ReplyResponse::from).collect(),
    }
}

/// Attach each post's replies (one batch query, grouped by post id)
pub async fn build_post_responses(
    db: &PgPool,
    page: Vec<PostWithAccount>,
) -> Result<Vec<PostResponse>, sqlx::Error> {
    let post_ids: Vec<i64> = page.iter().map(|p| p.id).collect();
    let mut by_post: HashMap<i64, Vec<Reply>> = HashMap::new();
    for reply in replies::list_for_posts(db, &post_ids).await? {
        by_post.entry(reply.post_id).or_default().push(reply);
    }

    Ok(page
        .into_iter()
        .map(|p| {
            let post_replies = by_post.remove(&p.id).unwrap_or_default();
            post_response(p, post_replies)
        })
        .collect())
}

#[derive(Debug, Serialize)]
pub struct PostListResponse {
    pub posts: Vec<PostResponse>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListPostsQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    /// Comma-separated account ids
    pub account_ids: Option<String>,
    pub batch_id: Option<i64>,
    pub post_type: Option<String>,
    pub search: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/posts - List posts newest-first with optional filters
async fn list_posts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListPostsQuery>,
) -> Result<Json<PostListResponse>, StatusCode> {
    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(20).clamp(1, 100);

    let account_ids = match params.account_ids.as_deref() {
        Some(raw) => Some(parse_id_list(raw).ok_or(StatusCode::UNPROCESSABLE_ENTITY)?),
        None => None,
    };
    // an empty list means "no filter", matching the other optional filters
    let account_ids = account_ids.filter(|ids| !ids.is_empty());

    let (page_rows, total) = posts::list_posts_with_count(
        &state.db,
        account_ids.as_deref(),
        params.batch_id,
        params.post_type.as_deref(),
        params.search.as_deref(),
        per_page,
        (page - 1) * per_page,
    )
    .await
    .log_500("Failed to list posts")?;

    let responses = build_post_responses(&state.db, page_rows)
        .await
        .log_500("Failed to load replies for posts")?;

    Ok(Json(PostListResponse {
        posts: responses,
        total,
        page,
        per_page,
    }))
}

/// GET /api/posts/:id - Single post with replies
async fn get_post(
    State(state): State<Arc<AppState>>,
    Path(post_id): Path<i64>,
) -> Result<Json<PostResponse>, StatusCode> {
    let post = posts::get_post(&state.db, post_id)
        .await
        .log_500("Failed to load post")?
        .ok_or(StatusCode::NOT_FOUND)?;

    let post_replies = replies::list_for_post(&state.db, post_id)
        .await
        .log_500("Failed to load replies")?;

    Ok(Json(post_response(post, post_replies)))
}

/// POST /api/posts/:id/regenerate - Discard-and-replace reply generation.
/// Returns 409 while a generation is already in flight for the post
async fn regenerate_replies(
    State(state): State<Arc<AppState>>,
    Path(post_id): Path<i64>,
) -> Result<Json<PostResponse>, StatusCode> {
    let exists = posts::get_post(&state.db, post_id)
        .await
        .log_500("Failed to load post")?
        .is_some();
    if !exists {
        return Err(StatusCode::NOT_FOUND);
    }

    match generation::regenerate(&state, post_id).await {
        Ok(()) => {}
        Err(GenerationError::AlreadyProcessing) => return Err(StatusCode::CONFLICT),
        Err(GenerationError::Db(e)) => {
            return Err(e).log_500("Failed to start regeneration");
        }
    }

    // Re-read after the claim so the response reflects `processing`. The
    // previous replies remain until the new set lands atomically.
    let post = posts::get_post(&state.db, post_id)
        .await
        .log_500("Failed to reload post")?
        .ok_or(StatusCode::NOT_FOUND)?;
    let post_replies = replies::list_for_post(&state.db, post_id)
        .await
        .log_500("Failed to load replies")?;

    Ok(Json(post_response(post, post_replies)))
}

/// "1,2,3" -> ids; None on any unparseable entry
fn parse_id_list(raw: &str) -> Option<Vec<i64>> {
    let mut ids = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        ids.push(part.parse().ok()?);
    }
    Some(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_list() {
        assert_eq!(parse_id_list("1,2,3"), Some(vec![1, 2, 3]));
        assert_eq!(parse_id_list(" 7 , 8 "), Some(vec![7, 8]));
        assert_eq!(parse_id_list(""), Some(vec![]));
        assert_eq!(parse_id_list("1,x"), None);
    }
}
