//! Retrieval batch endpoints: create, list, detail, and window defaults

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::AppState;
use crate::constants::DEFAULT_LOOKBACK_HOURS;
use crate::domain::accounts::Account;
use crate::domain::batches::{self, Batch};
use crate::domain::posts;
use crate::routes::posts::{PostResponse, build_post_responses};
use crate::services::error::LogErr;
use crate::services::retrieval::{self, RetrievalError};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/retrievals/defaults", get(retrieval_defaults))
        .route("/api/retrievals", get(list_retrievals).post(create_retrieval))
        .route("/api/retrievals/{id}", get(get_retrieval))
}

// ============================================================================
// DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
struct RetrievalCreate {
    account_ids: Vec<i64>,
    since_at: Option<DateTime<Utc>>,
    until_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct RetrievalAccountInfo {
    id: i64,
    username: String,
    display_name: Option<String>,
    profile_image_url: Option<String>,
}

impl From<Account> for RetrievalAccountInfo {
    fn from(account: Account) -> Self {
        RetrievalAccountInfo {
            id: account.id,
            username: account.username,
            display_name: account.display_name,
            profile_image_url: account.profile_image_url,
        }
    }
}

#[derive(Debug, Serialize)]
struct RetrievalResponse {
    id: i64,
    created_at: DateTime<Utc>,
    since_at: Option<DateTime<Utc>>,
    until_at: Option<DateTime<Utc>>,
    status: String,
    error_message: Option<String>,
    accounts: Vec<RetrievalAccountInfo>,
    post_count: i64,
}

fn batch_response(batch: Batch, accounts: Vec<Account>, post_count: i64) -> RetrievalResponse {
    RetrievalResponse {
        id: batch.id,
        created_at: batch.created_at,
        since_at: batch.since_at,
        until_at: batch.until_at,
        status: batch.status,
        error_message: batch.error_message,
        accounts: accounts.into_iter().map(RetrievalAccountInfo::from).collect(),
        post_count,
    }
}

#[derive(Debug, Serialize)]
struct RetrievalDetailResponse {
    #[serde(flatten)]
    batch: RetrievalResponse,
    posts: Vec<PostResponse>,
}

#[derive(Debug, Serialize)]
struct RetrievalListResponse {
    retrievals: Vec<RetrievalResponse>,
    total: i64,
    page: i64,
    per_page: i64,
}

#[derive(Debug, Deserialize)]
struct ListRetrievalsQuery {
    page: Option<i64>,
    per_page: Option<i64>,
}

#[derive(Debug, Serialize)]
struct RetrievalDefaultsResponse {
    since_at: DateTime<Utc>,
    until_at: DateTime<Utc>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/retrievals/defaults - Suggested window for the next retrieval:
/// picks up where the last completed batch left off
async fn retrieval_defaults(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RetrievalDefaultsResponse>, StatusCode> {
    let now = Utc::now();
    let latest_until = batches::latest_completed_until(&state.db)
        .await
        .log_500("Failed to load retrieval defaults")?;

    Ok(Json(RetrievalDefaultsResponse {
        since_at: latest_until.unwrap_or(now - Duration::hours(DEFAULT_LOOKBACK_HOURS)),
        until_at: now,
    }))
}

/// POST /api/retrievals - Start a retrieval. Returns 201 with the batch in
/// `running` status; progress is observed by polling. Malformed requests
/// (empty set, unknown ids, inverted window) get 422 before any network call
async fn create_retrieval(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RetrievalCreate>,
) -> Result<(StatusCode, Json<RetrievalResponse>), StatusCode> {
    let (batch, accounts) =
        match retrieval::start_retrieval(&state, &req.account_ids, req.since_at, req.until_at)
            .await
        {
            Ok(created) => created,
            Err(RetrievalError::InvalidRequest(reason)) => {
                tracing::warn!("Rejected retrieval request: {}", reason);
                return Err(StatusCode::UNPROCESSABLE_ENTITY);
            }
            Err(RetrievalError::Db(e)) => return Err(e).log_500("Failed to create retrieval"),
        };

    Ok((
        StatusCode::CREATED,
        Json(batch_response(batch, accounts, 0)),
    ))
}

/// GET /api/retrievals - List batches newest-first
async fn list_retrievals(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListRetrievalsQuery>,
) -> Result<Json<RetrievalListResponse>, StatusCode> {
    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(20).clamp(1, 100);

    let (rows, total) =
        batches::list_batches_with_count(&state.db, per_page, (page - 1) * per_page)
            .await
            .log_500("Failed to list retrievals")?;

    let mut retrievals = Vec::with_capacity(rows.len());
    for batch in rows {
        let accounts = batches::accounts_for_batch(&state.db, batch.id)
            .await
            .log_500("Failed to load batch accounts")?;
        let post_count = batches::count_posts_for_batch(&state.db, batch.id)
            .await
            .log_500("Failed to count batch posts")?;
        retrievals.push(batch_response(batch, accounts, post_count));
    }

    Ok(Json(RetrievalListResponse {
        retrievals,
        total,
        page,
        per_page,
    }))
}

/// GET /api/retrievals/:id - Batch detail with its posts and their replies
async fn get_retrieval(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<i64>,
) -> Result<Json<RetrievalDetailResponse>, StatusCode> {
    let batch = batches::get_batch(&state.db, batch_id)
        .await
        .log_500("Failed to load retrieval")?
        .ok_or(StatusCode::NOT_FOUND)?;

    let accounts = batches::accounts_for_batch(&state.db, batch_id)
        .await
        .log_500("Failed to load batch accounts")?;

    let batch_posts = posts::list_posts_for_batch(&state.db, batch_id)
        .await
        .log_500("Failed to load batch posts")?;
    let post_count = batch_posts.len() as i64;

    let post_responses = build_post_responses(&state.db, batch_posts)
        .await
        .log_500("Failed to load replies for batch posts")?;

    Ok(Json(RetrievalDetailResponse {
        batch: batch_response(batch, accounts, post_count),
        posts: post_responses,
    }))
}
