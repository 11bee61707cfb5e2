//! Monitored account endpoints

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::AppState;
use crate::domain::accounts::{self, Account};
use crate::services::error::LogErr;
use crate::services::source::SourceUser;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/accounts", get(list_accounts).post(create_account))
        .route("/api/accounts/bulk", post(bulk_create_accounts))
        .route(
            "/api/accounts/{id}",
            patch(update_account).delete(delete_account),
        )
}

// ============================================================================
// DTOs
// ============================================================================

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub id: i64,
    pub username: String,
    pub display_name: Option<String>,
    pub x_user_id: Option<String>,
    pub profile_image_url: Option<String>,
    pub added_at: DateTime<Utc>,
    pub is_active: bool,
    pub post_count: i64,
}

impl From<Account> for AccountResponse {
    fn from(account: Account) -> Self {
        AccountResponse {
            id: account.id,
            username: account.username,
            display_name: account.display_name,
            x_user_id: account.x_user_id,
            profile_image_url: account.profile_image_url,
            added_at: account.added_at,
            is_active: account.is_active,
            post_count: account.post_count,
        }
    }
}

#[derive(Debug, Serialize)]
struct AccountListResponse {
    accounts: Vec<AccountResponse>,
    total: i64,
    page: i64,
    per_page: i64,
}

#[derive(Debug, Deserialize)]
struct ListAccountsQuery {
    page: Option<i64>,
    per_page: Option<i64>,
    is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct AccountCreate {
    username: String,
}

#[derive(Debug, Deserialize)]
struct AccountBulkCreate {
    usernames: Vec<String>,
}

#[derive(Debug, Serialize)]
struct BulkCreateResult {
    username: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    account: Option<AccountResponse>,
}

#[derive(Debug, Serialize)]
struct AccountBulkResponse {
    results: Vec<BulkCreateResult>,
}

#[derive(Debug, Deserialize)]
struct AccountUpdate {
    is_active: Option<bool>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/accounts - List accounts with optional active filter
async fn list_accounts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListAccountsQuery>,
) -> Result<Json<AccountListResponse>, StatusCode> {
    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(50).clamp(1, 200);

    let (rows, total) = accounts::list_accounts_with_count(
        &state.db,
        params.is_active,
        per_page,
        (page - 1) * per_page,
    )
    .await
    .log_500("Failed to list accounts")?;

    Ok(Json(AccountListResponse {
        accounts: rows.into_iter().map(AccountResponse::from).collect(),
        total,
        page,
        per_page,
    }))
}

/// POST /api/accounts - Start monitoring a username. Resolution against the
/// source is best-effort; the account is created either way
async fn create_account(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AccountCreate>,
) -> Result<(StatusCode, Json<AccountResponse>), StatusCode> {
    let username = normalize_username(&req.username);
    if username.is_empty() {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    let existing = accounts::find_by_username(&state.db, &username)
        .await
        .log_500("Failed to check for existing account")?;
    if existing.is_some() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let resolved = resolve_best_effort(&state, &username).await;
    let account = accounts::insert_account(
        &state.db,
        &username,
        resolved.as_ref().map(|u| u.name.as_str()),
        resolved.as_ref().map(|u| u.id.as_str()),
        resolved.as_ref().and_then(|u| u.profile_image_url.as_deref()),
    )
    .await
    .log_500("Failed to create account")?;

    Ok((StatusCode::CREATED, Json(account.into())))
}

/// POST /api/accounts/bulk - Create several accounts with per-row outcomes
async fn bulk_create_accounts(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AccountBulkCreate>,
) -> Result<Json<AccountBulkResponse>, StatusCode> {
    let mut results = Vec::new();

    for raw in &req.usernames {
        let username = normalize_username(raw);
        if username.is_empty() {
            continue;
        }

        let existing = match accounts::find_by_username(&state.db, &username).await {
            Ok(row) => row,
            Err(e) => {
                results.push(BulkCreateResult {
                    username,
                    success: false,
                    error: Some(e.to_string()),
                    account: None,
                });
                continue;
            }
        };
        if existing.is_some() {
            results.push(BulkCreateResult {
                username,
                success: false,
                error: Some("already monitored".to_string()),
                account: None,
            });
            continue;
        }

        let resolved = resolve_best_effort(&state, &username).await;
        match accounts::insert_account(
            &state.db,
            &username,
            resolved.as_ref().map(|u| u.name.as_str()),
            resolved.as_ref().map(|u| u.id.as_str()),
            resolved.as_ref().and_then(|u| u.profile_image_url.as_deref()),
        )
        .await
        {
            Ok(account) => results.push(BulkCreateResult {
                username,
                success: true,
                error: None,
                account: Some(account.into()),
            }),
            Err(e) => results.push(BulkCreateResult {
                username,
                success: false,
                error: Some(e.to_string()),
                account: None,
            }),
        }
    }

    Ok(Json(AccountBulkResponse { results }))
}

/// PATCH /api/accounts/:id - Toggle the active flag
async fn update_account(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<i64>,
    Json(req): Json<AccountUpdate>,
) -> Result<Json<AccountResponse>, StatusCode> {
    let account = match req.is_active {
        Some(is_active) => accounts::set_active(&state.db, account_id, is_active)
            .await
            .log_500("Failed to update account")?,
        None => accounts::get_account(&state.db, account_id)
            .await
            .log_500("Failed to load account")?,
    };

    account
        .map(|a| Json(a.into()))
        .ok_or(StatusCode::NOT_FOUND)
}

/// DELETE /api/accounts/:id - Hard delete (posts cascade)
async fn delete_account(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    let deleted = accounts::delete_account(&state.db, account_id)
        .await
        .log_500("Failed to delete account")?;

    if !deleted {
        return Err(StatusCode::NOT_FOUND);
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Resolve a username against the source, logging and swallowing failures -
/// an unresolvable account can still be monitored and resolves later during
/// retrieval
async fn resolve_best_effort(state: &AppState, username: &str) -> Option<SourceUser> {
    let app_settings = match crate::domain::settings::load(&state.db).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to load settings for account resolution: {}", e);
            return None;
        }
    };
    if app_settings.x_api_key.is_empty() {
        return None;
    }

    match state.source.resolve_user(&app_settings.x_api_key, username).await {
        Ok(user) => Some(user),
        Err(e) => {
            tracing::warn!("Could not resolve @{}: {}", username, e);
            None
        }
    }
}

/// "@Alice " -> "alice"
fn normalize_username(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_username() {
        assert_eq!(normalize_username("@Alice"), "alice");
        assert_eq!(normalize_username("  bob  "), "bob");
        assert_eq!(normalize_username("@"), "");
        assert_eq!(normalize_username("MixedCase"), "mixedcase");
    }
}
