//! Settings endpoints - the singleton configuration row
//!
//! API keys are returned masked; a masked value sent back on update would
//! corrupt the stored key, so the UI only submits key fields the user edited.

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::AppState;
use crate::constants::{MAX_REPLIES_PER_POST, MIN_REPLIES_PER_POST};
use crate::domain::settings::{self, Settings};
use crate::services::error::LogErr;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/settings", get(get_settings).put(update_settings))
}

#[derive(Debug, Serialize)]
struct SettingsResponse {
    llm_model: String,
    system_prompt: String,
    replies_per_post: i32,
    openrouter_api_key: String,
    x_api_key: String,
}

impl From<Settings> for SettingsResponse {
    fn from(s: Settings) -> Self {
        SettingsResponse {
            llm_model: s.llm_model,
            system_prompt: s.system_prompt,
            replies_per_post: s.replies_per_post,
            openrouter_api_key: mask_key(&s.openrouter_api_key),
            x_api_key: mask_key(&s.x_api_key),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SettingsUpdate {
    llm_model: Option<String>,
    system_prompt: Option<String>,
    replies_per_post: Option<i32>,
    openrouter_api_key: Option<String>,
    x_api_key: Option<String>,
}

/// GET /api/settings
async fn get_settings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SettingsResponse>, StatusCode> {
    let current = settings::load(&state.db)
        .await
        .log_500("Failed to load settings")?;

    Ok(Json(current.into()))
}

/// PUT /api/settings - Partial update. The pipeline reads settings fresh on
/// every call, so changes apply to the next retrieval/generation immediately
async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SettingsUpdate>,
) -> Result<Json<SettingsResponse>, StatusCode> {
    let replies_per_post = req.replies_per_post.map(clamp_replies_per_post);

    let updated = settings::update(
        &state.db,
        req.llm_model.as_deref(),
        req.system_prompt.as_deref(),
        replies_per_post,
        req.openrouter_api_key.as_deref(),
        req.x_api_key.as_deref(),
    )
    .await
    .log_500("Failed to update settings")?;

    Ok(Json(updated.into()))
}

fn clamp_replies_per_post(value: i32) -> i32 {
    value.clamp(MIN_REPLIES_PER_POST, MAX_REPLIES_PER_POST)
}

/// "sk-or-v1-abcdef1234567890" -> "sk-or-v1...7890"
fn mask_key(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    if key.len() < 10 {
        return "***".to_string();
    }
    format!("{}...{}", &key[..8], &key[key.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key(""), "");
        assert_eq!(mask_key("short"), "***");
        assert_eq!(mask_key("sk-or-v1-abcdef1234567890"), "sk-or-v1...7890");
    }

    #[test]
    fn test_clamp_replies_per_post() {
        assert_eq!(clamp_replies_per_post(0), 1);
        assert_eq!(clamp_replies_per_post(10), 10);
        assert_eq!(clamp_replies_per_post(50), 20);
    }
}
