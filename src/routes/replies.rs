//! Reply endpoints - user-facing flag updates

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::patch,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::AppState;
use crate::domain::replies;
use crate::routes::posts::ReplyResponse;
use crate::services::error::LogErr;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/replies/{id}", patch(update_reply))
}

#[derive(Debug, Deserialize)]
struct ReplyUpdate {
    is_favorite: Option<bool>,
    was_used: Option<bool>,
}

/// PATCH /api/replies/:id - Toggle favorite / used flags
async fn update_reply(
    State(state): State<Arc<AppState>>,
    Path(reply_id): Path<i64>,
    Json(req): Json<ReplyUpdate>,
) -> Result<Json<ReplyResponse>, StatusCode> {
    let reply = replies::update_flags(&state.db, reply_id, req.is_favorite, req.was_used)
        .await
        .log_500("Failed to update reply")?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(reply.into()))
}
