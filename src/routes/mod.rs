pub mod accounts;
pub mod posts;
pub mod replies;
pub mod retrievals;
pub mod settings;

use axum::Router;
use std::sync::Arc;

use crate::AppState;

/// Build all routes for the API
pub fn build_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(accounts::routes())
        .merge(posts::routes())
        .merge(replies::routes())
        .merge(retrievals::routes())
        .merge(settings::routes())
}
