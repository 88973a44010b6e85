pub mod middleware;
pub mod rest;
pub mod state;

use axum::{
    middleware as axum_middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

pub use middleware::require_auth;
use rest::{
    create_story_handler, create_user_handler, get_user_handler, health_handler,
    latest_story_handler, list_stories_handler, mark_story_read_handler, prompt_handler,
    update_config_handler, update_subscription_handler,
};
use state::AppState;

/// Builds the REST router. Everything except the health probe requires a bearer token.
pub fn api_router(app_state: Arc<AppState>) -> Router {
    // Public routes (no auth required)
    let public_routes = Router::new().route("/", get(health_handler));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/user", post(create_user_handler).get(get_user_handler))
        .route("/user/config", put(update_config_handler))
        .route("/user/subscription", put(update_subscription_handler))
        .route("/story", post(create_story_handler))
        .route("/story/latest", get(latest_story_handler))
        .route("/story/{story_id}/read", post(mark_story_read_handler))
        .route("/stories", get(list_stories_handler))
        .route("/prompt", post(prompt_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(app_state)
}
