use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::endpoint;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

async fn index() -> &'static str {
    "dispatch"
}

pub fn router(scheduler: Arc<Scheduler>) -> Router {
    let state = AppState { scheduler };

    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/tests", get(endpoint::get_tests))
        .route("/results", post(endpoint::post_results))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
