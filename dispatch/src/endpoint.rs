use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;

use crate::api::{DispatchError, ResultsQuery, TestsQuery, TestsResponse};
use crate::result::MethodResult;
use crate::router::AppState;

/// Long-poll for the next test. The request parks with the matching queue
/// until a test is available or the run is over.
pub async fn get_tests(
    State(state): State<AppState>,
    Query(query): Query<TestsQuery>,
) -> Result<Json<TestsResponse>, DispatchError> {
    let scheduler = &state.scheduler;

    if scheduler.is_shutting_down() {
        scheduler.discard_outstanding(&query.runner);
        scheduler.maybe_stop();
        return Ok(Json(TestsResponse::finished()));
    }

    scheduler.check_revision(query.revision.as_deref())?;

    let response = match Arc::clone(scheduler).next_test(&query.runner).await {
        Some(test) => TestsResponse {
            class: Some(test.class_path),
            methods: Some(test.methods),
            finished: false,
        },
        None => TestsResponse::finished(),
    };

    scheduler.discard_outstanding(&query.runner);
    scheduler.maybe_stop();
    Ok(Json(response))
}

/// Accept one result. The runner counts as outstanding from here until its
/// next `/tests` request, even if the result itself is rejected.
pub async fn post_results(
    State(state): State<AppState>,
    Query(query): Query<ResultsQuery>,
    Json(result): Json<MethodResult>,
) -> Result<&'static str, DispatchError> {
    let scheduler = &state.scheduler;
    scheduler.mark_outstanding(&query.runner);
    scheduler.record_result(&query.runner, result)?;
    Ok("kthx")
}
