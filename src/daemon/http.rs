//! Internal RPC router
//!
//! Peers reach each other over these routes:
//! - `POST /internal/v1/txn/step` runs a step function on this node
//! - `GET /internal/v1/identity` tells a prospective peer who we are
//! - `GET /health`

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::transaction::rpc::{StepReply, StepRequest, IDENTITY_PATH, STEP_PATH};
use crate::transaction::{NodeIdentity, StepExecutor};
use axum::{extract::State, routing, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

/// Step requests carry the whole context, cap them generously
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

async fn run_step(
    State(executor): State<Arc<StepExecutor>>,
    Json(req): Json<StepRequest>,
) -> Json<StepReply> {
    let step = req.step.clone();
    let result = executor.execute(req).await;
    Json(StepReply::from_result(&step, result))
}

async fn identity(State(executor): State<Arc<StepExecutor>>) -> Json<NodeIdentity> {
    Json(executor.identity())
}

async fn health(State(executor): State<Arc<StepExecutor>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "node_id": executor.node_id(),
        "version": crate::VERSION,
    }))
}

pub fn create_router(executor: Arc<StepExecutor>) -> Router {
    Router::new()
        .route(STEP_PATH, routing::post(run_step))
        .route(IDENTITY_PATH, routing::get(identity))
        .route("/health", routing::get(health))
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(request_tracing_middleware))
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(executor)
}
