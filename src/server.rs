use std::sync::Arc;

use axum::{routing::post, Router};

use crate::bridge::BridgeClient;
use crate::db::Db;

pub mod submit;

/// Shared state of the inbound HTTP surface. The store handle is the same
/// pool the scheduler uses; submits run concurrently with chain follow.
pub struct AppState {
    pub db: Db,
    pub bridge: BridgeClient,
    pub network_magic: Option<i32>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/txs/signed", post(submit::submit_signed_tx))
        .with_state(state)
}
