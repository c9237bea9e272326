//! HTTP surface for the transfer agent: a liveness/version check plus the
//! `/ws` upgrade into the UI event broadcast. See `SPEC_FULL.md` §6.

pub mod health;

use crate::repository::FileRepository;
use crate::storage::StorageMonitor;
use crate::ui::{UiEvent, UiState};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRef, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub ui_state: Arc<UiState>,
    pub repository: FileRepository,
    pub storage_monitor: Arc<StorageMonitor>,
}

impl FromRef<AppState> for Arc<UiState> {
    fn from_ref(state: &AppState) -> Self {
        state.ui_state.clone()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        .route("/ws", get(ws_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Upgrades to a WebSocket and sends one `initial_state` snapshot (all records,
/// current storage status) before relaying the broadcast stream, per
/// `SPEC_FULL.md` §6.
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let records = state.repository.get_all().await;
    let storage = state.storage_monitor.snapshot().await;
    let initial = UiEvent::InitialState { records, storage };
    ws.on_upgrade(move |socket| crate::ui::handle_socket(socket, state.ui_state.clone(), Some(initial)))
}
