//! The outbound UI boundary: a broadcast channel of [`UiEvent`]s plus a thin
//! WebSocket upgrade handler that forwards every broadcast as JSON text.
//!
//! Modeled directly on the reference agent's own `ws::{WsEvent, WsState,
//! ws_handler}` broadcast pattern; the event set is replaced with the ones this
//! spec's UI boundary names (`SPEC_FULL.md` §6). Carries no inbound command
//! channel — this boundary is outbound-only.

use crate::event_bus::{BoxedHandler, EventBus};
use crate::model::{Event, EventKind, FileRecord, FileStatus};
use crate::storage::{StorageInfo, StorageStatus};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

const BROADCAST_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MountStatus {
    Attempting,
    Success,
    Failed,
    NotConfigured,
}

/// Every event the UI boundary can publish, per `SPEC_FULL.md` §6.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum UiEvent {
    #[serde(rename = "initial_state")]
    InitialState {
        records: Vec<FileRecord>,
        storage: Vec<StorageInfo>,
    },
    #[serde(rename = "file_update")]
    FileUpdate {
        path: String,
        old_status: Option<String>,
        new_status: String,
        record: FileRecord,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "storage_update")]
    StorageUpdate {
        side: &'static str,
        old_status: Option<StorageStatus>,
        new_status: StorageStatus,
        info: StorageInfo,
    },
    #[serde(rename = "mount_status")]
    MountStatus {
        share: String,
        status: MountStatus,
        error_message: Option<String>,
    },
    #[serde(rename = "statistics_update")]
    StatisticsUpdate {
        total_files: usize,
        completed_files: usize,
        failed_files: usize,
    },
}

#[derive(Clone)]
pub struct UiState {
    tx: broadcast::Sender<UiEvent>,
}

impl UiState {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn broadcast(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }
}

impl Default for UiState {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscribes `ui_state` to every `FileStatusChanged` event so the UI boundary
/// gets a `file_update` broadcast for each one, per `SPEC_FULL.md` §6. Call
/// once during startup, alongside `EventHandlers::register`.
pub async fn forward_file_updates(event_bus: &EventBus, ui_state: Arc<UiState>) {
    let handler: BoxedHandler = Arc::new(move |event| {
        let ui_state = ui_state.clone();
        Box::pin(async move {
            if let Event::FileStatusChanged {
                old_status,
                new_status,
                record,
                timestamp,
                ..
            } = event
            {
                ui_state.broadcast(UiEvent::FileUpdate {
                    path: record.path.to_string_lossy().to_string(),
                    old_status: Some(status_label(old_status)),
                    new_status: status_label(new_status),
                    record,
                    timestamp,
                });
            }
            Ok(())
        })
    });
    event_bus.subscribe(EventKind::FileStatusChanged, handler).await;
}

/// The same `SCREAMING_SNAKE_CASE` spelling `FileStatus`'s own serde impl uses,
/// so `old_status`/`new_status` read consistently with `record.status` in the
/// same JSON payload.
fn status_label(status: FileStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{status:?}"))
}

/// Bare broadcast relay with no initial snapshot — used where the caller has no
/// repository/storage state to hand (e.g. a minimal router built for tests).
/// The main binary instead wires `api::ws_handler`, which sends an
/// `initial_state` event first.
pub async fn ws_handler(
    State(ui_state): State<Arc<UiState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ui_state, None))
}

/// Forwards every broadcast `UiEvent` to `socket` as JSON text, closing on a
/// client disconnect or a lagged/closed broadcast channel. If `initial` is
/// given, it is sent once before the broadcast relay begins.
pub async fn handle_socket(mut socket: WebSocket, ui_state: Arc<UiState>, initial: Option<UiEvent>) {
    if let Some(event) = initial {
        let Ok(json) = serde_json::to_string(&event) else {
            return;
        };
        if socket.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    let mut rx = ui_state.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(json) = serde_json::to_string(&event) else { continue };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "UI client lagged, dropping buffered events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
