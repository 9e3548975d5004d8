//! HTTP signaling surface over the router registry.
//!
//! POST   /streams/{key}/publish                - Publish an offer, returns the answer
//! DELETE /streams/{key}                        - Unpublish and close the stream
//! POST   /streams/{key}/subscribers/{id}       - Subscribe an offer, returns the answer
//! DELETE /streams/{key}/subscribers/{id}       - Remove one subscriber
//! GET    /streams                              - Registry stats
//! GET    /events                               - WebSocket of stream lifecycle events

use crate::SfuServer;
use crate::router::RouterStats;
use crate::track::{PublishOptions, SubscribeOptions};
use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::Response,
    routing::{delete, get, post},
};
use futures_util::{SinkExt, StreamExt};
use nexus_common::error::{NexusError, NexusResult};
use nexus_common::gateway_event::StreamEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Shared by every signaling request.
#[derive(Clone)]
pub struct SignalingState {
    pub sfu: SfuServer,
    /// Lifecycle events fanned out to `/events` sockets.
    pub events: broadcast::Sender<StreamEvent>,
    /// Host written into ICE candidates; empty keeps the bound address.
    pub announced_ip: String,
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub sdp: String,
    #[serde(default)]
    pub options: PublishOptions,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub sdp: String,
    #[serde(default)]
    pub options: SubscribeOptions,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SdpAnswer {
    pub sdp: String,
}

/// Build the signaling router.
pub fn build_router(state: SignalingState) -> Router {
    Router::new()
        .route("/streams", get(list_streams))
        .route("/streams/{key}", delete(unpublish))
        .route("/streams/{key}/publish", post(publish))
        .route(
            "/streams/{key}/subscribers/{id}",
            post(subscribe).delete(unsubscribe),
        )
        .route("/events", get(events))
        .with_state(Arc::new(state))
}

fn require_sdp(sdp: &str) -> NexusResult<()> {
    if sdp.trim().is_empty() {
        return Err(NexusError::Validation {
            message: "sdp must not be empty".into(),
        });
    }
    Ok(())
}

// ============================================================
// POST /streams/{key}/publish
// ============================================================

async fn publish(
    State(state): State<Arc<SignalingState>>,
    Path(key): Path<String>,
    Json(body): Json<PublishRequest>,
) -> NexusResult<Json<SdpAnswer>> {
    require_sdp(&body.sdp)?;
    let publisher_id = uuid::Uuid::new_v4().to_string();
    let sdp = state
        .sfu
        .add_pub(&key, &body.sdp, &publisher_id, &state.announced_ip, &body.options)
        .await?;
    tracing::info!(stream = %key, publisher = %publisher_id, "Stream published");
    Ok(Json(SdpAnswer { sdp }))
}

// ============================================================
// DELETE /streams/{key}
// ============================================================

async fn unpublish(
    State(state): State<Arc<SignalingState>>,
    Path(key): Path<String>,
) -> NexusResult<StatusCode> {
    state.sfu.del_pub(&key).await?;
    let _ = state.events.send(StreamEvent::StreamRemoved { key });
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================
// POST /streams/{key}/subscribers/{id}
// ============================================================

async fn subscribe(
    State(state): State<Arc<SignalingState>>,
    Path((key, id)): Path<(String, String)>,
    Json(body): Json<SubscribeRequest>,
) -> NexusResult<Json<SdpAnswer>> {
    require_sdp(&body.sdp)?;
    let sdp = state
        .sfu
        .add_sub(&key, &body.sdp, &id, &state.announced_ip, &body.options)
        .await?;
    Ok(Json(SdpAnswer { sdp }))
}

// ============================================================
// DELETE /streams/{key}/subscribers/{id}
// ============================================================

async fn unsubscribe(
    State(state): State<Arc<SignalingState>>,
    Path((key, id)): Path<(String, String)>,
) -> NexusResult<StatusCode> {
    state.sfu.del_sub(&key, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_streams(State(state): State<Arc<SignalingState>>) -> Json<Vec<RouterStats>> {
    Json(state.sfu.stats().await)
}

// ============================================================
// GET /events
// ============================================================

async fn events(ws: WebSocketUpgrade, State(state): State<Arc<SignalingState>>) -> Response {
    let events = state.events.subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, events))
}

/// Push every lifecycle event to one socket until either side goes away.
async fn forward_events(socket: WebSocket, mut events: broadcast::Receiver<StreamEvent>) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event socket lagging, events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode stream event");
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!("Event socket closed");
}
