//! Stream lifecycle events: shared between the SFU engine and the server binary.
//!
//! The engine reports streams it tore down on its own (liveness sweep), and the
//! server forwards them to connected signaling clients so they can drop the
//! stream from their rooms.

use serde::{Deserialize, Serialize};

/// Event broadcast to signaling clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The stream's router was closed and removed; subscribers should leave.
    StreamRemoved { key: String },
}
