//! SFU-specific errors.

use nexus_common::error::NexusError;

/// Failures on a single transport (one side of a peer connection).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Track not found for SSRC {0}")]
    TrackNotFound(u32),

    #[error("Track already registered for SSRC {0}")]
    DuplicateTrack(u32),

    #[error("Transport closed")]
    Closed,

    #[error("Write failed: {0}")]
    Write(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SfuError {
    #[error("SDP negotiation failed: {0}")]
    Negotiation(String),

    #[error("No compatible codec in offer")]
    NoCompatibleCodec,

    #[error("Stream {0} has no publisher")]
    NoPublisher(String),

    #[error("Stream {0} already has a publisher")]
    AlreadyPublished(String),

    #[error("Router not found: {0}")]
    RouterNotFound(String),

    #[error("Subscriber not found: {0}")]
    SubscriberNotFound(String),

    #[error("Router {0} is closed")]
    RouterClosed(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("WebRTC error: {0}")]
    Rtc(#[from] webrtc::Error),
}

impl From<SfuError> for NexusError {
    fn from(err: SfuError) -> Self {
        match err {
            SfuError::Negotiation(_) | SfuError::NoCompatibleCodec | SfuError::Rtc(_) => {
                NexusError::Negotiation {
                    message: err.to_string(),
                }
            }
            SfuError::NoPublisher(key) | SfuError::RouterNotFound(key) => NexusError::NotFound {
                resource: format!("Stream {key}"),
            },
            SfuError::SubscriberNotFound(id) => NexusError::NotFound {
                resource: format!("Subscriber {id}"),
            },
            SfuError::RouterClosed(key) => NexusError::NotFound {
                resource: format!("Stream {key}"),
            },
            SfuError::AlreadyPublished(key) => NexusError::AlreadyExists {
                resource: format!("Publisher for {key}"),
            },
            SfuError::Transport(e) => NexusError::Internal(anyhow::Error::new(e)),
        }
    }
}

pub type SfuResult<T> = Result<T, SfuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sfu_errors_map_to_http_errors() {
        let e: NexusError = SfuError::NoCompatibleCodec.into();
        assert_eq!(e.error_code(), "NEGOTIATION_FAILED");

        let e: NexusError = SfuError::NoPublisher("cam".into()).into();
        assert_eq!(e.error_code(), "NOT_FOUND");

        let e: NexusError = SfuError::AlreadyPublished("cam".into()).into();
        assert_eq!(e.error_code(), "ALREADY_EXISTS");
    }
}
