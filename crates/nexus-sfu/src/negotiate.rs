//! The seam between the router and whatever turns an SDP offer into a live
//! [`Transport`].

use crate::error::SfuResult;
use crate::track::{PublishOptions, SubscribeOptions, TrackInfo};
use crate::transport::Transport;
use async_trait::async_trait;
use std::sync::Arc;

/// Result of a successful offer/answer exchange.
#[derive(Debug)]
pub struct Negotiated {
    pub transport: Arc<Transport>,
    pub answer: String,
    /// Publish: the tracks the publisher will send.
    /// Subscribe: the publisher tracks actually offered to the subscriber.
    pub tracks: Vec<TrackInfo>,
}

#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Negotiate a receive-only transport for a publisher.
    async fn publish(
        &self,
        offer: &str,
        id: &str,
        host: &str,
        opts: &PublishOptions,
    ) -> SfuResult<Negotiated>;

    /// Negotiate a send-only transport carrying `tracks` to a subscriber.
    ///
    /// Every outbound track must be registered on the transport before the
    /// answer is produced.
    async fn subscribe(
        &self,
        offer: &str,
        id: &str,
        host: &str,
        opts: &SubscribeOptions,
        tracks: &[TrackInfo],
    ) -> SfuResult<Negotiated>;
}
