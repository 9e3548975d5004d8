//! # nexus-sfu
//!
//! Selective forwarding engine for Nexus.
//!
//! Architecture:
//! - One [`Router`] per stream key: one publisher, many subscribers
//! - The publisher's RTP goes through an optional buffering stage (retention
//!   window + NACK generation) and is fanned out without transcoding
//! - Subscriber PLIs go upstream; subscriber NACKs are served from the
//!   retention buffer first and only go upstream on a miss
//! - [`SfuServer`] keys routers by stream and sweeps dead ones, posting their
//!   keys on a bounded queue so signaling can tell participants

pub mod buffer;
pub mod error;
pub mod feedback;
pub mod handler;
pub mod negotiate;
pub mod router;
pub mod rtc;
pub mod stage;
pub mod track;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::{SfuError, SfuResult, TransportError};
pub use negotiate::{Negotiated, Negotiator};
pub use router::{Router, RouterSettings, RouterStats};
pub use rtc::RtcNegotiator;
pub use track::{PublishOptions, SubscribeOptions, TrackInfo};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Receiving end of the stream-removed queue.
pub type CleanedStreams = mpsc::Receiver<String>;

/// Router registry: stream key → router.
#[derive(Clone)]
pub struct SfuServer {
    routers: Arc<RwLock<HashMap<String, Arc<Router>>>>,
    negotiator: Arc<dyn Negotiator>,
    settings: RouterSettings,
    cleaned: mpsc::Sender<String>,
}

impl SfuServer {
    /// `cleaned_queue` bounds the stream-removed notifications not yet drained.
    pub fn new(
        negotiator: Arc<dyn Negotiator>,
        settings: RouterSettings,
        cleaned_queue: usize,
    ) -> (Self, CleanedStreams) {
        let (cleaned, cleaned_rx) = mpsc::channel(cleaned_queue.max(1));
        let server = Self {
            routers: Arc::new(RwLock::new(HashMap::new())),
            negotiator,
            settings,
            cleaned,
        };
        (server, cleaned_rx)
    }

    pub async fn get_or_new_router(&self, key: &str) -> Arc<Router> {
        // Fast path: router exists
        {
            let routers = self.routers.read().await;
            if let Some(router) = routers.get(key) {
                return router.clone();
            }
        }

        let mut routers = self.routers.write().await;
        if let Some(router) = routers.get(key) {
            return router.clone();
        }
        let router = Router::new(key, self.negotiator.clone(), self.settings.clone());
        routers.insert(key.to_owned(), router.clone());
        tracing::info!(stream = %key, "Router created");
        router
    }

    pub async fn get_router(&self, key: &str) -> Option<Arc<Router>> {
        self.routers.read().await.get(key).cloned()
    }

    /// Close and remove a router.
    pub async fn del_router(&self, key: &str) -> SfuResult<()> {
        let router = self.routers.write().await.remove(key);
        match router {
            Some(router) => {
                router.close().await;
                Ok(())
            }
            None => Err(SfuError::RouterNotFound(key.to_owned())),
        }
    }

    /// Publish `offer` under `key`, creating the router if needed.
    pub async fn add_pub(
        &self,
        key: &str,
        offer: &str,
        id: &str,
        host: &str,
        opts: &PublishOptions,
    ) -> SfuResult<String> {
        let router = self.get_or_new_router(key).await;
        match router.add_pub(offer, id, host, opts).await {
            Ok(answer) => Ok(answer),
            Err(e) => {
                self.forget_if_unused(key, &router).await;
                tracing::warn!(stream = %key, publisher = %id, error = %e, "Publish failed");
                Err(e)
            }
        }
    }

    /// Unpublish: closes the whole router so its subscribers are released too.
    pub async fn del_pub(&self, key: &str) -> SfuResult<()> {
        self.del_router(key).await
    }

    pub async fn add_sub(
        &self,
        key: &str,
        offer: &str,
        id: &str,
        host: &str,
        opts: &SubscribeOptions,
    ) -> SfuResult<String> {
        let router = self
            .get_router(key)
            .await
            .ok_or_else(|| SfuError::NoPublisher(key.to_owned()))?;
        router.add_sub(offer, id, host, opts).await
    }

    pub async fn del_sub(&self, key: &str, id: &str) -> SfuResult<()> {
        let router = self
            .get_router(key)
            .await
            .ok_or_else(|| SfuError::RouterNotFound(key.to_owned()))?;
        router.del_sub(id).await
    }

    /// One liveness pass. Dead routers are removed under the registry lock,
    /// then closed and reported after it is released. Returns the removed keys.
    pub async fn sweep(&self) -> Vec<String> {
        let dead: Vec<(String, Arc<Router>)> = {
            let mut routers = self.routers.write().await;
            let keys: Vec<String> = routers
                .iter()
                .filter(|(_, r)| !r.alive())
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| routers.remove(&k).map(|r| (k, r)))
                .collect()
        };

        let mut removed = Vec::with_capacity(dead.len());
        for (key, router) in dead {
            router.close().await;
            tracing::info!(stream = %key, "Router swept");
            match self.cleaned.try_send(key.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(stream = %key, "Cleaned-stream queue full, dropping notification");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(stream = %key, "Nobody listening for cleaned streams");
                }
            }
            removed.push(key);
        }
        removed
    }

    /// Run [`SfuServer::sweep`] every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = server.sweep().await;
                        if !removed.is_empty() {
                            tracing::debug!(count = removed.len(), "Sweep removed routers");
                        }
                    }
                }
            }
            tracing::debug!("Sweeper stopped");
        })
    }

    /// Per-router snapshots, ordered by key.
    pub async fn stats(&self) -> Vec<RouterStats> {
        let routers: Vec<Arc<Router>> = self.routers.read().await.values().cloned().collect();
        let mut stats: Vec<RouterStats> = routers.iter().map(|r| r.stats()).collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    /// Close every router. Used on process shutdown; nothing is reported.
    pub async fn shutdown(&self) {
        let routers: Vec<Arc<Router>> = self
            .routers
            .write()
            .await
            .drain()
            .map(|(_, r)| r)
            .collect();
        let count = routers.len();
        futures_util::future::join_all(routers.iter().map(|r| r.close())).await;
        tracing::info!(routers = count, "SFU shut down");
    }

    /// Drop a router that a failed publish left empty.
    async fn forget_if_unused(&self, key: &str, router: &Arc<Router>) {
        if !router.publisher_tracks().is_empty() || !router.subscriber_ids().is_empty() {
            return;
        }
        let mut routers = self.routers.write().await;
        if routers.get(key).is_some_and(|r| Arc::ptr_eq(r, router)) {
            routers.remove(key);
        }
    }
}
