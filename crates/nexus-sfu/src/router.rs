//! Router: one publisher fanned out to many subscribers for a single stream key.
//!
//! ```text
//!                                   ┌──▶ [queue] ──▶ writer ──▶ subscriber A
//!   publisher ──▶ (stage) ──▶ pump ─┼──▶ [queue] ──▶ writer ──▶ subscriber B
//!                                   └──▶ [queue] ──▶ writer ──▶ subscriber C
//!
//!   subscriber RTCP ──▶ repair ──PLI──────────────────────────▶ publisher
//!                              ──NACK──▶ retained? ──yes──▶ resend to subscriber
//!                                                  ──no───▶ single-ID NACK to publisher
//! ```
//!
//! The pump never awaits a subscriber: each one owns a bounded queue and a
//! writer task, and a subscriber that keeps failing is evicted once its
//! consecutive write errors pass the configured ceiling.

use crate::buffer::BufferStats;
use crate::error::{SfuError, SfuResult, TransportError};
use crate::feedback::{Feedback, requested};
use crate::negotiate::{Negotiated, Negotiator};
use crate::stage::{BufferStage, StageSettings};
use crate::track::{PublishOptions, SubscribeOptions, TrackInfo};
use crate::transport::Transport;
use nexus_common::config::{BufferConfig, RouterConfig};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use webrtc::rtp::packet::Packet;

#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// How long a router stays alive after its last pumped packet.
    pub live_cycle: Duration,
    pub max_write_errors: u32,
    pub subscriber_queue: usize,
    /// A published router with no subscribers for longer than this is dead.
    pub subscriber_grace: Option<Duration>,
    /// `None` pumps straight from the publisher transport.
    pub buffer: Option<StageSettings>,
}

impl RouterSettings {
    pub fn from_config(router: &RouterConfig, buffer: &BufferConfig) -> Self {
        Self {
            live_cycle: router.live_cycle(),
            max_write_errors: router.max_write_errors,
            subscriber_queue: router.subscriber_queue,
            subscriber_grace: router.subscriber_grace(),
            buffer: StageSettings::from_config(buffer),
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            live_cycle: Duration::from_secs(6),
            max_write_errors: 100,
            subscriber_queue: 512,
            subscriber_grace: None,
            buffer: Some(StageSettings::default()),
        }
    }
}

/// Snapshot of one router for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub key: String,
    pub publisher: Option<String>,
    pub tracks: Vec<TrackInfo>,
    pub subscribers: Vec<String>,
    pub alive: bool,
}

struct Publisher {
    transport: Arc<Transport>,
    tracks: Vec<TrackInfo>,
    stage: Option<Arc<BufferStage>>,
}

struct Subscriber {
    transport: Arc<Transport>,
    queue: mpsc::Sender<Packet>,
    /// Publisher SSRCs this subscriber opted out of.
    skipped: HashSet<u32>,
}

enum PacketSource {
    Direct(Arc<Transport>),
    Buffered(Arc<BufferStage>),
}

impl PacketSource {
    async fn read_rtp(&self) -> Result<Packet, TransportError> {
        match self {
            PacketSource::Direct(transport) => transport.read_rtp().await,
            PacketSource::Buffered(stage) => stage.read_rtp().await,
        }
    }
}

pub struct Router {
    key: String,
    negotiator: Arc<dyn Negotiator>,
    settings: RouterSettings,
    publisher: RwLock<Option<Publisher>>,
    subscribers: RwLock<HashMap<String, Subscriber>>,
    deadline: Mutex<Instant>,
    /// When the subscriber map last became empty; cleared by the next subscriber.
    idle_since: Mutex<Option<Instant>>,
    stopped: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("key", &self.key)
            .field("subscribers", &self.subscribers.read().len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Router {
    pub fn new(
        key: impl Into<String>,
        negotiator: Arc<dyn Negotiator>,
        settings: RouterSettings,
    ) -> Arc<Self> {
        let deadline = Instant::now() + settings.live_cycle;
        Arc::new(Self {
            key: key.into(),
            negotiator,
            settings,
            publisher: RwLock::new(None),
            subscribers: RwLock::new(HashMap::new()),
            deadline: Mutex::new(deadline),
            idle_since: Mutex::new(None),
            stopped: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Attach the publisher and start pumping. Returns the SDP answer.
    pub async fn add_pub(
        self: &Arc<Self>,
        offer: &str,
        id: &str,
        host: &str,
        opts: &PublishOptions,
    ) -> SfuResult<String> {
        self.ensure_open()?;
        if self.publisher.read().is_some() {
            return Err(SfuError::AlreadyPublished(self.key.clone()));
        }

        let Negotiated {
            transport,
            answer,
            tracks,
        } = self.negotiator.publish(offer, id, host, opts).await?;

        let stage = self
            .settings
            .buffer
            .as_ref()
            .map(|s| BufferStage::start(&self.key, transport.clone(), &tracks, s));

        // Another publish may have won the race while this one negotiated.
        let rejected = {
            let mut slot = self.publisher.write();
            if self.is_stopped() {
                Some(SfuError::RouterClosed(self.key.clone()))
            } else if slot.is_some() {
                Some(SfuError::AlreadyPublished(self.key.clone()))
            } else {
                *slot = Some(Publisher {
                    transport: transport.clone(),
                    tracks: tracks.clone(),
                    stage: stage.clone(),
                });
                None
            }
        };
        if let Some(err) = rejected {
            if let Some(stage) = &stage {
                stage.stop();
            }
            transport.close().await;
            return Err(err);
        }

        let source = match stage {
            Some(stage) => PacketSource::Buffered(stage),
            None => PacketSource::Direct(transport),
        };
        tokio::spawn(self.clone().pump(source));

        tracing::info!(
            stream = %self.key,
            publisher = %id,
            tracks = tracks.len(),
            "Publisher attached"
        );
        Ok(answer)
    }

    /// Attach a subscriber to the current publisher. Returns the SDP answer.
    ///
    /// A subscriber already registered under `id` is replaced and closed.
    pub async fn add_sub(
        self: &Arc<Self>,
        offer: &str,
        id: &str,
        host: &str,
        opts: &SubscribeOptions,
    ) -> SfuResult<String> {
        self.ensure_open()?;
        let tracks = self
            .publisher
            .read()
            .as_ref()
            .map(|p| p.tracks.clone())
            .ok_or_else(|| SfuError::NoPublisher(self.key.clone()))?;

        let Negotiated {
            transport,
            answer,
            tracks: offered,
        } = self
            .negotiator
            .subscribe(offer, id, host, opts, &tracks)
            .await?;

        let skipped = tracks
            .iter()
            .map(|t| t.ssrc)
            .filter(|ssrc| !offered.iter().any(|o| o.ssrc == *ssrc))
            .collect();
        let (queue, queue_rx) = mpsc::channel(self.settings.subscriber_queue.max(1));

        let inserted = {
            let mut subscribers = self.subscribers.write();
            if self.is_stopped() {
                Err(())
            } else {
                let replaced = subscribers.insert(
                    id.to_owned(),
                    Subscriber {
                        transport: transport.clone(),
                        queue,
                        skipped,
                    },
                );
                *self.idle_since.lock() = None;
                Ok(replaced)
            }
        };
        let replaced = match inserted {
            Ok(replaced) => replaced,
            Err(()) => {
                transport.close().await;
                return Err(SfuError::RouterClosed(self.key.clone()));
            }
        };
        if let Some(old) = replaced {
            tracing::info!(stream = %self.key, subscriber = %id, "Replacing existing subscriber");
            old.transport.close().await;
        }

        tokio::spawn(
            self.clone()
                .write_loop(id.to_owned(), transport.clone(), queue_rx),
        );
        tokio::spawn(self.clone().repair_loop(id.to_owned(), transport));

        tracing::info!(
            stream = %self.key,
            subscriber = %id,
            tracks = offered.len(),
            "Subscriber attached"
        );
        Ok(answer)
    }

    pub async fn del_sub(&self, id: &str) -> SfuResult<()> {
        let removed = {
            let mut subscribers = self.subscribers.write();
            let removed = subscribers.remove(id);
            if removed.is_some() {
                self.mark_idle(&subscribers);
            }
            removed
        };
        let Some(subscriber) = removed else {
            return Err(SfuError::SubscriberNotFound(id.to_owned()));
        };
        subscriber.transport.close().await;
        tracing::info!(stream = %self.key, subscriber = %id, "Subscriber removed");
        Ok(())
    }

    pub async fn del_subs(&self) {
        let drained: Vec<Subscriber> = {
            let mut subscribers = self.subscribers.write();
            let drained = subscribers.drain().map(|(_, s)| s).collect::<Vec<_>>();
            if !drained.is_empty() {
                self.mark_idle(&subscribers);
            }
            drained
        };
        futures_util::future::join_all(drained.iter().map(|s| s.transport.close())).await;
    }

    /// Close the publisher and its buffering stage. Subscribers stay attached
    /// but receive nothing until a new publisher arrives.
    pub async fn del_pub(&self) {
        let publisher = self.publisher.write().take();
        let Some(publisher) = publisher else {
            return;
        };
        if let Some(stage) = &publisher.stage {
            stage.stop();
        }
        publisher.transport.close().await;
        tracing::info!(stream = %self.key, publisher = %publisher.transport.id(), "Publisher removed");
    }

    /// Stop everything. Idempotent.
    pub async fn close(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.del_pub().await;
        self.del_subs().await;
        tracing::info!(stream = %self.key, "Router closed");
    }

    pub fn alive(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        let now = Instant::now();
        if now >= *self.deadline.lock() {
            return false;
        }
        if let Some(grace) = self.settings.subscriber_grace {
            let idle_since = *self.idle_since.lock();
            if let Some(since) = idle_since {
                if now.duration_since(since) > grace {
                    return false;
                }
            }
        }
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn subscriber_ids(&self) -> Vec<String> {
        self.subscribers.read().keys().cloned().collect()
    }

    pub fn publisher_tracks(&self) -> Vec<TrackInfo> {
        self.publisher
            .read()
            .as_ref()
            .map(|p| p.tracks.clone())
            .unwrap_or_default()
    }

    /// Retention buffer statistics since the last read; empty when unbuffered.
    pub fn buffer_stats(&self, elapsed: Duration) -> Vec<(u32, BufferStats)> {
        let stage = self
            .publisher
            .read()
            .as_ref()
            .and_then(|p| p.stage.clone());
        stage.map(|s| s.stats(elapsed)).unwrap_or_default()
    }

    pub fn stats(&self) -> RouterStats {
        let (publisher, tracks) = match self.publisher.read().as_ref() {
            Some(p) => (Some(p.transport.id().to_owned()), p.tracks.clone()),
            None => (None, Vec::new()),
        };
        RouterStats {
            key: self.key.clone(),
            publisher,
            tracks,
            subscribers: self.subscriber_ids(),
            alive: self.alive(),
        }
    }

    fn ensure_open(&self) -> SfuResult<()> {
        if self.is_stopped() {
            return Err(SfuError::RouterClosed(self.key.clone()));
        }
        Ok(())
    }

    fn mark_idle(&self, subscribers: &HashMap<String, Subscriber>) {
        if subscribers.is_empty() {
            *self.idle_since.lock() = Some(Instant::now());
        }
    }

    fn refresh_deadline(&self) {
        *self.deadline.lock() = Instant::now() + self.settings.live_cycle;
    }

    fn upstream(&self) -> Option<(Arc<Transport>, Option<Arc<BufferStage>>)> {
        self.publisher
            .read()
            .as_ref()
            .map(|p| (p.transport.clone(), p.stage.clone()))
    }

    async fn pump(self: Arc<Self>, source: PacketSource) {
        loop {
            let read = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                r = source.read_rtp() => r,
            };
            match read {
                Ok(packet) => {
                    self.refresh_deadline();
                    self.fan_out(&packet);
                }
                Err(TransportError::Closed) => break,
                Err(e) => {
                    tracing::warn!(stream = %self.key, error = %e, "Publisher read failed");
                }
            }
        }
        tracing::debug!(stream = %self.key, "Pump stopped");
    }

    /// One pass over the subscriber map under its read lock; never blocks.
    fn fan_out(self: &Arc<Self>, packet: &Packet) {
        let ssrc = packet.header.ssrc;
        let mut evicted = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (id, subscriber) in subscribers.iter() {
                if subscriber.skipped.contains(&ssrc) {
                    continue;
                }
                match subscriber.queue.try_send(packet.clone()) {
                    Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let errors = subscriber.transport.record_write_error();
                        if errors > self.settings.max_write_errors {
                            evicted.push((id.clone(), subscriber.transport.clone()));
                        }
                    }
                }
            }
        }
        for (id, transport) in evicted {
            let router = self.clone();
            tokio::spawn(async move { router.evict(&id, &transport, "queue overflow").await });
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        id: String,
        transport: Arc<Transport>,
        mut queue: mpsc::Receiver<Packet>,
    ) {
        while let Some(packet) = queue.recv().await {
            match transport.write_rtp(&packet).await {
                Ok(()) => transport.reset_write_errors(),
                Err(TransportError::TrackNotFound(ssrc)) => {
                    tracing::warn!(stream = %self.key, subscriber = %id, ssrc, "No outbound track for SSRC");
                }
                Err(TransportError::Closed) => {
                    self.evict(&id, &transport, "transport closed").await;
                    break;
                }
                Err(e) => {
                    let errors = transport.record_write_error();
                    if errors > self.settings.max_write_errors {
                        tracing::warn!(stream = %self.key, subscriber = %id, errors, "Too many consecutive write failures");
                        self.evict(&id, &transport, "write errors").await;
                        break;
                    }
                    tracing::debug!(stream = %self.key, subscriber = %id, errors, error = %e, "RTP write failed");
                }
            }
        }
    }

    /// Remove `transport` if it is still the one registered under `id`, then close it.
    async fn evict(&self, id: &str, transport: &Arc<Transport>, reason: &'static str) {
        let removed = {
            let mut subscribers = self.subscribers.write();
            let current = subscribers
                .get(id)
                .is_some_and(|s| Arc::ptr_eq(&s.transport, transport));
            if current {
                subscribers.remove(id);
                self.mark_idle(&subscribers);
            }
            current
        };
        if removed {
            tracing::warn!(stream = %self.key, subscriber = %id, reason, "Evicting subscriber");
            transport.close().await;
        }
    }

    async fn repair_loop(self: Arc<Self>, id: String, transport: Arc<Transport>) {
        loop {
            let feedback = match transport.read_rtcp().await {
                Ok(feedback) => feedback,
                Err(TransportError::Closed) => break,
                Err(e) => {
                    tracing::debug!(stream = %self.key, subscriber = %id, error = %e, "RTCP read failed");
                    continue;
                }
            };
            self.repair(&id, &transport, feedback).await;
        }
        tracing::debug!(stream = %self.key, subscriber = %id, "Repair loop stopped");
    }

    async fn repair(&self, id: &str, transport: &Transport, feedback: Feedback) {
        let Some((publisher, stage)) = self.upstream() else {
            return;
        };
        let upstream = match feedback {
            Feedback::PictureLoss { .. } => vec![feedback],
            Feedback::Nack { media_ssrc, pairs } => {
                let mut missing = Vec::new();
                for pair in &pairs {
                    for sn in requested(pair) {
                        match stage.as_ref().and_then(|s| s.get(media_ssrc, sn)) {
                            Some(packet) => {
                                if let Err(e) = transport.write_rtp(&packet).await {
                                    tracing::debug!(stream = %self.key, subscriber = %id, seq = sn, error = %e, "Retransmission failed");
                                }
                            }
                            None => missing.push(Feedback::nack_one(media_ssrc, sn)),
                        }
                    }
                }
                missing
            }
        };
        if upstream.is_empty() {
            return;
        }
        if let Err(e) = publisher.write_rtcp(&upstream).await {
            tracing::debug!(stream = %self.key, error = %e, "Feedback to publisher failed");
        }
    }
}
