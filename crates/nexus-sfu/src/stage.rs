//! Buffering stage between a publisher and its router's pump.
//!
//! ```text
//!   publisher.read_rtp ──▶ ingest ──push──▶ RetentionSet ──NACK──▶ feedback task ──▶ publisher
//!                            │
//!                            └──forward──▶ [packet queue] ──read_rtp──▶ router pump
//! ```
//!
//! Two tickers ride along: a periodic PLI for every video SSRC and a
//! periodic loss/bitrate report per retained stream.

use crate::buffer::{BufferStats, RetentionSet};
use crate::error::TransportError;
use crate::feedback::Feedback;
use crate::track::{MediaKind, TrackInfo};
use crate::transport::Transport;
use nexus_common::config::BufferConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use webrtc::rtp::packet::Packet;

const FEEDBACK_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct StageSettings {
    pub max_buffer_time_ms: u32,
    /// `None` disables the periodic key-frame request.
    pub pli_cycle: Option<Duration>,
    /// `None` disables the stats report.
    pub report_cycle: Option<Duration>,
    pub queue: usize,
}

impl StageSettings {
    /// `None` when buffering is switched off.
    pub fn from_config(config: &BufferConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        Some(Self {
            max_buffer_time_ms: config.max_buffer_time_ms,
            pli_cycle: (config.pli_cycle_secs > 0).then(|| Duration::from_secs(config.pli_cycle_secs)),
            report_cycle: (config.report_cycle_secs > 0)
                .then(|| Duration::from_secs(config.report_cycle_secs)),
            queue: config.queue,
        })
    }
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            max_buffer_time_ms: 1000,
            pli_cycle: Some(Duration::from_secs(1)),
            report_cycle: Some(Duration::from_secs(5)),
            queue: 1024,
        }
    }
}

pub struct BufferStage {
    key: String,
    buffers: Arc<RetentionSet>,
    packets: Mutex<mpsc::Receiver<Packet>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for BufferStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferStage")
            .field("key", &self.key)
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl BufferStage {
    /// Spawn the stage's tasks reading from `publisher`.
    pub fn start(
        key: &str,
        publisher: Arc<Transport>,
        tracks: &[TrackInfo],
        settings: &StageSettings,
    ) -> Arc<Self> {
        let buffers = Arc::new(RetentionSet::new(tracks, settings.max_buffer_time_ms));
        let (packet_tx, packet_rx) = mpsc::channel(settings.queue.max(1));
        let (nack_tx, nack_rx) = mpsc::channel(FEEDBACK_QUEUE);
        let shutdown = CancellationToken::new();

        tokio::spawn(ingest(
            key.to_owned(),
            publisher.clone(),
            buffers.clone(),
            packet_tx,
            nack_tx,
            shutdown.clone(),
        ));
        tokio::spawn(forward_feedback(
            key.to_owned(),
            publisher.clone(),
            nack_rx,
            shutdown.clone(),
        ));

        let video: Vec<u32> = tracks
            .iter()
            .filter(|t| t.kind == MediaKind::Video)
            .map(|t| t.ssrc)
            .collect();
        match settings.pli_cycle {
            Some(cycle) if !video.is_empty() => {
                tokio::spawn(request_key_frames(
                    key.to_owned(),
                    publisher,
                    video,
                    cycle,
                    shutdown.clone(),
                ));
            }
            _ => {}
        }
        if let Some(cycle) = settings.report_cycle {
            tokio::spawn(report(key.to_owned(), buffers.clone(), cycle, shutdown.clone()));
        }

        tracing::debug!(stream = %key, tracks = tracks.len(), "Buffering stage started");
        Arc::new(Self {
            key: key.to_owned(),
            buffers,
            packets: Mutex::new(packet_rx),
            shutdown,
        })
    }

    /// Next packet in arrival order; [`TransportError::Closed`] once the
    /// stage is stopped or its publisher is gone.
    pub async fn read_rtp(&self) -> Result<Packet, TransportError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TransportError::Closed),
            packet = async { self.packets.lock().await.recv().await } => {
                packet.ok_or(TransportError::Closed)
            }
        }
    }

    /// A retained packet, if it is still inside the window.
    pub fn get(&self, ssrc: u32, sequence_number: u16) -> Option<Packet> {
        self.buffers.get(ssrc, sequence_number)
    }

    /// Interval loss and bitrate per retained SSRC; resets the counters.
    pub fn stats(&self, elapsed: Duration) -> Vec<(u32, BufferStats)> {
        self.buffers.stats(elapsed)
    }

    pub fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        tracing::debug!(stream = %self.key, "Buffering stage stopped");
    }
}

impl Drop for BufferStage {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn ingest(
    key: String,
    publisher: Arc<Transport>,
    buffers: Arc<RetentionSet>,
    packets: mpsc::Sender<Packet>,
    nacks: mpsc::Sender<Feedback>,
    shutdown: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            r = publisher.read_rtp() => r,
        };
        let packet = match packet {
            Ok(p) => p,
            Err(TransportError::Closed) => break,
            Err(e) => {
                tracing::warn!(stream = %key, error = %e, "Publisher read failed");
                continue;
            }
        };

        if let Some(nack) = buffers.push(packet.clone()) {
            if let Err(mpsc::error::TrySendError::Full(_)) = nacks.try_send(nack) {
                tracing::debug!(stream = %key, "Feedback queue full, dropping NACK");
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            sent = packets.send(packet) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!(stream = %key, "Ingest stopped");
}

async fn forward_feedback(
    key: String,
    publisher: Arc<Transport>,
    mut nacks: mpsc::Receiver<Feedback>,
    shutdown: CancellationToken,
) {
    loop {
        let nack = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            nack = nacks.recv() => match nack {
                Some(n) => n,
                None => break,
            },
        };
        match publisher.write_rtcp(&[nack]).await {
            Ok(()) => {}
            Err(TransportError::Closed) => break,
            Err(e) => tracing::warn!(stream = %key, error = %e, "NACK write to publisher failed"),
        }
    }
}

async fn request_key_frames(
    key: String,
    publisher: Arc<Transport>,
    video: Vec<u32>,
    cycle: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + cycle, cycle);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let plis: Vec<Feedback> = video
        .iter()
        .map(|&media_ssrc| Feedback::PictureLoss { media_ssrc })
        .collect();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match publisher.write_rtcp(&plis).await {
            Ok(()) => {}
            Err(TransportError::Closed) => break,
            Err(e) => tracing::debug!(stream = %key, error = %e, "PLI write failed"),
        }
    }
}

async fn report(
    key: String,
    buffers: Arc<RetentionSet>,
    cycle: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + cycle, cycle);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = Instant::now();
        for (ssrc, stats) in buffers.stats(now - last) {
            tracing::info!(
                stream = %key,
                ssrc,
                received = stats.received,
                lost = stats.lost,
                lost_rate = stats.lost_rate,
                bitrate_kbps = stats.bitrate_kbps,
                "Stream stats"
            );
        }
        last = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockPeer, audio_track, rtp, video_track};

    fn settings() -> StageSettings {
        StageSettings {
            pli_cycle: None,
            ..StageSettings::default()
        }
    }

    #[tokio::test]
    async fn forwards_in_order_and_retains() {
        let publisher = Transport::new("pub", MockPeer::new());
        let stage = BufferStage::start("cam", publisher.clone(), &[audio_track(1000)], &settings());

        let feed = publisher.feed();
        for seq in 10..13 {
            feed.push_rtp(rtp(1000, seq, 1000));
        }
        for seq in 10..13 {
            assert_eq!(stage.read_rtp().await.unwrap().header.sequence_number, seq);
        }
        assert!(stage.get(1000, 11).is_some());
        assert!(stage.get(1000, 13).is_none());
        stage.stop();
    }

    #[tokio::test]
    async fn detected_loss_is_nacked_upstream() {
        let peer = MockPeer::new();
        let publisher = Transport::new("pub", peer.clone());
        let stage = BufferStage::start("cam", publisher.clone(), &[audio_track(1000)], &settings());

        let feed = publisher.feed();
        for seq in (10..=27u16).filter(|&s| s != 13) {
            feed.push_rtp(rtp(1000, seq, 1000));
        }
        for _ in 0..17 {
            stage.read_rtp().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(peer.sent(), vec![Feedback::nack_one(1000, 13)]);
        stage.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn video_gets_periodic_pli() {
        let peer = MockPeer::new();
        let publisher = Transport::new("pub", peer.clone());
        let settings = StageSettings {
            pli_cycle: Some(Duration::from_secs(1)),
            ..StageSettings::default()
        };
        let stage = BufferStage::start(
            "cam",
            publisher,
            &[audio_track(1000), video_track(2000)],
            &settings,
        );

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let sent = peer.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|f| *f == Feedback::PictureLoss { media_ssrc: 2000 }));
        stage.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_ends_reads() {
        let publisher = Transport::new("pub", MockPeer::new());
        let stage = BufferStage::start("cam", publisher, &[audio_track(1)], &settings());
        stage.stop();
        stage.stop();
        assert!(matches!(stage.read_rtp().await, Err(TransportError::Closed)));
    }

    #[test]
    fn disabled_config_has_no_stage() {
        let config = BufferConfig {
            enabled: false,
            max_buffer_time_ms: 1000,
            pli_cycle_secs: 0,
            report_cycle_secs: 5,
            queue: 16,
        };
        assert!(StageSettings::from_config(&config).is_none());

        let enabled = BufferConfig {
            enabled: true,
            ..config
        };
        let settings = StageSettings::from_config(&enabled).unwrap();
        assert_eq!(settings.pli_cycle, None);
        assert_eq!(settings.queue, 16);
    }
}
