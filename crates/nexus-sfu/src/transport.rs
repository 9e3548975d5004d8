//! Transport: one side of one peer connection, as the router sees it.
//!
//! ```text
//!   backend receive tasks ──push──▶ [RTP queue]  ──read_rtp──▶ router pump
//!   backend RTCP readers  ──push──▶ [RTCP queue] ──read_rtcp─▶ repair task
//!   router ──write_rtp(ssrc)──▶ outbound track for that SSRC ──▶ peer
//!   router ──write_rtcp──────▶ peer session
//! ```
//!
//! ICE, DTLS, SRTP and SDP all live behind [`PeerSession`] and [`TrackWriter`];
//! the router only ever deals with RTP packets and [`Feedback`].

use crate::error::TransportError;
use crate::feedback::Feedback;
use crate::track::TrackInfo;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use webrtc::rtp::packet::Packet;

const RTP_QUEUE: usize = 1024;
const RTCP_QUEUE: usize = 128;

/// The negotiated connection behind a transport.
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Send feedback to the remote peer.
    async fn write_rtcp(&self, feedback: &[Feedback]) -> Result<(), TransportError>;

    /// Tear the connection down. Called at most once per transport.
    async fn close(&self) -> Result<(), TransportError>;
}

/// One outbound media track.
#[async_trait]
pub trait TrackWriter: Send + Sync {
    async fn write_rtp(&self, packet: &Packet) -> Result<(), TransportError>;
}

pub struct Transport {
    id: String,
    peer: Arc<dyn PeerSession>,
    /// Outbound tracks keyed by the SSRC of the packets routed to them.
    outbound: RwLock<HashMap<u32, Arc<dyn TrackWriter>>>,
    inbound: Arc<RwLock<HashMap<u32, TrackInfo>>>,
    rtp_tx: mpsc::Sender<Packet>,
    rtp_rx: Mutex<mpsc::Receiver<Packet>>,
    rtcp_tx: mpsc::Sender<Feedback>,
    rtcp_rx: Mutex<mpsc::Receiver<Feedback>>,
    write_errors: AtomicU32,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Transport {
    pub fn new(id: impl Into<String>, peer: Arc<dyn PeerSession>) -> Arc<Self> {
        let (rtp_tx, rtp_rx) = mpsc::channel(RTP_QUEUE);
        let (rtcp_tx, rtcp_rx) = mpsc::channel(RTCP_QUEUE);
        Arc::new(Self {
            id: id.into(),
            peer,
            outbound: RwLock::new(HashMap::new()),
            inbound: Arc::new(RwLock::new(HashMap::new())),
            rtp_tx,
            rtp_rx: Mutex::new(rtp_rx),
            rtcp_tx,
            rtcp_rx: Mutex::new(rtcp_rx),
            write_errors: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Producer handle for the backend's receive tasks.
    pub fn feed(&self) -> TransportFeed {
        TransportFeed {
            transport_id: self.id.clone(),
            rtp: self.rtp_tx.clone(),
            rtcp: self.rtcp_tx.clone(),
            inbound: self.inbound.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn add_inbound_track(&self, info: TrackInfo) -> Result<(), TransportError> {
        register_inbound(&self.inbound, info)
    }

    pub fn add_outbound_track(
        &self,
        ssrc: u32,
        writer: Arc<dyn TrackWriter>,
    ) -> Result<(), TransportError> {
        let mut outbound = self.outbound.write();
        if outbound.contains_key(&ssrc) {
            return Err(TransportError::DuplicateTrack(ssrc));
        }
        outbound.insert(ssrc, writer);
        Ok(())
    }

    pub fn inbound_tracks(&self) -> Vec<TrackInfo> {
        self.inbound.read().values().cloned().collect()
    }

    pub fn outbound_ssrcs(&self) -> Vec<u32> {
        self.outbound.read().keys().copied().collect()
    }

    /// Next inbound RTP packet. Returns [`TransportError::Closed`] once closed.
    pub async fn read_rtp(&self) -> Result<Packet, TransportError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TransportError::Closed),
            packet = async { self.rtp_rx.lock().await.recv().await } => {
                packet.ok_or(TransportError::Closed)
            }
        }
    }

    /// Next feedback received from the remote peer.
    pub async fn read_rtcp(&self) -> Result<Feedback, TransportError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TransportError::Closed),
            fb = async { self.rtcp_rx.lock().await.recv().await } => {
                fb.ok_or(TransportError::Closed)
            }
        }
    }

    /// Write to the outbound track registered for the packet's SSRC.
    pub async fn write_rtp(&self, packet: &Packet) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let ssrc = packet.header.ssrc;
        let track = self
            .outbound
            .read()
            .get(&ssrc)
            .cloned()
            .ok_or(TransportError::TrackNotFound(ssrc))?;
        track.write_rtp(packet).await
    }

    pub async fn write_rtcp(&self, feedback: &[Feedback]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.peer.write_rtcp(feedback).await
    }

    /// Count one more consecutive write failure; returns the new count.
    pub fn record_write_error(&self) -> u32 {
        self.write_errors.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_write_errors(&self) {
        self.write_errors.store(0, Ordering::Release);
    }

    pub fn write_errors(&self) -> u32 {
        self.write_errors.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the transport. Safe to call any number of times from any task;
    /// blocked readers observe [`TransportError::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        if let Err(e) = self.peer.close().await {
            tracing::warn!(transport = %self.id, error = %e, "Peer close failed");
        }
        tracing::debug!(transport = %self.id, "Transport closed");
    }
}

/// Backend-side handle that fills a transport's inbound queues.
#[derive(Clone)]
pub struct TransportFeed {
    transport_id: String,
    rtp: mpsc::Sender<Packet>,
    rtcp: mpsc::Sender<Feedback>,
    inbound: Arc<RwLock<HashMap<u32, TrackInfo>>>,
    shutdown: CancellationToken,
}

impl TransportFeed {
    /// Queue an inbound packet. Returns `false` once the transport is closed,
    /// which is the receive task's signal to stop.
    pub fn push_rtp(&self, packet: Packet) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        match self.rtp.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(p)) => {
                tracing::debug!(
                    transport = %self.transport_id,
                    ssrc = p.header.ssrc,
                    seq = p.header.sequence_number,
                    "RTP queue full, dropping packet"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn push_rtcp(&self, feedback: Feedback) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        match self.rtcp.try_send(feedback) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(transport = %self.transport_id, "RTCP queue full, dropping feedback");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn register_inbound(&self, info: TrackInfo) -> Result<(), TransportError> {
        register_inbound(&self.inbound, info)
    }

    /// Resolves when the transport is closed.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }
}

fn register_inbound(
    inbound: &RwLock<HashMap<u32, TrackInfo>>,
    info: TrackInfo,
) -> Result<(), TransportError> {
    let mut inbound = inbound.write();
    if inbound.contains_key(&info.ssrc) {
        return Err(TransportError::DuplicateTrack(info.ssrc));
    }
    inbound.insert(info.ssrc, info);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockPeer, RecordingTrack, audio_track, rtp};
    use std::time::Duration;

    #[tokio::test]
    async fn write_routes_by_ssrc() {
        let peer = MockPeer::new();
        let transport = Transport::new("sub-1", peer);
        let track = RecordingTrack::new();
        transport.add_outbound_track(1000, track.clone()).unwrap();

        transport.write_rtp(&rtp(1000, 1, 0)).await.unwrap();
        assert_eq!(track.sequence_numbers(), vec![1]);

        assert_eq!(
            transport.write_rtp(&rtp(2000, 1, 0)).await,
            Err(TransportError::TrackNotFound(2000))
        );
    }

    #[tokio::test]
    async fn ssrc_binds_to_one_track_per_direction() {
        let transport = Transport::new("t", MockPeer::new());
        transport
            .add_outbound_track(7, RecordingTrack::new())
            .unwrap();
        assert_eq!(
            transport.add_outbound_track(7, RecordingTrack::new()),
            Err(TransportError::DuplicateTrack(7))
        );

        transport.add_inbound_track(audio_track(7)).unwrap();
        assert_eq!(
            transport.feed().register_inbound(audio_track(7)),
            Err(TransportError::DuplicateTrack(7))
        );
    }

    #[tokio::test]
    async fn feed_delivers_in_order() {
        let transport = Transport::new("pub", MockPeer::new());
        let feed = transport.feed();
        for seq in 10..13 {
            assert!(feed.push_rtp(rtp(1000, seq, 1000)));
        }
        for seq in 10..13 {
            let p = transport.read_rtp().await.unwrap();
            assert_eq!(p.header.sequence_number, seq);
        }
        assert!(feed.push_rtcp(Feedback::PictureLoss { media_ssrc: 1000 }));
        assert_eq!(
            transport.read_rtcp().await.unwrap(),
            Feedback::PictureLoss { media_ssrc: 1000 }
        );
    }

    #[tokio::test]
    async fn close_unblocks_readers_and_is_idempotent() {
        let peer = MockPeer::new();
        let transport = Transport::new("pub", peer.clone());

        let reader = {
            let t = transport.clone();
            tokio::spawn(async move { t.read_rtp().await })
        };
        let rtcp_reader = {
            let t = transport.clone();
            tokio::spawn(async move { t.read_rtcp().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        tokio::join!(transport.close(), transport.close());
        transport.close().await;

        assert!(matches!(reader.await.unwrap(), Err(TransportError::Closed)));
        assert!(matches!(rtcp_reader.await.unwrap(), Err(TransportError::Closed)));
        assert_eq!(peer.close_count(), 1);
        assert!(!transport.feed().push_rtp(rtp(1, 1, 1)));
        assert_eq!(
            transport.write_rtp(&rtp(1, 1, 1)).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn write_error_counter() {
        let transport = Transport::new("t", MockPeer::new());
        assert_eq!(transport.record_write_error(), 1);
        assert_eq!(transport.record_write_error(), 2);
        transport.reset_write_errors();
        assert_eq!(transport.write_errors(), 0);
    }
}
