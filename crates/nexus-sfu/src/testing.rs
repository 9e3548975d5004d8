//! In-memory peers, tracks and negotiator for unit tests.

use crate::error::{SfuResult, TransportError};
use crate::feedback::Feedback;
use crate::negotiate::{Negotiated, Negotiator};
use crate::track::{MediaKind, PublishOptions, SubscribeOptions, TrackInfo, parse_offer_tracks};
use crate::transport::{PeerSession, Transport, TrackWriter};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

pub(crate) const AUDIO_VIDEO_OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=sendonly\r\n\
a=msid:cam-stream mic-track\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=ssrc:1000 cname:pub\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97 102\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=sendonly\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=rtpmap:102 H264/90000\r\n\
a=fmtp:102 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f\r\n\
a=ssrc-group:FID 2000 2001\r\n\
a=ssrc:2000 msid:cam-stream cam-track\r\n\
a=ssrc:2001 msid:cam-stream cam-track\r\n";

/// One Opus section, SSRC 1000.
pub(crate) const AUDIO_OFFER: &str = "v=0\r\n\
o=- 4611731400430051337 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=sendonly\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=ssrc:1000 msid:mic-stream mic-track\r\n";

pub(crate) fn rtp(ssrc: u32, sequence_number: u16, timestamp: u32) -> Packet {
    Packet {
        header: Header {
            version: 2,
            payload_type: 111,
            sequence_number,
            timestamp,
            ssrc,
            ..Default::default()
        },
        payload: Bytes::from_static(&[0u8; 160]),
    }
}

pub(crate) fn audio_track(ssrc: u32) -> TrackInfo {
    TrackInfo {
        ssrc,
        payload_type: 111,
        codec: "audio/opus".into(),
        kind: MediaKind::Audio,
        clock_rate: 48_000,
        channels: 2,
        fmtp: "minptime=10;useinbandfec=1".into(),
        track_id: format!("audio-{ssrc}"),
        stream_id: "stream".into(),
    }
}

pub(crate) fn video_track(ssrc: u32) -> TrackInfo {
    TrackInfo {
        ssrc,
        payload_type: 96,
        codec: "video/VP8".into(),
        kind: MediaKind::Video,
        clock_rate: 90_000,
        channels: 0,
        fmtp: String::new(),
        track_id: format!("video-{ssrc}"),
        stream_id: "stream".into(),
    }
}

/// Records the feedback written to it and how often it was closed.
#[derive(Default)]
pub(crate) struct MockPeer {
    sent: Mutex<Vec<Feedback>>,
    closes: AtomicUsize,
}

impl MockPeer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn sent(&self) -> Vec<Feedback> {
        self.sent.lock().clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerSession for MockPeer {
    async fn write_rtcp(&self, feedback: &[Feedback]) -> Result<(), TransportError> {
        self.sent.lock().extend_from_slice(feedback);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records every packet written, or fails every write.
#[derive(Default)]
pub(crate) struct RecordingTrack {
    packets: Mutex<Vec<Packet>>,
    attempts: AtomicUsize,
    failing: bool,
}

impl RecordingTrack {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            failing: true,
            ..Self::default()
        })
    }

    pub(crate) fn packets(&self) -> Vec<Packet> {
        self.packets.lock().clone()
    }

    pub(crate) fn sequence_numbers(&self) -> Vec<u16> {
        self.packets
            .lock()
            .iter()
            .map(|p| p.header.sequence_number)
            .collect()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrackWriter for RecordingTrack {
    async fn write_rtp(&self, packet: &Packet) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(TransportError::Write("broken pipe".into()));
        }
        self.packets.lock().push(packet.clone());
        Ok(())
    }
}

/// Everything a test needs to drive one negotiated side by hand.
#[derive(Clone)]
pub(crate) struct MockSide {
    pub(crate) transport: Arc<Transport>,
    pub(crate) peer: Arc<MockPeer>,
    /// Shared by every outbound SSRC of a subscriber.
    pub(crate) track: Arc<RecordingTrack>,
}

/// Negotiator that skips ICE/DTLS entirely: publish parses the offer and
/// registers its tracks; subscribe binds one recording track per SSRC.
#[derive(Default)]
pub(crate) struct MockNegotiator {
    sides: Mutex<HashMap<String, MockSide>>,
    failing: Mutex<HashSet<String>>,
}

impl MockNegotiator {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribers negotiated under `id` get a track whose writes always fail.
    pub(crate) fn fail_writes_for(&self, id: &str) {
        self.failing.lock().insert(id.to_owned());
    }

    pub(crate) fn side(&self, id: &str) -> MockSide {
        match self.sides.lock().get(id) {
            Some(side) => side.clone(),
            None => panic!("no negotiated side {id}"),
        }
    }
}

#[async_trait]
impl Negotiator for MockNegotiator {
    async fn publish(
        &self,
        offer: &str,
        id: &str,
        _host: &str,
        opts: &PublishOptions,
    ) -> SfuResult<Negotiated> {
        let tracks = parse_offer_tracks(offer, opts)?;
        let peer = MockPeer::new();
        let transport = Transport::new(id, peer.clone());
        for track in &tracks {
            transport.add_inbound_track(track.clone())?;
        }
        self.sides.lock().insert(
            id.to_owned(),
            MockSide {
                transport: transport.clone(),
                peer,
                track: RecordingTrack::new(),
            },
        );
        Ok(Negotiated {
            transport,
            answer: format!("answer-for-{id}"),
            tracks,
        })
    }

    async fn subscribe(
        &self,
        _offer: &str,
        id: &str,
        _host: &str,
        opts: &SubscribeOptions,
        tracks: &[TrackInfo],
    ) -> SfuResult<Negotiated> {
        let peer = MockPeer::new();
        let transport = Transport::new(id, peer.clone());
        let track = if self.failing.lock().contains(id) {
            RecordingTrack::failing()
        } else {
            RecordingTrack::new()
        };
        let offered: Vec<TrackInfo> = tracks
            .iter()
            .filter(|t| opts.allows(t.kind))
            .cloned()
            .collect();
        for info in &offered {
            transport.add_outbound_track(info.ssrc, track.clone())?;
        }
        self.sides.lock().insert(
            id.to_owned(),
            MockSide {
                transport: transport.clone(),
                peer,
                track,
            },
        );
        Ok(Negotiated {
            transport,
            answer: format!("answer-for-{id}"),
            tracks: offered,
        })
    }
}

/// Poll `cond` until it holds, for up to about two seconds.
pub(crate) async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
