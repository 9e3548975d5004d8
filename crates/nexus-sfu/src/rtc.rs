//! WebRTC backend on the `webrtc` crate.
//!
//! Every publish/subscribe gets its own peer connection. ICE, DTLS and SRTP
//! stay inside the library; this module only wires the connection's tracks
//! into a [`Transport`]:
//!
//! - publisher: one reader task per remote track pushes RTP into the
//!   transport's inbound queue;
//! - subscriber: one `TrackLocalStaticRTP` per forwarded SSRC, plus one RTCP
//!   reader per sender that reports PLI/NACK against the publisher's SSRC.
//!
//! Only RTCP report interceptors are installed. NACKs are answered by the
//! router from its retention buffer, not by the library.

use crate::error::{SfuError, SfuResult, TransportError};
use crate::feedback::Feedback;
use crate::negotiate::{Negotiated, Negotiator};
use crate::track::{MediaKind, PublishOptions, SubscribeOptions, TrackInfo, parse_offer_tracks};
use crate::transport::{PeerSession, TrackWriter, Transport, TransportFeed};
use async_trait::async_trait;
use nexus_common::config::WebRtcConfig;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use webrtc::api::API;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::configure_rtcp_reports;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

/// Builds one peer connection per negotiation from the `webrtc` config section.
#[derive(Debug, Clone)]
pub struct RtcNegotiator {
    ice_servers: Vec<RTCIceServer>,
    port_min: u16,
    port_max: u16,
}

impl RtcNegotiator {
    pub fn new(config: &WebRtcConfig) -> Self {
        let ice_servers = config
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone(),
                credential: s.credential.clone(),
                ..Default::default()
            })
            .collect();
        Self {
            ice_servers,
            port_min: config.port_min,
            port_max: config.port_max,
        }
    }

    fn api(&self, host: &str) -> SfuResult<API> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = configure_rtcp_reports(Registry::new());

        let mut settings = SettingEngine::default();
        let ports = EphemeralUDP::new(self.port_min, self.port_max)
            .map_err(|e| SfuError::Negotiation(format!("invalid UDP port range: {e}")))?;
        settings.set_udp_network(UDPNetwork::Ephemeral(ports));
        if !host.is_empty() {
            settings.set_nat_1to1_ips(vec![host.to_owned()], RTCIceCandidateType::Host);
        }

        Ok(APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build())
    }

    /// A fresh peer connection and the transport that owns it.
    async fn connect(&self, id: &str, host: &str) -> SfuResult<(Arc<RTCPeerConnection>, Arc<Transport>)> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api(host)?.new_peer_connection(config).await?);
        let transport = Transport::new(id, Arc::new(RtcPeer { pc: pc.clone() }));
        watch_state(&pc, id, Arc::downgrade(&transport));
        Ok((pc, transport))
    }
}

#[async_trait]
impl Negotiator for RtcNegotiator {
    async fn publish(
        &self,
        offer: &str,
        id: &str,
        host: &str,
        opts: &PublishOptions,
    ) -> SfuResult<Negotiated> {
        let tracks = parse_offer_tracks(offer, opts)?;
        let (pc, transport) = self.connect(id, host).await?;
        for track in &tracks {
            transport.add_inbound_track(track.clone())?;
        }

        let kinds: HashSet<MediaKind> = tracks.iter().map(|t| t.kind).collect();
        for kind in kinds {
            pc.add_transceiver_from_kind(
                codec_type(kind),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        }

        let feed = transport.feed();
        let announced: HashSet<u32> = tracks.iter().map(|t| t.ssrc).collect();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let feed = feed.clone();
            let known = announced.contains(&track.ssrc());
            Box::pin(async move {
                if !known {
                    register_unannounced(&feed, &track);
                }
                tokio::spawn(read_track(feed, track));
            })
        }));

        let answer = match answer(&pc, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };
        tracing::debug!(publisher = %id, tracks = tracks.len(), "Publish negotiated");
        Ok(Negotiated {
            transport,
            answer,
            tracks,
        })
    }

    async fn subscribe(
        &self,
        offer: &str,
        id: &str,
        host: &str,
        opts: &SubscribeOptions,
        tracks: &[TrackInfo],
    ) -> SfuResult<Negotiated> {
        let (pc, transport) = self.connect(id, host).await?;
        let result = bind_outbound(&pc, &transport, offer, opts, tracks).await;
        match result {
            Ok((answer, offered)) => {
                tracing::debug!(subscriber = %id, tracks = offered.len(), "Subscribe negotiated");
                Ok(Negotiated {
                    transport,
                    answer,
                    tracks: offered,
                })
            }
            Err(e) => {
                transport.close().await;
                Err(e)
            }
        }
    }
}

async fn bind_outbound(
    pc: &Arc<RTCPeerConnection>,
    transport: &Arc<Transport>,
    offer: &str,
    opts: &SubscribeOptions,
    tracks: &[TrackInfo],
) -> SfuResult<(String, Vec<TrackInfo>)> {
    pc.set_remote_description(RTCSessionDescription::offer(offer.to_owned())?)
        .await?;

    let feed = transport.feed();
    let mut offered = Vec::new();
    for info in tracks.iter().filter(|t| opts.allows(t.kind)) {
        let local = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: info.codec.clone(),
                clock_rate: info.clock_rate,
                channels: info.channels,
                sdp_fmtp_line: info.fmtp.clone(),
                rtcp_feedback: vec![],
            },
            info.track_id.clone(),
            info.stream_id.clone(),
        ));
        let sender = pc
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        transport.add_outbound_track(info.ssrc, Arc::new(RtcTrack { local }))?;
        tokio::spawn(read_feedback(feed.clone(), sender, info.ssrc));
        offered.push(info.clone());
    }
    if offered.is_empty() {
        return Err(SfuError::NoCompatibleCodec);
    }

    let answer = create_answer(pc).await?;
    Ok((answer, offered))
}

/// Apply the remote offer and produce the gathered answer.
async fn answer(pc: &RTCPeerConnection, offer: &str) -> SfuResult<String> {
    pc.set_remote_description(RTCSessionDescription::offer(offer.to_owned())?)
        .await?;
    create_answer(pc).await
}

async fn create_answer(pc: &RTCPeerConnection) -> SfuResult<String> {
    let answer = pc.create_answer(None).await?;
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;
    let _ = gathered.recv().await;
    pc.local_description()
        .await
        .map(|d| d.sdp)
        .ok_or_else(|| SfuError::Negotiation("no local description after gathering".into()))
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

/// Close the transport once the connection is gone for good.
fn watch_state(pc: &RTCPeerConnection, id: &str, transport: Weak<Transport>) {
    let id = id.to_owned();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let id = id.clone();
        let transport = transport.clone();
        Box::pin(async move {
            tracing::debug!(transport = %id, state = %state, "Peer connection state changed");
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                if let Some(transport) = transport.upgrade() {
                    transport.close().await;
                }
            }
        })
    }));
}

fn register_unannounced(feed: &TransportFeed, track: &TrackRemote) {
    let kind = match track.kind() {
        RTPCodecType::Audio => MediaKind::Audio,
        _ => MediaKind::Video,
    };
    let info = TrackInfo {
        ssrc: track.ssrc(),
        payload_type: track.payload_type(),
        codec: String::new(),
        kind,
        clock_rate: 0,
        channels: 0,
        fmtp: String::new(),
        track_id: track.id(),
        stream_id: track.stream_id(),
    };
    tracing::debug!(ssrc = info.ssrc, kind = %kind, "Remote track was not announced in the offer");
    if let Err(e) = feed.register_inbound(info) {
        tracing::debug!(error = %e, "Inbound track already registered");
    }
}

async fn read_track(feed: TransportFeed, track: Arc<TrackRemote>) {
    let ssrc = track.ssrc();
    loop {
        let read = tokio::select! {
            _ = feed.closed() => break,
            r = track.read_rtp() => r,
        };
        match read {
            Ok((packet, _)) => {
                if !feed.push_rtp(packet) {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(ssrc, error = %e, "Remote track ended");
                break;
            }
        }
    }
}

async fn read_feedback(feed: TransportFeed, sender: Arc<RTCRtpSender>, publisher_ssrc: u32) {
    loop {
        let read = tokio::select! {
            _ = feed.closed() => break,
            r = sender.read_rtcp() => r,
        };
        let packets = match read {
            Ok((packets, _)) => packets,
            Err(e) => {
                tracing::debug!(ssrc = publisher_ssrc, error = %e, "Sender RTCP ended");
                break;
            }
        };
        for packet in &packets {
            if let Some(fb) = Feedback::from_rtcp(packet.as_ref(), publisher_ssrc) {
                if !feed.push_rtcp(fb) {
                    return;
                }
            }
        }
    }
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerSession for RtcPeer {
    async fn write_rtcp(&self, feedback: &[Feedback]) -> Result<(), TransportError> {
        let packets: Vec<Box<dyn RtcpPacket + Send + Sync>> =
            feedback.iter().map(Feedback::to_rtcp).collect();
        self.pc
            .write_rtcp(&packets)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}

struct RtcTrack {
    local: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl TrackWriter for RtcTrack {
    async fn write_rtp(&self, packet: &Packet) -> Result<(), TransportError> {
        self.local
            .write_rtp(packet)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}
