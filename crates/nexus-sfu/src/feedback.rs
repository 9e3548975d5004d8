//! RTCP feedback the router acts on.
//!
//! Only loss-repair feedback matters to the router: picture loss (PLI/FIR)
//! and generic NACK. Everything else a peer sends (reports, REMB, TWCC) is
//! consumed by the WebRTC stack and never reaches the queues.

use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;

pub use webrtc::rtcp::transport_feedbacks::transport_layer_nack::NackPair;

/// Loss-repair feedback for one media SSRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    /// The receiver lost decoder state and needs a key frame.
    PictureLoss { media_ssrc: u32 },
    /// The receiver is missing specific packets.
    Nack { media_ssrc: u32, pairs: Vec<NackPair> },
}

impl Feedback {
    /// NACK for exactly one sequence number.
    pub fn nack_one(media_ssrc: u32, sequence_number: u16) -> Self {
        Feedback::Nack {
            media_ssrc,
            pairs: vec![NackPair {
                packet_id: sequence_number,
                lost_packets: 0,
            }],
        }
    }

    pub fn media_ssrc(&self) -> u32 {
        match self {
            Feedback::PictureLoss { media_ssrc } | Feedback::Nack { media_ssrc, .. } => *media_ssrc,
        }
    }

    /// Decode a received RTCP packet, reporting it against `media_ssrc`.
    ///
    /// A subscriber's feedback names the SSRC the subscriber sees, which is
    /// not the publisher's; the reader task knows which publisher track it
    /// serves and passes that SSRC in.
    pub fn from_rtcp(packet: &(dyn RtcpPacket + Send + Sync), media_ssrc: u32) -> Option<Self> {
        let any = packet.as_any();
        if any.downcast_ref::<PictureLossIndication>().is_some()
            || any.downcast_ref::<FullIntraRequest>().is_some()
        {
            return Some(Feedback::PictureLoss { media_ssrc });
        }
        any.downcast_ref::<TransportLayerNack>().map(|nack| Feedback::Nack {
            media_ssrc,
            pairs: nack.nacks.clone(),
        })
    }

    /// Encode for sending.
    pub fn to_rtcp(&self) -> Box<dyn RtcpPacket + Send + Sync> {
        match self {
            Feedback::PictureLoss { media_ssrc } => Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc: *media_ssrc,
            }),
            Feedback::Nack { media_ssrc, pairs } => Box::new(TransportLayerNack {
                sender_ssrc: 0,
                media_ssrc: *media_ssrc,
                nacks: pairs.clone(),
            }),
        }
    }
}

/// Every sequence number a NACK pair asks for, in order.
pub fn requested(pair: &NackPair) -> impl Iterator<Item = u16> + '_ {
    std::iter::once(pair.packet_id).chain(
        (0..16u16)
            .filter(move |bit| pair.lost_packets & (1 << bit) != 0)
            .map(move |bit| pair.packet_id.wrapping_add(bit + 1)),
    )
}
