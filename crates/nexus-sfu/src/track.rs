//! Track metadata and publish-offer inspection.
//!
//! The router needs to know, before any packet arrives, which SSRCs a
//! publisher will send and with which codec, so subscribers can be offered
//! matching outbound tracks. That information is read straight from the
//! publisher's offer.

use crate::error::{SfuError, SfuResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use webrtc::sdp::description::media::MediaDescription;
use webrtc::sdp::description::session::SessionDescription;

/// What a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Information about a published media track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackInfo {
    pub ssrc: u32,
    pub payload_type: u8,
    /// Mime type, e.g. `audio/opus` or `video/VP8`.
    pub codec: String,
    pub kind: MediaKind,
    pub clock_rate: u32,
    pub channels: u16,
    pub fmtp: String,
    pub track_id: String,
    pub stream_id: String,
}

/// Publish request options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    /// Preferred video codec name (`VP8`, `VP9`, `H264`, ...).
    pub codec: String,
    pub audio: bool,
    pub video: bool,
    /// Screen content counts as video.
    pub screen: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            codec: "VP8".into(),
            audio: true,
            video: true,
            screen: false,
        }
    }
}

impl PublishOptions {
    fn allows(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video || self.screen,
        }
    }
}

/// Subscribe request options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscribeOptions {
    pub audio: bool,
    pub video: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl SubscribeOptions {
    pub fn allows(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }
}

/// Retransmission / redundancy formats never chosen as the primary codec.
const AUX_CODECS: &[&str] = &["rtx", "red", "ulpfec", "flexfec-03"];

#[derive(Debug)]
struct RtpMap {
    payload_type: u8,
    name: String,
    clock_rate: u32,
    channels: u16,
}

/// Extract one [`TrackInfo`] per usable audio/video section of a publish offer.
pub fn parse_offer_tracks(sdp: &str, opts: &PublishOptions) -> SfuResult<Vec<TrackInfo>> {
    let desc = SessionDescription::unmarshal(&mut Cursor::new(sdp.as_bytes()))
        .map_err(|e| SfuError::Negotiation(e.to_string()))?;

    let mut tracks = Vec::new();
    for media in &desc.media_descriptions {
        let kind = match media.media_name.media.as_str() {
            "audio" => MediaKind::Audio,
            "video" => MediaKind::Video,
            _ => continue,
        };
        if !opts.allows(kind) {
            continue;
        }
        let Some((ssrc, ssrc_msid)) = first_ssrc(media) else {
            tracing::debug!(kind = %kind, "Offer section has no SSRC, skipping");
            continue;
        };

        let rtpmaps = rtpmaps(media);
        let Some(chosen) = choose_codec(kind, &rtpmaps, &opts.codec) else {
            tracing::debug!(kind = %kind, ssrc, "No usable codec in offer section");
            continue;
        };

        let (stream_id, track_id) = attribute(media, "msid")
            .and_then(split_msid)
            .or(ssrc_msid)
            .unwrap_or_else(|| (format!("stream-{ssrc}"), format!("{kind}-{ssrc}")));

        tracks.push(TrackInfo {
            ssrc,
            payload_type: chosen.payload_type,
            codec: format!("{kind}/{}", chosen.name),
            kind,
            clock_rate: chosen.clock_rate,
            channels: chosen.channels,
            fmtp: fmtp(media, chosen.payload_type).unwrap_or_default(),
            track_id,
            stream_id,
        });
    }

    if tracks.is_empty() {
        return Err(SfuError::NoCompatibleCodec);
    }
    Ok(tracks)
}

fn attribute<'a>(media: &'a MediaDescription, key: &str) -> Option<&'a str> {
    media
        .attributes
        .iter()
        .find(|a| a.key == key)
        .and_then(|a| a.value.as_deref())
}

fn split_msid(value: &str) -> Option<(String, String)> {
    let mut parts = value.split_whitespace();
    let stream = parts.next()?;
    let track = parts.next()?;
    Some((stream.to_owned(), track.to_owned()))
}

/// First `a=ssrc:` line, plus the msid it may carry (`a=ssrc:<id> msid:<stream> <track>`).
fn first_ssrc(media: &MediaDescription) -> Option<(u32, Option<(String, String)>)> {
    let mut ssrc = None;
    let mut msid = None;
    for attr in media.attributes.iter().filter(|a| a.key == "ssrc") {
        let Some(value) = attr.value.as_deref() else {
            continue;
        };
        let (id, rest) = value.split_once(' ').unwrap_or((value, ""));
        let Ok(id) = id.parse::<u32>() else {
            continue;
        };
        match ssrc {
            None => ssrc = Some(id),
            Some(first) if first != id => break,
            Some(_) => {}
        }
        if let Some(m) = rest.strip_prefix("msid:") {
            msid = split_msid(m);
        }
    }
    ssrc.map(|id| (id, msid))
}

fn rtpmaps(media: &MediaDescription) -> Vec<RtpMap> {
    let mut maps: Vec<RtpMap> = media
        .attributes
        .iter()
        .filter(|a| a.key == "rtpmap")
        .filter_map(|a| a.value.as_deref())
        .filter_map(|value| {
            // "111 opus/48000/2"
            let (pt, encoding) = value.split_once(' ')?;
            let mut enc = encoding.split('/');
            let name = enc.next()?.to_owned();
            let clock_rate = enc.next()?.parse().ok()?;
            let channels = enc.next().and_then(|c| c.parse().ok()).unwrap_or(0);
            Some(RtpMap {
                payload_type: pt.parse().ok()?,
                name,
                clock_rate,
                channels,
            })
        })
        .collect();

    // Offer preference is the m-line format order.
    let order: Vec<&str> = media.media_name.formats.iter().map(String::as_str).collect();
    maps.sort_by_key(|m| {
        order
            .iter()
            .position(|f| f.parse::<u8>().ok() == Some(m.payload_type))
            .unwrap_or(usize::MAX)
    });
    maps
}

fn choose_codec<'a>(kind: MediaKind, maps: &'a [RtpMap], preferred_video: &str) -> Option<&'a RtpMap> {
    let preferred = match kind {
        MediaKind::Audio => "opus",
        MediaKind::Video if preferred_video.is_empty() => "VP8",
        MediaKind::Video => preferred_video,
    };
    maps.iter()
        .find(|m| m.name.eq_ignore_ascii_case(preferred))
        .or_else(|| {
            maps.iter().find(|m| {
                !AUX_CODECS
                    .iter()
                    .any(|aux| m.name.eq_ignore_ascii_case(aux))
            })
        })
}

fn fmtp(media: &MediaDescription, payload_type: u8) -> Option<String> {
    media
        .attributes
        .iter()
        .filter(|a| a.key == "fmtp")
        .filter_map(|a| a.value.as_deref())
        .find_map(|value| {
            let (pt, params) = value.split_once(' ')?;
            (pt.parse::<u8>().ok()? == payload_type).then(|| params.to_owned())
        })
}
