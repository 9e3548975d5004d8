//! Retention buffer: a short trailing window of RTP packets per inbound SSRC.
//!
//! Packets are stored in a 65536-slot ring indexed directly by sequence
//! number. Each push evicts packets that fell out of the retention window
//! (measured in media clock units against the newest packet) and, every
//! [`NACK_WINDOW`] packets, scans the next unscanned span for holes and
//! produces one NACK record for them. A burst longer than one record is
//! reported a window at a time over the following pushes.
//!
//! All sequence arithmetic is modulo 2^16 and all timestamp distances are
//! absolute differences, so both counters may wrap freely. A jump beyond
//! [`MAX_DROPOUT`] ahead or [`MAX_MISORDER`] behind, confirmed by the packet
//! after it, restarts the buffer on the new sequence.

use crate::feedback::{Feedback, NackPair};
use crate::track::TrackInfo;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use webrtc::rtp::packet::Packet;
use webrtc::util::MarshalSize;

const SLOTS: usize = 1 << 16;

/// Span covered by one NACK record: the packet ID plus 16 bitmap bits.
pub const NACK_WINDOW: u16 = 17;

/// Largest forward sequence jump still treated as loss.
pub const MAX_DROPOUT: u16 = 3000;

/// Largest backward sequence distance still treated as reordering.
pub const MAX_MISORDER: u16 = 100;

/// Clock rate assumed for streams that were not announced in the offer.
const DEFAULT_CLOCK_RATE: u32 = 90_000;

/// `a` is ahead of `b` in sequence order (RFC 3550 style half-range compare).
fn seq_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// Interval statistics, reset every time they are read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferStats {
    pub received: u64,
    pub lost: u64,
    /// lost / (received + lost); 0 when nothing was seen.
    pub lost_rate: f64,
    pub bitrate_kbps: u64,
}

pub struct RetentionBuffer {
    slots: Box<[Option<Box<Packet>>]>,
    ssrc: u32,
    payload_type: u8,
    initialized: bool,
    /// Retention window in media clock units.
    window: u32,
    last_clear_sn: u16,
    last_clear_ts: u32,
    last_push_sn: u16,
    last_push_ts: u32,
    last_nack_sn: u16,
    /// Sequence number that would confirm a pending discontinuity.
    probation: Option<u16>,
    received: u64,
    lost: u64,
    total_bytes: u64,
}

impl std::fmt::Debug for RetentionBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionBuffer")
            .field("ssrc", &self.ssrc)
            .field("payload_type", &self.payload_type)
            .field("window", &self.window)
            .field("last_clear_sn", &self.last_clear_sn)
            .field("last_push_sn", &self.last_push_sn)
            .field("last_nack_sn", &self.last_nack_sn)
            .finish()
    }
}

impl RetentionBuffer {
    /// `window` is in media clock units; see [`RetentionBuffer::window_for`].
    pub fn new(window: u32) -> Self {
        Self {
            slots: vec![None; SLOTS].into_boxed_slice(),
            ssrc: 0,
            payload_type: 0,
            initialized: false,
            window,
            last_clear_sn: 0,
            last_clear_ts: 0,
            last_push_sn: 0,
            last_push_ts: 0,
            last_nack_sn: 0,
            probation: None,
            received: 0,
            lost: 0,
            total_bytes: 0,
        }
    }

    /// Convert a millisecond window to clock units.
    pub fn window_for(ms: u32, clock_rate: u32) -> u32 {
        let units = u64::from(ms) * u64::from(clock_rate) / 1000;
        u32::try_from(units).unwrap_or(u32::MAX)
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Store a packet. Returns a NACK when the latest scan found holes.
    pub fn push(&mut self, packet: Packet) -> Option<Feedback> {
        let sn = packet.header.sequence_number;
        let ts = packet.header.timestamp;

        self.received += 1;
        self.total_bytes += packet.marshal_size() as u64;

        if !self.initialized {
            self.initialized = true;
            self.ssrc = packet.header.ssrc;
            self.payload_type = packet.header.payload_type;
            self.restart(sn, ts);
        } else if self.is_discontinuity(sn) {
            // A lone stray packet is dropped; a second one in sequence restarts.
            if self.probation != Some(sn) {
                self.probation = Some(sn.wrapping_add(1));
                return None;
            }
            tracing::debug!(
                ssrc = self.ssrc,
                from = self.last_push_sn,
                to = sn,
                "Sequence discontinuity, restarting retention buffer"
            );
            self.slots.fill(None);
            self.restart(sn, ts);
        }
        self.probation = None;

        self.slots[usize::from(sn)] = Some(Box::new(packet));

        // A late packet fills its slot but never moves the cursors back.
        if !seq_newer(sn, self.last_push_sn) {
            return None;
        }
        self.last_push_sn = sn;
        self.last_push_ts = ts;

        self.evict();
        self.detect_loss()
    }

    pub fn get(&self, sn: u16) -> Option<Packet> {
        self.slots[usize::from(sn)].as_deref().cloned()
    }

    /// Interval loss rate and bitrate since the previous call.
    pub fn stats(&mut self, elapsed: Duration) -> BufferStats {
        let seen = self.received + self.lost;
        let lost_rate = if seen == 0 {
            0.0
        } else {
            self.lost as f64 / seen as f64
        };
        let secs = elapsed.as_secs_f64();
        let bitrate_kbps = if secs > 0.0 {
            (self.total_bytes as f64 * 8.0 / 1000.0 / secs) as u64
        } else {
            0
        };
        let stats = BufferStats {
            received: self.received,
            lost: self.lost,
            lost_rate,
            bitrate_kbps,
        };
        self.received = 0;
        self.lost = 0;
        self.total_bytes = 0;
        stats
    }

    /// Drop packets older than the window, walking forward from the clear cursor.
    ///
    /// Holes are skipped without moving the cursor, so a late packet landing
    /// in one is still evicted in its turn. The walk stops at the first
    /// packet still inside the window.
    fn evict(&mut self) {
        let head_ts = self.last_push_ts;
        let start = self.last_clear_sn;
        let span = self.last_push_sn.wrapping_sub(start);
        for step in 1..=span {
            let sn = start.wrapping_add(step);
            let slot = &mut self.slots[usize::from(sn)];
            let Some(p) = slot.as_deref() else {
                continue;
            };
            if head_ts.abs_diff(p.header.timestamp) <= self.window {
                break;
            }
            self.last_clear_ts = p.header.timestamp;
            self.last_clear_sn = sn;
            *slot = None;
        }
    }

    fn restart(&mut self, sn: u16, ts: u32) {
        self.last_clear_sn = sn.wrapping_sub(1);
        self.last_clear_ts = ts;
        self.last_push_sn = sn;
        self.last_push_ts = ts;
        self.last_nack_sn = sn;
    }

    fn is_discontinuity(&self, sn: u16) -> bool {
        if seq_newer(sn, self.last_push_sn) {
            sn.wrapping_sub(self.last_push_sn) > MAX_DROPOUT
        } else {
            self.last_push_sn.wrapping_sub(sn) > MAX_MISORDER
        }
    }

    /// Scan the next [`NACK_WINDOW`] slots after the NACK cursor once the
    /// head is a full window ahead of it, then advance the cursor by one window.
    fn detect_loss(&mut self) -> Option<Feedback> {
        // Slots already behind the eviction cursor cannot be repaired.
        if !seq_newer(self.last_nack_sn, self.last_clear_sn) {
            self.last_nack_sn = self.last_clear_sn.wrapping_add(1);
        }
        let span = self.last_push_sn.wrapping_sub(self.last_nack_sn);
        if span < NACK_WINDOW {
            return None;
        }
        let begin = self.last_nack_sn;
        self.last_nack_sn = begin.wrapping_add(NACK_WINDOW);

        let first = (0..NACK_WINDOW)
            .map(|k| begin.wrapping_add(k))
            .find(|&sn| self.is_missing(sn))?;

        let mut bitmap = 0u16;
        let mut lost = 1;
        for bit in 0..16u16 {
            let sn = first.wrapping_add(bit + 1);
            if sn.wrapping_sub(begin) >= NACK_WINDOW {
                break;
            }
            if self.is_missing(sn) {
                bitmap |= 1 << bit;
                lost += 1;
            }
        }
        self.lost += lost;

        Some(Feedback::Nack {
            media_ssrc: self.ssrc,
            pairs: vec![NackPair {
                packet_id: first,
                lost_packets: bitmap,
            }],
        })
    }

    /// Empty and not already behind the eviction cursor.
    fn is_missing(&self, sn: u16) -> bool {
        self.slots[usize::from(sn)].is_none() && seq_newer(sn, self.last_clear_sn)
    }
}

/// A router's retention buffers, one per publisher SSRC.
///
/// Pushes come from the single ingest task; lookups come from every
/// subscriber's repair task. Each buffer sits behind a short mutex so a
/// lookup may race a clear and simply miss.
#[derive(Debug)]
pub struct RetentionSet {
    buffers: RwLock<HashMap<u32, Arc<Mutex<RetentionBuffer>>>>,
    window_ms: u32,
}

impl RetentionSet {
    pub fn new(tracks: &[TrackInfo], window_ms: u32) -> Self {
        let buffers = tracks
            .iter()
            .map(|t| {
                let window = RetentionBuffer::window_for(window_ms, t.clock_rate);
                (t.ssrc, Arc::new(Mutex::new(RetentionBuffer::new(window))))
            })
            .collect();
        Self {
            buffers: RwLock::new(buffers),
            window_ms,
        }
    }

    pub fn push(&self, packet: Packet) -> Option<Feedback> {
        let ssrc = packet.header.ssrc;
        let buffer = self.buffers.read().get(&ssrc).cloned();
        let buffer = match buffer {
            Some(b) => b,
            None => {
                tracing::debug!(ssrc, "Creating retention buffer for unannounced SSRC");
                let window = RetentionBuffer::window_for(self.window_ms, DEFAULT_CLOCK_RATE);
                self.buffers
                    .write()
                    .entry(ssrc)
                    .or_insert_with(|| Arc::new(Mutex::new(RetentionBuffer::new(window))))
                    .clone()
            }
        };
        let mut buffer = buffer.lock();
        buffer.push(packet)
    }

    pub fn get(&self, ssrc: u32, sn: u16) -> Option<Packet> {
        let buffer = self.buffers.read().get(&ssrc).cloned()?;
        let buffer = buffer.lock();
        buffer.get(sn)
    }

    /// Per-SSRC interval statistics; resets every buffer's counters.
    pub fn stats(&self, elapsed: Duration) -> Vec<(u32, BufferStats)> {
        let buffers: Vec<(u32, Arc<Mutex<RetentionBuffer>>)> = self
            .buffers
            .read()
            .iter()
            .map(|(ssrc, b)| (*ssrc, b.clone()))
            .collect();
        buffers
            .into_iter()
            .map(|(ssrc, b)| (ssrc, b.lock().stats(elapsed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::rtp;
    use proptest::prelude::*;

    fn nack_of(fb: Feedback) -> NackPair {
        match fb {
            Feedback::Nack { pairs, .. } => pairs[0],
            other => panic!("expected NACK, got {other:?}"),
        }
    }

    #[test]
    fn window_conversion() {
        assert_eq!(RetentionBuffer::window_for(1000, 90_000), 90_000);
        assert_eq!(RetentionBuffer::window_for(500, 48_000), 24_000);
    }

    #[test]
    fn first_push_initializes_stream_identity() {
        let mut buf = RetentionBuffer::new(90_000);
        let mut p = rtp(1234, 10, 1000);
        p.header.payload_type = 96;
        assert!(buf.push(p).is_none());
        assert_eq!(buf.ssrc(), 1234);
        assert_eq!(buf.payload_type(), 96);
        assert_eq!(buf.get(10).unwrap().header.timestamp, 1000);
        assert!(buf.get(11).is_none());
    }

    #[test]
    fn nack_reports_first_hole_and_bitmap() {
        let mut buf = RetentionBuffer::new(u32::MAX);
        let n = 102u16;
        let missing = [n, n + 2, n + 5];
        let mut emitted = Vec::new();
        for sn in 100..=117u16 {
            if missing.contains(&sn) {
                continue;
            }
            if let Some(fb) = buf.push(rtp(1, sn, u32::from(sn) * 10)) {
                emitted.push(fb);
            }
        }
        assert_eq!(emitted.len(), 1);
        let pair = nack_of(emitted.remove(0));
        assert_eq!(pair.packet_id, n);
        assert_eq!(pair.lost_packets, (1 << 1) | (1 << 4));
        assert_eq!(buf.stats(Duration::from_secs(1)).lost, 3);
    }

    #[test]
    fn no_nack_without_loss() {
        let mut buf = RetentionBuffer::new(u32::MAX);
        for sn in 0..100u16 {
            assert!(buf.push(rtp(1, sn, u32::from(sn))).is_none());
        }
    }

    fn reported_ids(fb: Feedback) -> Vec<u16> {
        let pair = nack_of(fb);
        std::iter::once(pair.packet_id)
            .chain(
                (0..16u16)
                    .filter(|bit| pair.lost_packets & (1 << bit) != 0)
                    .map(|bit| pair.packet_id.wrapping_add(bit + 1)),
            )
            .collect()
    }

    #[test]
    fn burst_longer_than_window_is_reported_incrementally() {
        let mut buf = RetentionBuffer::new(u32::MAX);
        buf.push(rtp(1, 0, 0));
        // 0 received, 1..=29 lost, 30.. received.
        let mut records = Vec::new();
        for sn in 30..=80u16 {
            if let Some(fb) = buf.push(rtp(1, sn, u32::from(sn))) {
                records.push(reported_ids(fb));
            }
        }
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (1..=16).collect::<Vec<u16>>());
        assert_eq!(records[1], (17..=29).collect::<Vec<u16>>());
        assert_eq!(buf.stats(Duration::from_secs(1)).lost, 29);
    }

    #[test]
    fn sequence_jump_restarts_buffer() {
        let mut buf = RetentionBuffer::new(1000);
        for sn in 0..10u16 {
            buf.push(rtp(1, sn, u32::from(sn) * 100));
        }
        let mut reported = Vec::new();
        for sn in (40_000..=40_100u16).filter(|&s| s != 40_005) {
            let ts = 1000 + u32::from(sn - 40_000) * 20;
            if let Some(fb) = buf.push(rtp(1, sn, ts)) {
                reported.extend(reported_ids(fb));
            }
        }
        assert!(buf.get(0).is_none());
        assert!(buf.get(9).is_none());
        assert!(buf.get(40_100).is_some());
        assert!(buf.get(40_060).is_some());
        assert!(buf.get(40_040).is_none());
        assert_eq!(reported, vec![40_005]);
    }

    #[test]
    fn single_stray_packet_does_not_restart() {
        let mut buf = RetentionBuffer::new(u32::MAX);
        for sn in 0..200u16 {
            buf.push(rtp(1, sn, u32::from(sn)));
        }
        assert!(buf.push(rtp(1, 60_000, 0)).is_none());
        for sn in 200..210u16 {
            buf.push(rtp(1, sn, u32::from(sn)));
        }
        assert!(buf.get(60_000).is_none());
        assert!(buf.get(0).is_some());
        assert!(buf.get(209).is_some());
    }

    #[test]
    fn sequence_zero_can_be_reported_lost() {
        let mut buf = RetentionBuffer::new(u32::MAX);
        buf.push(rtp(1, 65530, 0));
        let mut emitted = None;
        for sn in (65531..=65535u16).chain(1..=11) {
            if let Some(fb) = buf.push(rtp(1, sn, 0)) {
                emitted = Some(fb);
            }
        }
        let pair = nack_of(emitted.unwrap());
        assert_eq!(pair.packet_id, 0);
        assert_eq!(pair.lost_packets, 0);
    }

    #[test]
    fn wraparound_keeps_new_packets_retrievable() {
        let mut buf = RetentionBuffer::new(10_000);
        let mut ts = 0u32;
        for sn in (65500..=65535u16).chain(0..=40) {
            assert!(buf.push(rtp(1, sn, ts)).is_none());
            ts += 100;
        }
        for sn in 0..=40u16 {
            assert_eq!(buf.get(sn).unwrap().header.sequence_number, sn);
        }
        // 77 packets 100 units apart; the window keeps the last 101.
        assert!(buf.get(65500).is_some());

        for sn in 41..=200u16 {
            buf.push(rtp(1, sn, ts));
            ts += 100;
        }
        assert!(buf.get(65535).is_none());
        assert!(buf.get(99).is_none());
        assert!(buf.get(100).is_some());
        assert!(buf.get(200).is_some());
    }

    #[test]
    fn reordered_packet_is_stored_without_moving_cursors() {
        let mut buf = RetentionBuffer::new(1000);
        buf.push(rtp(1, 10, 0));
        buf.push(rtp(1, 12, 200));
        buf.push(rtp(1, 11, 100));
        assert!(buf.get(11).is_some());

        // Advancing past the window evicts all three in order.
        buf.push(rtp(1, 13, 5000));
        assert!(buf.get(10).is_none());
        assert!(buf.get(11).is_none());
        assert!(buf.get(12).is_none());
        assert!(buf.get(13).is_some());
    }

    #[test]
    fn eviction_skips_holes() {
        let mut buf = RetentionBuffer::new(1000);
        buf.push(rtp(1, 1, 0));
        buf.push(rtp(1, 4, 300));
        buf.push(rtp(1, 5, 2000));
        assert!(buf.get(1).is_none());
        assert!(buf.get(4).is_none());
        assert!(buf.get(5).is_some());
    }

    #[test]
    fn stats_are_interval_counters() {
        let mut buf = RetentionBuffer::new(u32::MAX);
        for sn in [10u16, 11, 12] {
            buf.push(rtp(1, sn, 1000));
        }
        let stats = buf.stats(Duration::from_secs(1));
        assert_eq!(stats.received, 3);
        assert_eq!(stats.lost, 0);
        assert_eq!(stats.lost_rate, 0.0);
        assert!(stats.bitrate_kbps > 0);

        let again = buf.stats(Duration::from_secs(1));
        assert_eq!(again.received, 0);
        assert_eq!(again.bitrate_kbps, 0);
    }

    #[test]
    fn set_routes_by_ssrc_and_creates_unknown_buffers() {
        let set = RetentionSet::new(&[crate::testing::audio_track(1000)], 1000);
        set.push(rtp(1000, 1, 0));
        set.push(rtp(3000, 9, 0));
        assert!(set.get(1000, 1).is_some());
        assert!(set.get(3000, 9).is_some());
        assert!(set.get(1000, 9).is_none());
        assert!(set.get(4000, 1).is_none());
        assert_eq!(set.stats(Duration::from_secs(1)).len(), 2);
    }

    proptest! {
        #[test]
        fn eviction_follows_timestamp_window(
            start in any::<u16>(),
            steps in prop::collection::vec(0u32..400, 1..300),
            window in 0u32..5000,
        ) {
            let mut buf = RetentionBuffer::new(window);
            let mut ts = 0u32;
            let mut pushed = Vec::new();
            for (i, step) in steps.iter().enumerate() {
                ts += step;
                let sn = start.wrapping_add(i as u16);
                buf.push(rtp(7, sn, ts));
                pushed.push((sn, ts));
            }
            let latest = ts;
            for (sn, ts) in pushed {
                let kept = buf.get(sn).is_some();
                prop_assert_eq!(kept, latest - ts <= window, "sn {} ts {} latest {}", sn, ts, latest);
            }
        }

        #[test]
        fn contiguous_stream_never_nacks_across_wrap(start in any::<u16>(), len in 1usize..400) {
            let mut buf = RetentionBuffer::new(u32::MAX);
            for i in 0..len {
                let sn = start.wrapping_add(i as u16);
                prop_assert!(buf.push(rtp(7, sn, i as u32)).is_none());
            }
            for i in 0..len {
                let sn = start.wrapping_add(i as u16);
                prop_assert_eq!(buf.get(sn).map(|p| p.header.sequence_number), Some(sn));
            }
        }
    }
}
