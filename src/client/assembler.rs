// Copyright (C) 2021 rtspflow contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reassembly of RTP packets into frames.

use std::collections::{BTreeMap, VecDeque};

use bytes::BytesMut;
use log::{debug, trace};

use super::timeline::Timeline;
use crate::codec::{Depacketizer, Frame, MediaType};
use crate::rtp::RtpPacket;
use crate::{PacketContext, Timestamp};

/// Number of packets held back waiting for a missing sequence number.
pub const REORDER_WINDOW: i64 = 32;

/// Per-stream packet and frame counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub received: u64,
    pub lost: u64,
    pub late: u64,
    pub duplicate: u64,
    pub invalid: u64,
    pub frames_emitted: u64,
    pub frames_incomplete: u64,

    /// Payload bytes placed into frames.
    pub bytes: u64,
}

/// The frame currently being filled.
struct Group {
    ctx: PacketContext,
    timestamp: Timestamp,
    data: BytesMut,
    complete: bool,
    loss: u16,
}

/// Turns one stream's RTP packets, possibly reordered or lost, into
/// timestamp-ordered [`Frame`]s. Unstable; exposed for benchmark.
///
/// Packets are held in a reorder buffer keyed by extended (unwrapped)
/// sequence number and released in sequence order. A gap is waited out until
/// the buffered packets span [`REORDER_WINDOW`]; then the missing packets are
/// counted as lost and the affected frames are marked incomplete.
///
/// Without an `RTP-Info` seed, nothing is released until the buffer either
/// spans the window or holds a gap-free run through a frame boundary; the
/// lowest buffered sequence number is then the start.
///
/// Released packets sharing an RTP timestamp make up one frame. A video frame
/// ends with its marker packet, or when a packet with a later timestamp shows
/// up first. Each audio packet is its own frame.
#[doc(hidden)]
pub struct RtpFrameAssembler {
    stream_id: usize,
    media: MediaType,
    payload_type: u8,
    depacketizer: Box<dyn Depacketizer>,
    timeline: Timeline,

    /// Extended sequence number of the next packet to release.
    next_seq: Option<i64>,

    /// Highest extended sequence number seen; the reference for unwrapping.
    highest: Option<i64>,

    /// True once a packet has been released.
    started: bool,

    pending: BTreeMap<i64, (PacketContext, RtpPacket)>,
    group: Option<Group>,

    /// Set when packets were skipped; taints the next frame started.
    discontinuity: bool,
    loss_since_frame: u64,
    last_emitted: Option<i64>,
    ready: VecDeque<Frame>,
    stats: AssemblerStats,
}

impl RtpFrameAssembler {
    pub fn new(
        stream_id: usize,
        media: MediaType,
        payload_type: u8,
        clock_rate: u32,
        depacketizer: Box<dyn Depacketizer>,
    ) -> Result<Self, String> {
        Ok(Self {
            stream_id,
            media,
            payload_type,
            depacketizer,
            timeline: Timeline::new(None, clock_rate)?,
            next_seq: None,
            highest: None,
            started: false,
            pending: BTreeMap::new(),
            group: None,
            discontinuity: false,
            loss_since_frame: 0,
            last_emitted: None,
            ready: VecDeque::new(),
            stats: AssemblerStats::default(),
        })
    }

    /// Seeds the expected first sequence number and the timeline start, as
    /// from the `PLAY` response's `RTP-Info` header. Ignored once packets
    /// have arrived.
    pub fn set_initial(&mut self, seq: Option<u16>, rtptime: Option<u32>) {
        if self.started || !self.pending.is_empty() {
            debug!(
                "stream {}: ignoring RTP-Info seq={:?} rtptime={:?} after first packet",
                self.stream_id, seq, rtptime
            );
            return;
        }
        if let Some(seq) = seq {
            let seq = i64::from(seq);
            self.next_seq = Some(seq);
            self.highest = Some(seq - 1);
        }
        if let Some(rtptime) = rtptime {
            self.timeline.set_start(rtptime);
        }
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Unwraps a 16-bit sequence number relative to the highest seen.
    fn extend(&self, seq: u16) -> i64 {
        match self.highest {
            None => i64::from(seq),
            Some(h) => h + i64::from(seq.wrapping_sub(h as u16) as i16),
        }
    }

    /// Accepts one packet; any frames it completes become available via
    /// [`RtpFrameAssembler::drain`].
    pub fn ingest(&mut self, ctx: PacketContext, pkt: RtpPacket) {
        self.stats.received += 1;
        if pkt.payload_type() != self.payload_type {
            debug!(
                "stream {}: dropping pt={} packet, expected pt={}",
                self.stream_id,
                pkt.payload_type(),
                self.payload_type
            );
            self.stats.invalid += 1;
            return;
        }
        let ext = self.extend(pkt.sequence_number());
        match self.next_seq {
            None => {}
            Some(n) if ext < n => {
                if self.started {
                    trace!(
                        "stream {}: late seq={:04x}, expecting {:04x}",
                        self.stream_id,
                        pkt.sequence_number(),
                        n as u16
                    );
                    self.stats.late += 1;
                    return;
                }

                // Server started before its advertised RTP-Info seq.
                self.next_seq = Some(ext);
            }
            Some(_) => {}
        }
        if self.pending.contains_key(&ext) {
            trace!(
                "stream {}: duplicate seq={:04x}",
                self.stream_id,
                pkt.sequence_number()
            );
            self.stats.duplicate += 1;
            return;
        }
        self.highest = Some(self.highest.map_or(ext, |h| h.max(ext)));
        self.pending.insert(ext, (ctx, pkt));
        if self.next_seq.is_none() {
            match self.first_seq() {
                Some(first) => {
                    debug!(
                        "stream {}: starting at seq={:04x} with {} packet(s) buffered",
                        self.stream_id,
                        first as u16,
                        self.pending.len()
                    );
                    self.next_seq = Some(first);
                }
                None => return,
            }
        }
        self.release();
    }

    /// Picks the starting sequence number once the unseeded buffer spans the
    /// reorder window or holds a gap-free run from its lowest packet through
    /// the end of a frame and into the next one.
    fn first_seq(&self) -> Option<i64> {
        let first = *self.pending.keys().next()?;
        let highest = self.highest?;
        if highest - first >= REORDER_WINDOW {
            return Some(first);
        }
        let mut prev: Option<&RtpPacket> = None;
        for (expect, (&seq, (_, pkt))) in (first..).zip(self.pending.iter()) {
            if seq != expect {
                break;
            }
            if let Some(p) = prev {
                if self.media == MediaType::Audio
                    || p.mark()
                    || p.timestamp() != pkt.timestamp()
                {
                    return Some(first);
                }
            }
            prev = Some(pkt);
        }
        None
    }

    /// Releases buffered packets in sequence order, skipping a gap once the
    /// buffer spans the reorder window.
    fn release(&mut self) {
        loop {
            let next = match self.next_seq {
                Some(n) => n,
                None => return,
            };
            if let Some((ctx, pkt)) = self.pending.remove(&next) {
                self.next_seq = Some(next + 1);
                self.started = true;
                self.place(ctx, pkt);
                continue;
            }
            let first = match self.pending.keys().next() {
                Some(&k) => k,
                None => return,
            };
            let highest = self.highest.unwrap_or(first);
            if highest - next < REORDER_WINDOW {
                return;
            }
            let lost = (first - next) as u64;
            debug!(
                "stream {}: giving up on {} packet(s) starting at seq={:04x}",
                self.stream_id, lost, next as u16
            );
            self.stats.lost += lost;
            match self.group.as_mut() {
                Some(g) => {
                    g.complete = false;
                    g.loss = g.loss.saturating_add(u16::try_from(lost).unwrap_or(u16::MAX));
                }
                None => self.loss_since_frame += lost,
            }
            self.discontinuity = true;
            self.next_seq = Some(first);
        }
    }

    /// Places a released packet into the current frame.
    fn place(&mut self, ctx: PacketContext, pkt: RtpPacket) {
        let timestamp = match self.timeline.advance_to(pkt.timestamp()) {
            Ok(t) => t,
            Err(e) => {
                debug!("stream {}: {}", self.stream_id, e);
                self.stats.invalid += 1;
                return;
            }
        };
        let ts = timestamp.timestamp();
        let floor = match &self.group {
            Some(g) if ts == g.timestamp.timestamp() => None,
            Some(g) => Some(g.timestamp.timestamp()),
            None => self.last_emitted,
        };
        if matches!(floor, Some(f) if ts < f) {
            trace!(
                "stream {}: late timestamp {} seq={:04x}",
                self.stream_id,
                &timestamp,
                pkt.sequence_number()
            );
            self.stats.late += 1;
            return;
        }
        if matches!(&self.group, Some(g) if g.timestamp.timestamp() != ts) {
            // No marker before the next timestamp began.
            if let Some(g) = self.group.as_mut() {
                g.complete = false;
            }
            self.flush();
        }
        let mut group = match self.group.take() {
            Some(g) => {
                self.discontinuity = false;
                g
            }
            None => Group {
                ctx,
                timestamp,
                data: BytesMut::new(),
                complete: !std::mem::take(&mut self.discontinuity)
                    || self.media == MediaType::Audio,
                loss: u16::try_from(std::mem::take(&mut self.loss_since_frame))
                    .unwrap_or(u16::MAX),
            },
        };
        group.ctx = ctx;
        self.stats.bytes += pkt.payload().len() as u64;
        self.depacketizer.push(&pkt, &mut group.data);
        self.group = Some(group);
        if self.media == MediaType::Audio || pkt.mark() {
            self.flush();
        }
    }

    fn flush(&mut self) {
        let mut g = match self.group.take() {
            Some(g) => g,
            None => return,
        };
        self.depacketizer.finish(&mut g.data, g.complete);
        self.stats.frames_emitted += 1;
        if !g.complete {
            self.stats.frames_incomplete += 1;
        }
        self.last_emitted = Some(g.timestamp.timestamp());
        self.ready.push_back(Frame {
            ctx: g.ctx,
            stream_id: self.stream_id,
            media: self.media,
            timestamp: g.timestamp,
            loss: g.loss,
            complete: g.complete,
            data: g.data.freeze(),
        });
    }

    /// Returns the frames completed so far.
    pub fn drain(&mut self) -> impl Iterator<Item = Frame> + '_ {
        self.ready.drain(..)
    }
}

impl std::fmt::Debug for RtpFrameAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpFrameAssembler")
            .field("stream_id", &self.stream_id)
            .field("media", &self.media)
            .field("payload_type", &self.payload_type)
            .field("next_seq", &self.next_seq)
            .field("pending", &self.pending.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Concatenate;
    use crate::rtp::RtpPacketBuilder;

    fn pkt(seq: u16, timestamp: u32, mark: bool, payload: &[u8]) -> RtpPacket {
        RtpPacket::parse(
            RtpPacketBuilder {
                sequence_number: seq,
                timestamp,
                payload_type: 96,
                ssrc: 0x1234_5678,
                mark,
            }
            .build(payload.iter().copied())
            .unwrap(),
        )
        .unwrap()
    }

    fn video() -> RtpFrameAssembler {
        RtpFrameAssembler::new(0, MediaType::Video, 96, 90_000, Box::new(Concatenate)).unwrap()
    }

    /// (elapsed, complete, loss, data)
    fn summarize(a: &mut RtpFrameAssembler) -> Vec<(i64, bool, u16, Vec<u8>)> {
        a.drain()
            .map(|f| (f.timestamp.elapsed(), f.complete, f.loss, f.data.to_vec()))
            .collect()
    }

    #[test]
    fn reordered_matches_in_order() {
        // 4 frames of 3 packets each, crossing the sequence number wrap.
        let pkts: Vec<RtpPacket> = (0..12u16)
            .map(|i| {
                pkt(
                    65530u16.wrapping_add(i),
                    u32::from(i / 3) * 3000,
                    i % 3 == 2,
                    &[i as u8],
                )
            })
            .collect();

        let mut in_order = video();
        in_order.set_initial(Some(65530), None);
        for p in &pkts {
            in_order.ingest(PacketContext::dummy(), p.clone());
        }
        let expected = summarize(&mut in_order);
        assert_eq!(
            expected,
            vec![
                (0, true, 0, vec![0, 1, 2]),
                (3000, true, 0, vec![3, 4, 5]),
                (6000, true, 0, vec![6, 7, 8]),
                (9000, true, 0, vec![9, 10, 11]),
            ]
        );

        let mut reordered = video();
        reordered.set_initial(Some(65530), None);
        for i in [1, 0, 3, 2, 5, 4, 7, 6, 9, 8, 11, 10] {
            reordered.ingest(PacketContext::dummy(), pkts[i].clone());
        }
        assert_eq!(summarize(&mut reordered), expected);
        assert_eq!(reordered.stats().lost, 0);
        assert_eq!(reordered.stats().frames_emitted, 4);
    }

    #[test]
    fn unseeded_start_waits_for_earlier_packets() {
        let a0 = pkt(100, 0, false, b"a");
        let b0 = pkt(101, 0, true, b"b");
        let c1 = pkt(102, 3000, true, b"c");
        let expected = vec![
            (0, true, 0, b"ab".to_vec()),
            (3000, true, 0, b"c".to_vec()),
        ];

        let mut in_order = video();
        for p in [&a0, &b0, &c1] {
            in_order.ingest(PacketContext::dummy(), p.clone());
        }
        assert_eq!(summarize(&mut in_order), expected);

        let mut reordered = video();
        reordered.ingest(PacketContext::dummy(), b0.clone());
        reordered.ingest(PacketContext::dummy(), a0.clone());
        assert!(summarize(&mut reordered).is_empty());
        reordered.ingest(PacketContext::dummy(), c1.clone());
        assert_eq!(summarize(&mut reordered), expected);
        let stats = reordered.stats();
        assert_eq!(stats.late, 0);
        assert_eq!(stats.lost, 0);
    }

    #[test]
    fn unseeded_start_after_window_fills() {
        let mut a = video();

        // No frame boundary is ever seen gap-free: every other packet is missing.
        let ingest = |a: &mut RtpFrameAssembler, seq: u16| {
            a.ingest(
                PacketContext::dummy(),
                pkt(seq, u32::from(seq) * 3000, true, &[seq as u8]),
            )
        };
        for seq in (0..REORDER_WINDOW as u16).step_by(2) {
            ingest(&mut a, seq);
        }
        assert!(summarize(&mut a).is_empty());
        ingest(&mut a, REORDER_WINDOW as u16);
        ingest(&mut a, REORDER_WINDOW as u16 + 2);
        let frames = summarize(&mut a);
        assert_eq!(frames[0], (0, true, 0, vec![0]));
        assert_eq!(frames[1], (6000, false, 1, vec![2]));
    }

    #[test]
    fn loss_inside_frame_charged_to_that_frame() {
        let mut a = video();
        a.set_initial(Some(0), None);
        a.ingest(PacketContext::dummy(), pkt(0, 0, false, b"a"));

        // seq 1, the middle of the first frame, never arrives.
        a.ingest(PacketContext::dummy(), pkt(2, 0, true, b"c"));
        for seq in 3..=33u16 {
            let ts = u32::from(seq - 2) * 3000;
            a.ingest(PacketContext::dummy(), pkt(seq, ts, true, &[seq as u8]));
        }
        let frames = summarize(&mut a);
        assert_eq!(frames.len(), 1 + 31);
        assert_eq!(frames[0], (0, false, 1, b"ac".to_vec()));
        assert_eq!(frames[1], (3000, true, 0, vec![3]));
        assert!(frames[1..].iter().all(|f| f.1 && f.2 == 0));
        let stats = a.stats();
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.frames_incomplete, 1);
    }

    #[test]
    fn loss_gives_incomplete_frame() {
        let mut a = video();
        a.ingest(PacketContext::dummy(), pkt(0, 0, false, b"a"));
        a.ingest(PacketContext::dummy(), pkt(1, 0, true, b"b"));

        // seq 2 (the head of the 3000 frame) never arrives.
        for seq in 3..=34u16 {
            let ts = u32::from(seq - 2) * 3000;
            a.ingest(PacketContext::dummy(), pkt(seq, ts, true, &[seq as u8]));
        }
        let frames = summarize(&mut a);
        assert_eq!(frames.len(), 1 + 32);
        assert_eq!(frames[0], (0, true, 0, b"ab".to_vec()));
        assert_eq!(frames[1], (3000, false, 1, vec![3]));
        assert_eq!(frames[2], (6000, true, 0, vec![4]));
        assert!(frames.windows(2).all(|w| w[0].0 <= w[1].0));
        let stats = a.stats();
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.frames_incomplete, 1);
    }

    #[test]
    fn late_and_duplicate() {
        let mut a = video();
        a.ingest(PacketContext::dummy(), pkt(10, 0, true, b"a"));
        a.ingest(PacketContext::dummy(), pkt(11, 3000, true, b"b"));
        a.ingest(PacketContext::dummy(), pkt(10, 0, true, b"a"));
        a.ingest(PacketContext::dummy(), pkt(13, 9000, true, b"d"));
        a.ingest(PacketContext::dummy(), pkt(13, 9000, true, b"d"));
        let stats = a.stats();
        assert_eq!(stats.received, 5);
        assert_eq!(stats.late, 1);
        assert_eq!(stats.duplicate, 1);
        assert_eq!(summarize(&mut a).len(), 2);

        a.ingest(PacketContext::dummy(), pkt(12, 6000, true, b"c"));
        let frames = summarize(&mut a);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].3, b"c");
        assert_eq!(frames[1].3, b"d");
    }

    #[test]
    fn backward_timestamp_dropped() {
        let mut a = video();
        a.ingest(PacketContext::dummy(), pkt(0, 6000, true, b"a"));
        a.ingest(PacketContext::dummy(), pkt(1, 3000, true, b"b"));
        a.ingest(PacketContext::dummy(), pkt(2, 9000, true, b"c"));
        let frames = summarize(&mut a);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].0, 3000);
        assert_eq!(a.stats().late, 1);
    }

    #[test]
    fn missing_marker_flushed_incomplete() {
        let mut a = video();
        a.set_initial(Some(0), None);
        a.ingest(PacketContext::dummy(), pkt(0, 0, false, b"a"));
        a.ingest(PacketContext::dummy(), pkt(1, 3000, true, b"b"));
        let frames = summarize(&mut a);
        assert_eq!(
            frames,
            vec![(0, false, 0, b"a".to_vec()), (3000, true, 0, b"b".to_vec())]
        );
    }

    #[test]
    fn audio_frame_per_packet() {
        let mut a =
            RtpFrameAssembler::new(1, MediaType::Audio, 0, 8_000, Box::new(Concatenate)).unwrap();
        for seq in 0..4u16 {
            let p = RtpPacket::parse(
                RtpPacketBuilder {
                    sequence_number: seq,
                    timestamp: 1_000 + u32::from(seq) * 160,
                    payload_type: 0,
                    ssrc: 1,
                    mark: false,
                }
                .build([seq as u8; 160])
                .unwrap(),
            )
            .unwrap();
            a.ingest(PacketContext::dummy(), p);
        }
        let frames: Vec<Frame> = a.drain().collect();
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|f| f.complete && f.media == MediaType::Audio));
        assert_eq!(frames[3].timestamp.elapsed(), 480);
        assert_eq!(frames[3].stream_id, 1);
    }

    #[test]
    fn wrong_payload_type() {
        let mut a = video();
        let p = RtpPacket::parse(
            RtpPacketBuilder {
                sequence_number: 0,
                timestamp: 0,
                payload_type: 97,
                ssrc: 1,
                mark: true,
            }
            .build(*b"x")
            .unwrap(),
        )
        .unwrap();
        a.ingest(PacketContext::dummy(), p);
        assert_eq!(a.stats().invalid, 1);
        assert_eq!(a.drain().count(), 0);
    }

    #[test]
    fn rtp_info_seed() {
        let mut a = video();
        a.set_initial(Some(100), Some(90_000));

        // Server starts slightly before its advertised seq.
        a.ingest(PacketContext::dummy(), pkt(99, 90_000, true, b"a"));
        a.ingest(PacketContext::dummy(), pkt(100, 93_000, true, b"b"));
        let frames = summarize(&mut a);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0, 0);
        assert_eq!(frames[1].0, 3000);
    }
}
