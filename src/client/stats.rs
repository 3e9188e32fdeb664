// Copyright (C) 2021 rtspflow contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session statistics.

use std::time::Duration;

use tokio::time::Instant;

use super::assembler::AssemblerStats;

/// A snapshot of a session's media counters, refreshed every
/// [`super::SessionOptions::stats_interval`].
///
/// Counters are totals since `PLAY`; rates cover the most recent interval.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Statistics {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_late: u64,
    pub packets_duplicate: u64,

    /// Packets with an unparseable header or unexpected payload type.
    pub packets_invalid: u64,
    pub rtcp_packets: u64,
    pub frames_emitted: u64,
    pub frames_incomplete: u64,

    /// Frames discarded because the consumer wasn't keeping up.
    pub frames_dropped: u64,
    pub bitrate_bps: f64,
    pub frame_rate: f64,
}

/// Accumulates the counters the assemblers don't keep, and turns byte and
/// frame deltas into rates.
#[derive(Debug)]
pub(crate) struct StatsCollector {
    interval: Duration,
    window_start: Instant,
    window_bytes: u64,
    window_frames: u64,
    rtcp_packets: u64,
    invalid_packets: u64,
    frames_dropped: u64,
}

impl StatsCollector {
    pub(crate) fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            window_start: now,
            window_bytes: 0,
            window_frames: 0,
            rtcp_packets: 0,
            invalid_packets: 0,
            frames_dropped: 0,
        }
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.window_start + self.interval
    }

    pub(crate) fn rtcp(&mut self) {
        self.rtcp_packets += 1;
    }

    /// Counts a packet which failed RTP header validation.
    pub(crate) fn invalid(&mut self) {
        self.invalid_packets += 1;
    }

    pub(crate) fn frame(&mut self, len: usize) {
        self.window_frames += 1;
        self.window_bytes += len as u64;
    }

    pub(crate) fn dropped(&mut self) {
        self.frames_dropped += 1;
    }

    /// Builds a snapshot from the streams' totals and starts a new window.
    pub(crate) fn publish<I>(&mut self, now: Instant, streams: I) -> Statistics
    where
        I: IntoIterator<Item = AssemblerStats>,
    {
        let mut s = Statistics {
            packets_invalid: self.invalid_packets,
            rtcp_packets: self.rtcp_packets,
            frames_dropped: self.frames_dropped,
            ..Default::default()
        };
        for a in streams {
            s.packets_received += a.received;
            s.packets_lost += a.lost;
            s.packets_late += a.late;
            s.packets_duplicate += a.duplicate;
            s.packets_invalid += a.invalid;
            s.frames_emitted += a.frames_emitted;
            s.frames_incomplete += a.frames_incomplete;
        }
        let secs = now.saturating_duration_since(self.window_start).as_secs_f64();
        if secs > 0.0 {
            s.bitrate_bps = (self.window_bytes * 8) as f64 / secs;
            s.frame_rate = self.window_frames as f64 / secs;
        }
        self.window_start = now;
        self.window_bytes = 0;
        self.window_frames = 0;
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_and_totals() {
        let start = Instant::now();
        let mut c = StatsCollector::new(Duration::from_secs(5), start);
        assert_eq!(c.deadline(), start + Duration::from_secs(5));
        for _ in 0..50 {
            c.frame(1_000);
        }
        c.rtcp();
        c.invalid();
        c.dropped();
        let video = AssemblerStats {
            received: 100,
            lost: 2,
            invalid: 1,
            frames_emitted: 48,
            frames_incomplete: 1,
            ..Default::default()
        };
        let audio = AssemblerStats {
            received: 10,
            late: 1,
            frames_emitted: 10,
            ..Default::default()
        };
        let s = c.publish(start + Duration::from_secs(5), [video, audio]);
        assert_eq!(s.packets_received, 110);
        assert_eq!(s.packets_lost, 2);
        assert_eq!(s.packets_late, 1);
        assert_eq!(s.packets_invalid, 2);
        assert_eq!(s.rtcp_packets, 1);
        assert_eq!(s.frames_emitted, 58);
        assert_eq!(s.frames_dropped, 1);
        assert_eq!(s.bitrate_bps, 80_000.0);
        assert_eq!(s.frame_rate, 10.0);

        // A fresh window has no traffic.
        let s = c.publish(start + Duration::from_secs(10), std::iter::empty());
        assert_eq!(s.bitrate_bps, 0.0);
        assert_eq!(s.rtcp_packets, 1);
        assert_eq!(c.deadline(), start + Duration::from_secs(15));
    }
}
