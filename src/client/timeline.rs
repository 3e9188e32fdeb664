// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::num::NonZeroU32;

use crate::Timestamp;

/// Creates [Timestamp]s (which don't wrap and can be converted to NPT aka normal play time)
/// from 32-bit (wrapping) RTP timestamps. Unstable, exposed for benchmark.
///
/// Each RTP timestamp is interpreted relative to the previous one: a
/// difference of up to `i32::MAX` in either direction is taken at face value,
/// so the timeline follows wraparound in both directions.
#[doc(hidden)]
#[derive(Debug)]
pub struct Timeline {
    /// The most recently placed timestamp.
    timestamp: i64,
    clock_rate: NonZeroU32,

    /// The stream's start; set from `RTP-Info` or the first packet.
    start: Option<u32>,
}

impl Timeline {
    /// Creates a new timeline, erroring on a zero clock rate.
    pub fn new(start: Option<u32>, clock_rate: u32) -> Result<Self, String> {
        let clock_rate = NonZeroU32::new(clock_rate)
            .ok_or_else(|| "clock_rate=0 rejected to prevent division by zero".to_string())?;
        Ok(Timeline {
            timestamp: i64::from(start.unwrap_or(0)),
            start,
            clock_rate,
        })
    }

    /// Returns true until the first timestamp is placed or a start is given.
    pub fn is_unstarted(&self) -> bool {
        self.start.is_none()
    }

    /// Sets the stream start, as from the `rtptime` of a `RTP-Info` header.
    /// Ignored once the timeline has started.
    pub fn set_start(&mut self, rtptime: u32) {
        if self.start.is_none() {
            self.start = Some(rtptime);
            self.timestamp = i64::from(rtptime);
        }
    }

    /// Places the given (wrapping) RTP timestamp on the timeline and makes it
    /// the reference for the next call.
    pub fn advance_to(&mut self, rtp_timestamp: u32) -> Result<Timestamp, String> {
        let start = *self.start.get_or_insert_with(|| {
            self.timestamp = i64::from(rtp_timestamp);
            rtp_timestamp
        });
        let delta = (rtp_timestamp as i32).wrapping_sub(self.timestamp as i32);
        let timestamp = self
            .timestamp
            .checked_add(i64::from(delta))
            .ok_or_else(|| format!("timestamp {} + delta {} won't fit in i64!", self.timestamp, delta))?;
        let ts = Timestamp::new(timestamp, self.clock_rate, start).ok_or_else(|| {
            format!(
                "timestamp {} + delta {} - start {} underflows i64!",
                self.timestamp, delta, start
            )
        })?;
        self.timestamp = timestamp;
        Ok(ts)
    }
}
