// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interleaved channel id → stream assignments on the control connection.

use std::num::NonZeroU8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelType {
    Rtp,
    Rtcp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelMapping {
    pub stream_i: usize,
    pub channel_type: ChannelType,
}

/// Mapping of the 256 possible interleaved channel ids to stream indices.
///
/// Even ids carry RTP and their odd successors RTCP for the same stream.
/// [RFC 2326 section 10.12](https://tools.ietf.org/html/rfc2326#section-10.12)
/// says `interleaved=n` also assigns `n+1`; a server insisting on an odd `n`
/// is rejected. Slot `i` holds `stream_i + 1` for channel pair `2i`/`2i+1`.
#[derive(Default)]
pub struct ChannelMappings(smallvec::SmallVec<[Option<NonZeroU8>; 4]>);

impl ChannelMappings {
    /// Returns the lowest unassigned even channel id, or `None` if all are taken.
    pub fn next_unassigned(&self) -> Option<u8> {
        let slot = self
            .0
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.0.len());
        u8::try_from(slot << 1).ok()
    }

    /// Assigns an even channel id to RTP and its successor to RTCP for `stream_i`.
    pub fn assign(&mut self, channel_id: u8, stream_i: usize) -> Result<(), String> {
        if (channel_id & 1) != 0 {
            return Err(format!("Can't assign odd channel id {}", channel_id));
        }
        let encoded = u8::try_from(stream_i + 1)
            .ok()
            .and_then(NonZeroU8::new)
            .ok_or_else(|| format!("Can't assign channel to stream {}", stream_i))?;
        let slot = usize::from(channel_id >> 1);
        if slot >= self.0.len() {
            self.0.resize(slot + 1, None);
        }
        match self.0[slot] {
            Some(existing) => Err(format!(
                "Channel id {} is already assigned to stream {}; won't reassign to stream {}",
                channel_id,
                existing.get() - 1,
                stream_i
            )),
            None => {
                self.0[slot] = Some(encoded);
                Ok(())
            }
        }
    }

    /// Looks up a channel id's mapping.
    pub fn lookup(&self, channel_id: u8) -> Option<ChannelMapping> {
        let c = (*self.0.get(usize::from(channel_id >> 1))?)?;
        Some(ChannelMapping {
            stream_i: usize::from(c.get() - 1),
            channel_type: if (channel_id & 1) == 0 {
                ChannelType::Rtp
            } else {
                ChannelType::Rtcp
            },
        })
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl std::fmt::Debug for ChannelMappings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.iter().enumerate().filter_map(|(i, v)| {
                v.map(|v| (format!("{}-{}", i << 1, (i << 1) + 1), v.get() - 1))
            }))
            .finish()
    }
}
