// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Media frames and the pluggable depacketization policy.
//!
//! The session core only knows generic RTP framing: packets sharing an RTP
//! timestamp make up one frame, and the marker bit ends it. How the payloads
//! of those packets are combined into the bytes a decoder expects is a
//! codec-specific matter left to a [`Depacketizer`]. The default,
//! [`Concatenate`], appends payloads in sequence order.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::client::MediaDescription;
use crate::rtp::RtpPacket;
use crate::PacketContext;

/// The kind of media carried by a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MediaType {
    Audio,
    Video,
}

impl MediaType {
    /// Parses the media field of an SDP `m=` line.
    pub(crate) fn from_sdp(media: &str) -> Option<Self> {
        if media.eq_ignore_ascii_case("video") {
            Some(MediaType::Video)
        } else if media.eq_ignore_ascii_case("audio") {
            Some(MediaType::Audio)
        } else {
            None
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
        })
    }
}

/// A reassembled access unit: one picture of video or one block of audio
/// samples.
pub struct Frame {
    /// Context of the last packet which contributed to this frame.
    pub ctx: PacketContext,

    /// Index of the stream within the session's negotiated streams.
    pub stream_id: usize,

    pub media: MediaType,

    /// Presentation time, unwrapped from the 32-bit RTP timestamp.
    pub timestamp: crate::Timestamp,

    /// Number of RTP packets known lost since the previous frame was emitted.
    pub loss: u16,

    /// False if a packet belonging to this frame was lost, or if the frame
    /// was flushed before its marker packet arrived. Such frames are still
    /// delivered; the decoder decides whether to use them.
    pub complete: bool,

    pub data: Bytes,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("stream_id", &self.stream_id)
            .field("media", &self.media)
            .field("ctx", &self.ctx)
            .field("timestamp", &self.timestamp)
            .field("loss", &self.loss)
            .field("complete", &self.complete)
            .field("data", &crate::hex::LimitedHex::new(&self.data, 64))
            .finish()
    }
}

/// Combines the payloads of one frame's RTP packets into frame data.
///
/// Packets are handed over in sequence-number order. When packets were lost
/// the frame is still finished; `complete` tells the implementation so it
/// can drop partial codec state.
pub trait Depacketizer: Send {
    fn push(&mut self, pkt: &RtpPacket, out: &mut BytesMut);

    /// Called once per frame before it is emitted.
    fn finish(&mut self, out: &mut BytesMut, complete: bool) {
        let _ = (out, complete);
    }
}

/// Appends each payload unchanged.
#[derive(Default)]
pub struct Concatenate;

impl Depacketizer for Concatenate {
    fn push(&mut self, pkt: &RtpPacket, out: &mut BytesMut) {
        out.extend_from_slice(pkt.payload());
    }
}

/// Creates a [`Depacketizer`] for each negotiated stream.
pub type DepacketizerFactory =
    Arc<dyn Fn(&MediaDescription) -> Box<dyn Depacketizer> + Send + Sync>;

pub(crate) fn default_factory() -> DepacketizerFactory {
    Arc::new(|_| Box::new(Concatenate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::RtpPacketBuilder;

    #[test]
    fn media_type() {
        assert_eq!(MediaType::from_sdp("VIDEO"), Some(MediaType::Video));
        assert_eq!(MediaType::from_sdp("audio"), Some(MediaType::Audio));
        assert_eq!(MediaType::from_sdp("application"), None);
        assert_eq!(MediaType::Video.to_string(), "video");
    }

    #[test]
    fn concatenate() {
        let mut d = Concatenate;
        let mut out = BytesMut::new();
        for (i, p) in [&b"ab"[..], b"cd"].iter().enumerate() {
            let pkt = RtpPacket::parse(
                RtpPacketBuilder {
                    sequence_number: i as u16,
                    timestamp: 0,
                    payload_type: 96,
                    ssrc: 1,
                    mark: i == 1,
                }
                .build(p.iter().copied())
                .unwrap(),
            )
            .unwrap();
            d.push(&pkt, &mut out);
        }
        d.finish(&mut out, true);
        assert_eq!(&out[..], b"abcd");
    }
}
