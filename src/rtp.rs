// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handles RTP data as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).

use std::convert::TryFrom;

use bytes::Bytes;

/// The minimum length of an RTP header (no CSRCs or extensions).
const MIN_HEADER_LEN: usize = 12;

/// A validated RTP packet.
///
/// The header fields are decoded once; the payload is a zero-copy slice of
/// the received buffer with CSRCs, header extension, and padding removed.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |            contributing source (CSRC) identifiers             |
/// |                             ....                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Clone)]
pub struct RtpPacket {
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
    payload_type: u8,
    mark: bool,
    payload: Bytes,
}

impl RtpPacket {
    /// Validates a raw RTP packet.
    pub fn parse(data: Bytes) -> Result<Self, RtpPacketError> {
        // RTP doesn't have a defined maximum size but it's implied by the transport:
        // * UDP packets (even with fragmentation) are at most 65,536 (minus IP/UDP headers).
        // * interleaved RTSP data messages have at most 65,536 bytes of data.
        if u16::try_from(data.len()).is_err() {
            return Err(RtpPacketError {
                reason: "too long",
                data,
            });
        }
        let len = data.len();
        if len < MIN_HEADER_LEN {
            return Err(RtpPacketError {
                reason: "too short",
                data,
            });
        }
        if (data[0] & 0b1100_0000) != 2 << 6 {
            return Err(RtpPacketError {
                reason: "must be version 2",
                data,
            });
        }
        let has_padding = (data[0] & 0b0010_0000) != 0;
        let has_extension = (data[0] & 0b0001_0000) != 0;
        let csrc_count = usize::from(data[0] & 0b0000_1111);
        let csrc_end = MIN_HEADER_LEN + 4 * csrc_count;
        let payload_start = if has_extension {
            if len < csrc_end + 4 {
                return Err(RtpPacketError {
                    reason: "extension is after end of packet",
                    data,
                });
            }
            // 16-bit profile-defined id, then length in 32-bit words.
            let extension_words =
                usize::from(u16::from_be_bytes([data[csrc_end + 2], data[csrc_end + 3]]));
            csrc_end + 4 + 4 * extension_words
        } else {
            csrc_end
        };
        if len < payload_start {
            return Err(RtpPacketError {
                reason: "payload start is after end of packet",
                data,
            });
        }
        let payload_end = if has_padding {
            if len == payload_start {
                return Err(RtpPacketError {
                    reason: "missing padding",
                    data,
                });
            }
            let padding_len = usize::from(data[len - 1]);
            if padding_len == 0 {
                return Err(RtpPacketError {
                    reason: "invalid padding length 0",
                    data,
                });
            }
            match len.checked_sub(padding_len) {
                Some(e) if e >= payload_start => e,
                _ => {
                    return Err(RtpPacketError {
                        reason: "bad padding",
                        data,
                    })
                }
            }
        } else {
            len
        };
        Ok(RtpPacket {
            mark: (data[1] & 0b1000_0000) != 0,
            payload_type: data[1] & 0b0111_1111,
            sequence_number: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            payload: data.slice(payload_start..payload_end),
        })
    }

    #[inline]
    pub fn mark(&self) -> bool {
        self.mark
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Returns the 32-bit media clock timestamp as it appears on the wire.
    #[inline]
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

impl std::fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpPacket")
            .field("ssrc", &self.ssrc)
            .field("sequence_number", &self.sequence_number)
            .field("timestamp", &self.timestamp)
            .field("payload_type", &self.payload_type)
            .field("mark", &self.mark)
            .field("payload", &crate::hex::LimitedHex::new(&self.payload, 64))
            .finish()
    }
}

#[derive(Debug)]
#[doc(hidden)]
pub struct RtpPacketError {
    pub reason: &'static str,
    pub data: Bytes,
}

impl std::fmt::Display for RtpPacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid RTP packet ({}): {}",
            self.reason,
            crate::hex::LimitedHex::new(&self.data, 64)
        )
    }
}

/// Builds RTP packets on the wire format. Unstable/internal. Exposed for benchmarks.
#[doc(hidden)]
pub struct RtpPacketBuilder {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub ssrc: u32,
    pub mark: bool,
}

impl RtpPacketBuilder {
    /// Returns the full serialized packet.
    pub fn build<P: IntoIterator<Item = u8>>(self, payload: P) -> Result<Bytes, &'static str> {
        if self.payload_type >= 0x80 {
            return Err("payload type too large");
        }
        let data: Bytes = [
            2 << 6, // version=2, no padding, no extensions, no CSRCs.
            if self.mark { 0b1000_0000 } else { 0 } | self.payload_type,
        ]
        .into_iter()
        .chain(self.sequence_number.to_be_bytes())
        .chain(self.timestamp.to_be_bytes())
        .chain(self.ssrc.to_be_bytes())
        .chain(payload)
        .collect();
        if u16::try_from(data.len()).is_err() {
            return Err("payload too long");
        }
        Ok(data)
    }
}
