// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based RTSP control [`Connection`] and UDP socket pairs.
//!
//! The connection is split into a read half, which the session drives from
//! its own reader task, and a write half, owned by a writer task. Both halves
//! share one [`Codec`] implementation: RTSP messages and interleaved binary
//! chunks are decoded from the same byte stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, Stream, StreamExt};
use rtsp_types::{Data, Message};
use std::time::Instant;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::codec::{FramedRead, FramedWrite};
use url::Host;

use crate::{Error, ErrorInt, RtspMessageContext};

use super::{ConnectionContext, ReceivedMessage, WallTime};

/// A freshly established RTSP connection, not yet split into halves.
pub(crate) struct Connection {
    ctx: ConnectionContext,
    stream: TcpStream,
}

impl Connection {
    pub(crate) async fn connect(host: Host<&str>, port: u16) -> Result<Self, std::io::Error> {
        let stream = match host {
            Host::Domain(h) => TcpStream::connect((h, port)).await,
            Host::Ipv4(h) => TcpStream::connect((h, port)).await,
            Host::Ipv6(h) => TcpStream::connect((h, port)).await,
        }?;
        Self::from_stream(stream)
    }

    pub(crate) fn from_stream(stream: TcpStream) -> Result<Self, std::io::Error> {
        let established_wall = WallTime::now();
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            ctx: ConnectionContext {
                local_addr,
                peer_addr,
                established_wall,
            },
            stream,
        })
    }

    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.ctx
    }

    pub(crate) fn split(self) -> (ConnectionReader, ConnectionWriter) {
        let (r, w) = self.stream.into_split();
        (
            ConnectionReader {
                ctx: self.ctx,
                inner: FramedRead::new(r, Codec { read_pos: 0 }),
            },
            ConnectionWriter {
                ctx: self.ctx,
                inner: FramedWrite::new(w, Codec { read_pos: 0 }),
            },
        )
    }
}

/// Read half: a `Stream` of RTSP messages and interleaved data.
pub(crate) struct ConnectionReader {
    ctx: ConnectionContext,
    inner: FramedRead<OwnedReadHalf, Codec>,
}

impl ConnectionReader {
    pub(crate) fn eof_ctx(&self) -> RtspMessageContext {
        RtspMessageContext {
            pos: self.inner.decoder().read_pos + crate::to_u64(self.inner.read_buffer().remaining()),
            received_wall: WallTime::now(),
            received: Instant::now(),
        }
    }
}

impl Stream for ConnectionReader {
    type Item = Result<ReceivedMessage, Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx).map_err(|e| {
            wrap!(match e {
                CodecError::IoError(error) => ErrorInt::RtspReadError {
                    conn_ctx: self.ctx,
                    msg_ctx: self.eof_ctx(),
                    source: error,
                },
                CodecError::ParseError { description, pos } => ErrorInt::RtspFramingError {
                    conn_ctx: self.ctx,
                    msg_ctx: RtspMessageContext {
                        pos,
                        received_wall: WallTime::now(),
                        received: Instant::now(),
                    },
                    description,
                },
            })
        })
    }
}

/// Write half.
pub(crate) struct ConnectionWriter {
    ctx: ConnectionContext,
    inner: FramedWrite<OwnedWriteHalf, Codec>,
}

impl ConnectionWriter {
    pub(crate) async fn send(&mut self, msg: Message<Bytes>) -> Result<(), Error> {
        self.inner.send(msg).await.map_err(|e| match e {
            CodecError::IoError(source) => wrap!(ErrorInt::WriteError {
                conn_ctx: self.ctx,
                source,
            }),
            CodecError::ParseError { .. } => unreachable!(),
        })
    }

    /// Shuts down the write side, which lets the server notice we're gone.
    pub(crate) async fn close(&mut self) {
        let _ = self.inner.close().await;
    }
}

/// Encodes and decodes RTSP messages.
struct Codec {
    /// Number of bytes read and processed (drained from the input buffer).
    read_pos: u64,
}

/// An intermediate error type that exists because [`FramedRead`] expects the
/// codec's error type to implement `From<std::io::Error>`, and [`Error`]
/// takes additional context.
#[derive(Debug)]
enum CodecError {
    IoError(std::io::Error),
    ParseError { description: String, pos: u64 },
}

impl std::convert::From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::IoError(e)
    }
}

/// Returns the range within `buf` that represents `subset`, or `None` if
/// `subset` is empty.
fn as_range(buf: &[u8], subset: &[u8]) -> Option<std::ops::Range<usize>> {
    if subset.is_empty() {
        return None;
    }
    let off = (subset.as_ptr() as usize)
        .checked_sub(buf.as_ptr() as usize)
        .expect("subset within buf");
    let end = off + subset.len();
    assert!(end <= buf.len());
    Some(off..end)
}

impl Codec {
    fn parse_msg(&self, src: &mut BytesMut) -> Result<Option<(usize, Message<Bytes>)>, CodecError> {
        // Skip whitespace as `rtsp-types` does. Some servers send a stray
        // CRLF after a message body; it must not hide a following `$`.
        let mut skipped = 0;
        while src.starts_with(b"\r\n") {
            src.advance(2);
            skipped += 2;
        }

        if !src.is_empty() && src[0] == b'$' {
            // Interleaved binary data: `$`, channel id, 16-bit big-endian
            // length, payload.
            if src.len() < 4 {
                return Ok(None);
            }
            let channel_id = src[1];
            let len = 4 + usize::from(u16::from_be_bytes([src[2], src[3]]));
            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }
            let mut msg = src.split_to(len);
            msg.advance(4);
            return Ok(Some((
                skipped + len,
                Message::Data(Data::new(channel_id, msg.freeze())),
            )));
        }

        let (msg, len): (Message<&[u8]>, _) = match Message::parse(src) {
            Ok((m, l)) => (m, l),
            Err(rtsp_types::ParseError::Error) => {
                return Err(CodecError::ParseError {
                    description: format!(
                        "Invalid RTSP message; buffered:\n{:#?}",
                        crate::hex::LimitedHex::new(&src[..], 128),
                    ),
                    pos: self.read_pos + crate::to_u64(skipped),
                });
            }
            Err(rtsp_types::ParseError::Incomplete(_)) => return Ok(None),
        };

        // Move the body into a `Bytes` without copying. The message borrows
        // `src`, so first detach it from the body, then split `src`.
        let msg = match msg {
            Message::Response(msg) => {
                let body_range = as_range(src, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                if let Some(r) = body_range {
                    let mut raw_msg = src.split_to(len);
                    raw_msg.advance(r.start);
                    raw_msg.truncate(r.len());
                    Message::Response(msg.replace_body(raw_msg.freeze()))
                } else {
                    src.advance(len);
                    Message::Response(msg.replace_body(Bytes::new()))
                }
            }
            Message::Request(msg) => {
                // Server-to-client requests (eg ANNOUNCE, SET_PARAMETER) are
                // passed up so the session can log them; the body is unused.
                let msg = msg.replace_body(rtsp_types::Empty);
                src.advance(len);
                Message::Request(msg.replace_body(Bytes::new()))
            }
            Message::Data(_) => unreachable!(),
        };
        Ok(Some((skipped + len, msg)))
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (len, msg) = match self.parse_msg(src)? {
            None => return Ok(None),
            Some((len, msg)) => (len, msg),
        };
        let msg = ReceivedMessage {
            msg,
            ctx: RtspMessageContext {
                pos: self.read_pos,
                received_wall: WallTime::now(),
                received: Instant::now(),
            },
        };
        self.read_pos += crate::to_u64(len);
        Ok(Some(msg))
    }
}

impl tokio_util::codec::Encoder<Message<Bytes>> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: Message<Bytes>, mut dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write(&mut (&mut dst).writer())
            .expect("BufMut Writer is infallible");
        Ok(())
    }
}

/// tokio-specific version of [`crate::UdpPair`].
pub(crate) struct UdpPair {
    pub(crate) rtp_port: u16,
    pub(crate) rtp_socket: UdpSocket,
    pub(crate) rtcp_socket: UdpSocket,
}

impl UdpPair {
    pub(crate) fn for_ip(ip_addr: std::net::IpAddr) -> Result<Self, std::io::Error> {
        Self::from_std(crate::UdpPair::for_ip(ip_addr)?)
    }

    pub(crate) fn for_ports(
        ip_addr: std::net::IpAddr,
        rtp_port: u16,
        rtcp_port: u16,
    ) -> Result<Self, std::io::Error> {
        Self::from_std(crate::UdpPair::for_ports(ip_addr, rtp_port, rtcp_port)?)
    }

    fn from_std(inner: crate::UdpPair) -> Result<Self, std::io::Error> {
        inner.rtp_socket.set_nonblocking(true)?;
        inner.rtcp_socket.set_nonblocking(true)?;
        Ok(Self {
            rtp_port: inner.rtp_port,
            rtp_socket: UdpSocket::from_std(inner.rtp_socket)?,
            rtcp_socket: UdpSocket::from_std(inner.rtcp_socket)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::codec::Decoder;

    use super::*;

    fn decode_all(buf: &[u8]) -> (Vec<ReceivedMessage>, BytesMut) {
        let mut codec = Codec { read_pos: 0 };
        let mut buf = BytesMut::from(buf);
        let mut out = Vec::new();
        while let Some(m) = codec.decode(&mut buf).unwrap() {
            out.push(m);
        }
        (out, buf)
    }

    #[test]
    fn crlf_data() {
        let (msgs, rest) = decode_all(b"\r\n$\x00\x00\x04asdfrest");
        assert_eq!(msgs.len(), 1);
        assert_eq!(&rest[..], b"rest");
    }

    /// Chunks for channels 0 and 1 back-to-back in one read, followed by a
    /// response, come out as three independent messages.
    #[test]
    fn back_to_back_interleaved() {
        let (msgs, rest) = decode_all(
            b"$\x00\x00\x03abc$\x01\x00\x02xyRTSP/1.0 200 OK\r\nCSeq: 3\r\n\r\n$\x00\x00",
        );
        assert_eq!(msgs.len(), 3);
        match &msgs[0].msg {
            Message::Data(d) => {
                assert_eq!(d.channel_id(), 0);
                assert_eq!(&d.clone().into_body()[..], b"abc");
            }
            o => panic!("unexpected {:?}", o),
        }
        match &msgs[1].msg {
            Message::Data(d) => {
                assert_eq!(d.channel_id(), 1);
                assert_eq!(&d.clone().into_body()[..], b"xy");
            }
            o => panic!("unexpected {:?}", o),
        }
        assert!(matches!(&msgs[2].msg, Message::Response(r) if r.status() == rtsp_types::StatusCode::Ok));
        assert_eq!(msgs[1].ctx.pos(), 7);
        assert_eq!(msgs[2].ctx.pos(), 13);

        // Incomplete trailing header stays buffered.
        assert_eq!(&rest[..], b"$\x00\x00");
    }

    #[test]
    fn response_body() {
        let (msgs, rest) = decode_all(
            b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: 4\r\n\r\nv=0\n",
        );
        assert!(rest.is_empty());
        match &msgs[0].msg {
            Message::Response(r) => assert_eq!(&r.body()[..], b"v=0\n"),
            o => panic!("unexpected {:?}", o),
        }
    }
}
