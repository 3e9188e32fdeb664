// Copyright (C) 2021 rtspflow contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-stream media transports: UDP socket pairs or interleaved channels on
//! the control connection.

use std::collections::HashMap;
use std::net::IpAddr;

use bytes::Bytes;
use log::{debug, trace};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::channel_mapping::{ChannelMapping, ChannelMappings, ChannelType};
use super::parse::SetupResponse;
use super::Transport;
use crate::tokio::UdpPair;
use crate::PacketContext;

const DATAGRAM_QUEUE_LEN: usize = 64;

/// Largest possible UDP payload.
const MAX_DATAGRAM: usize = 65_536;

/// A datagram (or receive failure) from one of the UDP reader tasks.
#[derive(Debug)]
pub(crate) struct Datagram {
    pub(crate) stream_i: usize,
    pub(crate) channel_type: ChannelType,
    pub(crate) ctx: PacketContext,
    pub(crate) result: Result<Bytes, std::io::Error>,
}

/// Why a `SETUP` response could not be applied.
#[derive(Debug)]
pub(crate) enum ConfirmError {
    /// The response doesn't describe a usable transport.
    Negotiation(String),

    /// The server named client ports that couldn't be bound locally.
    Bind(std::io::Error),
}

/// Owns every media transport of one session attempt.
///
/// Sockets are bound when the `SETUP` request is built so that a bind failure
/// fails the `SETUP` itself. The server's `Transport` response header then
/// decides what is actually used.
pub(crate) struct TransportManager {
    mode: Transport,
    channels: ChannelMappings,

    /// UDP pairs bound for a `SETUP` still awaiting its response.
    proposed: HashMap<usize, UdpPair>,

    tx: mpsc::Sender<Datagram>,
    rx: mpsc::Receiver<Datagram>,
    tasks: Vec<JoinHandle<()>>,
    released: bool,
}

impl TransportManager {
    pub(crate) fn new(mode: Transport) -> Self {
        let (tx, rx) = mpsc::channel(DATAGRAM_QUEUE_LEN);
        Self {
            mode,
            channels: ChannelMappings::default(),
            proposed: HashMap::new(),
            tx,
            rx,
            tasks: Vec::new(),
            released: false,
        }
    }

    /// Allocates transport resources for a stream; returns the `Transport`
    /// header value to propose in its `SETUP` request.
    pub(crate) fn setup(
        &mut self,
        stream_i: usize,
        local_ip: IpAddr,
    ) -> Result<String, std::io::Error> {
        match self.mode {
            Transport::Tcp => {
                let id = self.channels.next_unassigned().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "all interleaved channel ids are in use",
                    )
                })?;
                Ok(format!("RTP/AVP/TCP;unicast;interleaved={}-{}", id, id + 1))
            }
            Transport::Udp => {
                let pair = UdpPair::for_ip(local_ip)?;
                let port = pair.rtp_port;
                debug!(
                    "stream {}: bound UDP ports {}-{} on {}",
                    stream_i,
                    port,
                    port + 1,
                    local_ip
                );
                self.proposed.insert(stream_i, pair);
                Ok(format!("RTP/AVP;unicast;client_port={}-{}", port, port + 1))
            }
        }
    }

    /// Applies the server's `SETUP` response for a stream. Client ports named
    /// by the server replace the proposed ones.
    pub(crate) fn confirm(
        &mut self,
        stream_i: usize,
        response: &SetupResponse,
        local_ip: IpAddr,
        peer_ip: IpAddr,
    ) -> Result<(), ConfirmError> {
        match self.mode {
            Transport::Tcp => {
                let channel_id = response.channel_id.ok_or_else(|| {
                    ConfirmError::Negotiation(
                        "SETUP response Transport header lacks interleaved channel".to_owned(),
                    )
                })?;
                self.channels
                    .assign(channel_id, stream_i)
                    .map_err(ConfirmError::Negotiation)
            }
            Transport::Udp => {
                let proposed = self.proposed.remove(&stream_i).ok_or_else(|| {
                    ConfirmError::Negotiation(format!(
                        "no UDP ports were bound for stream {}",
                        stream_i
                    ))
                })?;
                let pair = match response.client_port {
                    Some((rtp, rtcp)) if rtp != proposed.rtp_port => {
                        debug!(
                            "stream {}: server chose client_port={}-{} over proposed {}-{}",
                            stream_i,
                            rtp,
                            rtcp,
                            proposed.rtp_port,
                            proposed.rtp_port + 1
                        );
                        drop(proposed);
                        UdpPair::for_ports(local_ip, rtp, rtcp).map_err(ConfirmError::Bind)?
                    }
                    _ => proposed,
                };
                let source = response.source.unwrap_or(peer_ip);
                for (socket, channel_type) in [
                    (pair.rtp_socket, ChannelType::Rtp),
                    (pair.rtcp_socket, ChannelType::Rtcp),
                ] {
                    self.tasks.push(tokio::spawn(recv_loop(
                        socket,
                        stream_i,
                        channel_type,
                        source,
                        self.tx.clone(),
                    )));
                }
                Ok(())
            }
        }
    }

    /// Looks up which stream an interleaved data message belongs to.
    pub(crate) fn route_interleaved(&self, channel_id: u8) -> Option<ChannelMapping> {
        self.channels.lookup(channel_id)
    }

    /// Waits for the next UDP datagram. Pends forever when there are none,
    /// as in interleaved mode.
    pub(crate) async fn next_datagram(&mut self) -> Datagram {
        match self.rx.recv().await {
            Some(d) => d,

            // self holds a sender, so the channel never closes.
            None => futures::future::pending().await,
        }
    }

    /// Closes all sockets and stops the reader tasks. Returns false if
    /// already released.
    pub(crate) fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        for t in self.tasks.drain(..) {
            t.abort();
        }
        self.proposed.clear();
        self.channels.clear();
        debug!("released {:?} transports", self.mode);
        true
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("mode", &self.mode)
            .field("channels", &self.channels)
            .field("udp_tasks", &self.tasks.len())
            .field("released", &self.released)
            .finish()
    }
}

async fn recv_loop(
    socket: UdpSocket,
    stream_i: usize,
    channel_type: ChannelType,
    source: IpAddr,
    tx: mpsc::Sender<Datagram>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,

            // ICMP port unreachable from an earlier send; not fatal for a receiver.
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => continue,
            Err(e) => {
                let ctx = match socket.local_addr() {
                    Ok(a) => PacketContext::udp(a),
                    Err(_) => PacketContext::dummy(),
                };
                let _ = tx
                    .send(Datagram {
                        stream_i,
                        channel_type,
                        ctx,
                        result: Err(e),
                    })
                    .await;
                return;
            }
        };
        if peer.ip() != source {
            trace!(
                "stream {}: ignoring {} byte {:?} datagram from unexpected {}",
                stream_i,
                len,
                channel_type,
                peer
            );
            continue;
        }
        let d = Datagram {
            stream_i,
            channel_type,
            ctx: PacketContext::udp(peer),
            result: Ok(Bytes::copy_from_slice(&buf[..len])),
        };
        if tx.send(d).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::client::parse::SessionHeader;

    fn setup_response(channel_id: Option<u8>, client_port: Option<(u16, u16)>) -> SetupResponse {
        SetupResponse {
            session: SessionHeader {
                id: "abc123".into(),
                timeout_sec: 60,
            },
            ssrc: None,
            channel_id,
            source: None,
            client_port,
            server_port: None,
        }
    }

    #[test]
    fn interleaved() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let mut t = TransportManager::new(Transport::Tcp);
        assert_eq!(
            t.setup(0, localhost).unwrap(),
            "RTP/AVP/TCP;unicast;interleaved=0-1"
        );
        t.confirm(0, &setup_response(Some(0), None), localhost, localhost)
            .unwrap();
        assert_eq!(
            t.setup(1, localhost).unwrap(),
            "RTP/AVP/TCP;unicast;interleaved=2-3"
        );

        // The server's choice wins.
        t.confirm(1, &setup_response(Some(4), None), localhost, localhost)
            .unwrap();
        assert_eq!(
            t.route_interleaved(1),
            Some(ChannelMapping {
                stream_i: 0,
                channel_type: ChannelType::Rtcp
            })
        );
        assert_eq!(
            t.route_interleaved(4),
            Some(ChannelMapping {
                stream_i: 1,
                channel_type: ChannelType::Rtp
            })
        );
        assert_eq!(t.route_interleaved(2), None);

        t.confirm(2, &setup_response(None, None), localhost, localhost)
            .unwrap_err();
        assert!(t.release());
        assert!(!t.release());
        assert_eq!(t.route_interleaved(0), None);
    }

    #[tokio::test]
    async fn udp() {
        crate::testutil::init_logging();
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let mut t = TransportManager::new(Transport::Udp);
        let header = t.setup(0, localhost).unwrap();
        let ports = header
            .strip_prefix("RTP/AVP;unicast;client_port=")
            .unwrap();
        let (rtp, rtcp) = ports.split_once('-').unwrap();
        let rtp: u16 = rtp.parse().unwrap();
        let rtcp: u16 = rtcp.parse().unwrap();
        assert_eq!(rtp % 2, 0);
        assert_eq!(rtcp, rtp + 1);
        t.confirm(
            0,
            &setup_response(None, Some((rtp, rtcp))),
            localhost,
            localhost,
        )
            .unwrap();

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        sender
            .send_to(b"rtcp", (Ipv4Addr::LOCALHOST, rtcp))
            .await
            .unwrap();
        let d = t.next_datagram().await;
        assert_eq!(d.stream_i, 0);
        assert_eq!(d.channel_type, ChannelType::Rtcp);
        assert_eq!(&d.result.unwrap()[..], b"rtcp");

        assert!(t.release());
        assert!(!t.release());
    }

    #[tokio::test]
    async fn udp_server_chosen_client_port() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let mut t = TransportManager::new(Transport::Udp);
        t.setup(0, localhost).unwrap();

        // A free pair other than the proposed one.
        let chosen = loop {
            let p = UdpPair::for_ip(localhost).unwrap().rtp_port;
            if !t.proposed.values().any(|q| q.rtp_port == p) {
                break p;
            }
        };
        t.confirm(
            0,
            &setup_response(None, Some((chosen, chosen + 1))),
            localhost,
            localhost,
        )
        .unwrap();

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        sender
            .send_to(b"rtp", (Ipv4Addr::LOCALHOST, chosen))
            .await
            .unwrap();
        let d = t.next_datagram().await;
        assert_eq!(d.channel_type, ChannelType::Rtp);
        assert_eq!(&d.result.unwrap()[..], b"rtp");
    }

    #[tokio::test]
    async fn udp_server_chosen_port_unavailable() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let mut t = TransportManager::new(Transport::Udp);
        t.setup(0, localhost).unwrap();
        let taken = UdpPair::for_ip(localhost).unwrap();
        let e = t
            .confirm(
                0,
                &setup_response(None, Some((taken.rtp_port, taken.rtp_port + 1))),
                localhost,
                localhost,
            )
            .unwrap_err();
        assert!(
            matches!(&e, ConfirmError::Bind(e) if e.kind() == std::io::ErrorKind::AddrInUse),
            "{:?}",
            e
        );
    }
}
