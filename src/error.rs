// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::{ConnectionContext, PacketContext, RtspMessageContext};
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable error messages. In most cases
/// they have enough information to find the offending packet in Wireshark.
///
/// Errors are cheap to clone: the same failure is handed to every pending
/// caller and kept as the session's last error. Use [`Error::kind`] to
/// inspect the failure category programmatically.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the failure category.
    pub fn kind(&self) -> ErrorKind {
        self.0.kind()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

/// Category of an [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The RTSP server couldn't be reached, or the control connection broke.
    Connection,

    /// Malformed or unexpected RTSP message or SDP, or a failure status
    /// reported by the server.
    Protocol,

    /// The server rejected our credentials (or we had none to offer).
    Auth,

    /// A media socket couldn't be bound or failed mid-session.
    Transport,

    /// The server stopped answering keepalives.
    Timeout,

    /// The caller supplied an invalid argument.
    InvalidArgument,

    /// The operation doesn't make sense in the session's current state.
    FailedPrecondition,

    Internal,
}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unparseable or unexpected RTSP message.
    #[error("[{conn_ctx}, {msg_ctx}] RTSP framing error: {description}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] {status} response to {} CSeq={cseq}: \
             {description}", Into::<&str>::into(.method))]
    RtspResponseError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: rtsp_types::Method,
        cseq: u32,
        status: rtsp_types::StatusCode,
        description: String,
    },

    /// A well-formed response whose content can't be used, eg an SDP with
    /// no usable media or a `SETUP` response without a transport.
    #[error("[{conn_ctx}, {msg_ctx}] Unable to negotiate session: {description}")]
    NegotiationError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] Authentication failed for {} CSeq={cseq}: \
             {description}", Into::<&str>::into(.method))]
    AuthError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: rtsp_types::Method,
        cseq: u32,
        description: String,
    },

    #[error("Unable to connect to RTSP server: {0}")]
    ConnectError(#[source] std::io::Error),

    #[error("[{conn_ctx}, {msg_ctx}] Error reading from RTSP peer: {source}")]
    RtspReadError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}] RTSP peer closed the connection")]
    RtspEof { conn_ctx: ConnectionContext },

    #[error("[{conn_ctx}] Error writing to RTSP peer: {source}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}] Unable to set up {media} transport: {source}")]
    TransportSetupError {
        conn_ctx: ConnectionContext,
        media: crate::codec::MediaType,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}, {pkt_ctx}] Error receiving UDP packet: {source}")]
    UdpRecvError {
        conn_ctx: ConnectionContext,
        pkt_ctx: PacketContext,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}] No response to keepalive CSeq={cseq} within {interval:?}")]
    KeepaliveTimeout {
        conn_ctx: ConnectionContext,
        cseq: u32,
        interval: std::time::Duration,
    },

    #[error("[{conn_ctx}] No response to {} CSeq={cseq} within {timeout:?}",
             Into::<&str>::into(.method))]
    ResponseTimeout {
        conn_ctx: ConnectionContext,
        method: rtsp_types::Method,
        cseq: u32,
        timeout: std::time::Duration,
    },

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),

}

impl ErrorInt {
    fn kind(&self) -> ErrorKind {
        match self {
            ErrorInt::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ErrorInt::RtspFramingError { .. }
            | ErrorInt::RtspResponseError { .. }
            | ErrorInt::NegotiationError { .. } => ErrorKind::Protocol,
            ErrorInt::AuthError { .. } => ErrorKind::Auth,
            ErrorInt::ConnectError(_)
            | ErrorInt::RtspReadError { .. }
            | ErrorInt::RtspEof { .. }
            | ErrorInt::WriteError { .. } => ErrorKind::Connection,
            ErrorInt::TransportSetupError { .. } | ErrorInt::UdpRecvError { .. } => {
                ErrorKind::Transport
            }
            ErrorInt::KeepaliveTimeout { .. } | ErrorInt::ResponseTimeout { .. } => {
                ErrorKind::Timeout
            }
            ErrorInt::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            ErrorInt::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let e = wrap!(ErrorInt::ConnectError(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused"
        )));
        assert_eq!(e.kind(), ErrorKind::Connection);
        assert!(e.to_string().contains("refused"));

        let e = wrap!(ErrorInt::KeepaliveTimeout {
            conn_ctx: ConnectionContext::dummy(),
            cseq: 7,
            interval: std::time::Duration::from_secs(20),
        });
        assert_eq!(e.kind(), ErrorKind::Timeout);
        assert!(e.to_string().contains("CSeq=7"));

        // Clones share the same underlying error.
        let e2 = e.clone();
        assert!(Arc::ptr_eq(&e.0, &e2.0));
    }
}
