// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes, BytesMut};
use rtsp_types::{Message, Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Installs `env_logger` for tests, honoring `RUST_LOG`.
pub(crate) fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}

pub(crate) fn response(raw: &'static [u8]) -> Response<Bytes> {
    let (msg, len) = Message::parse(raw).unwrap();
    assert_eq!(len, raw.len());
    match msg {
        Message::Response(r) => r.map_body(Bytes::from_static),
        _ => panic!("unexpected message type"),
    }
}

/// Builds a response with the given status and headers; `CSeq` is filled in
/// by [`MockServer`].
pub(crate) fn reply(
    status: rtsp_types::StatusCode,
    headers: &[(rtsp_types::HeaderName, &str)],
    body: &[u8],
) -> Reply {
    let mut b = Response::builder(rtsp_types::Version::V1_0, status);
    for (name, value) in headers {
        b = b.header(name.clone(), *value);
    }
    if !body.is_empty() {
        b = b.header(rtsp_types::headers::CONTENT_LENGTH, body.len().to_string());
    }
    Reply::Response(b.build(Bytes::copy_from_slice(body)))
}

/// What the mock server sends back for one request.
pub(crate) enum Reply {
    Response(Response<Bytes>),

    /// Raw bytes, eg interleaved data, written after any preceding reply.
    Raw(Bytes),

    /// A response held back until after the replies to the next request on
    /// the same connection.
    Later(Response<Bytes>),
}

/// Everything the mock server has seen, for assertions.
#[derive(Clone, Default)]
pub(crate) struct Recorded(Arc<Mutex<Vec<Request<Bytes>>>>);

impl Recorded {
    pub(crate) fn requests(&self) -> Vec<Request<Bytes>> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn methods(&self) -> Vec<rtsp_types::Method> {
        self.requests().iter().map(|r| r.method().clone()).collect()
    }
}

/// An RTSP server on `127.0.0.1:0` which answers each request via a closure,
/// echoing the request's `CSeq`. Accepts any number of connections; the
/// closure sees the requests of all of them.
pub(crate) struct MockServer {
    pub(crate) url: url::Url,
    pub(crate) recorded: Recorded,
    task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub(crate) async fn start<F>(handler: F) -> Self
    where
        F: FnMut(&Request<Bytes>) -> Vec<Reply> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recorded = Recorded::default();
        let r = recorded.clone();
        let handler = Arc::new(Mutex::new(handler));
        let task = tokio::spawn(async move {
            let mut conns = tokio::task::JoinSet::new();
            loop {
                let (sock, _) = match listener.accept().await {
                    Ok(a) => a,
                    Err(_) => return,
                };
                conns.spawn(serve(sock, r.clone(), handler.clone()));
            }
        });
        MockServer {
            url: url::Url::parse(&format!("rtsp://{}/stream", addr)).unwrap(),
            recorded,
            task,
        }
    }
}

async fn serve<F>(mut sock: tokio::net::TcpStream, r: Recorded, handler: Arc<Mutex<F>>)
where
    F: FnMut(&Request<Bytes>) -> Vec<Reply> + Send + 'static,
{
    let mut buf = BytesMut::new();
    let mut held: Vec<Response<Bytes>> = Vec::new();
    loop {
        let parsed = match Message::<&[u8]>::parse(&buf[..]) {
            Ok((Message::Request(req), len)) => Some((req.map_body(Bytes::copy_from_slice), len)),
            Ok((_, _)) => panic!("client sent a non-request"),
            Err(rtsp_types::ParseError::Incomplete(_)) => None,
            Err(rtsp_types::ParseError::Error) => panic!("unparseable request"),
        };
        let (req, len) = match parsed {
            Some(p) => p,
            None => {
                if sock.read_buf(&mut buf).await.unwrap_or(0) == 0 {
                    return;
                }
                continue;
            }
        };
        buf.advance(len);
        r.0.lock().unwrap().push(req.clone());
        let cseq = req
            .header(&rtsp_types::headers::CSEQ)
            .map(|v| v.as_str().to_owned())
            .unwrap_or_default();
        let replies = (handler.lock().unwrap())(&req);
        let mut out = Vec::new();
        let mut later = Vec::new();
        for reply in replies {
            match reply {
                Reply::Response(mut resp) => {
                    resp.insert_header(rtsp_types::headers::CSEQ, cseq.clone());
                    Message::Response(resp).write(&mut out).unwrap();
                }
                Reply::Raw(raw) => out.extend_from_slice(&raw),
                Reply::Later(mut resp) => {
                    resp.insert_header(rtsp_types::headers::CSEQ, cseq.clone());
                    later.push(resp);
                }
            }
        }
        for resp in held.drain(..) {
            Message::Response(resp).write(&mut out).unwrap();
        }
        held = later;
        if sock.write_all(&out).await.is_err() {
            return;
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Wraps an RTP packet in interleaved framing.
pub(crate) fn interleaved(channel_id: u8, pkt: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(4 + pkt.len());
    out.push(b'$');
    out.push(channel_id);
    out.extend_from_slice(&u16::try_from(pkt.len()).unwrap().to_be_bytes());
    out.extend_from_slice(pkt);
    Bytes::from(out)
}
