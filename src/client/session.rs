// Copyright (C) 2021 rtspflow contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The session task: the single owner of all session state.
//!
//! Reader, writer, and UDP tasks only move bytes; everything they learn is
//! posted here as an [`Input`] and handled in order, alongside commands from
//! the [`super::Session`] handle and timer expirations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info, trace, warn};
use rtsp_types::{headers, Message, Method, Request, Response, StatusCode};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use super::assembler::RtpFrameAssembler;
use super::auth::{self, AuthScheme, Credentials};
use super::channel_mapping::ChannelType;
use super::keepalive::{KeepAlive, Tick};
use super::parse::{self, SessionHeader};
use super::sdp::{self, Presentation};
use super::stats::{Statistics, StatsCollector};
use super::teardown::{self, Teardown};
use super::transport::{ConfirmError, Datagram, TransportManager};
use super::{SessionOptions, Status, StatusChange};
use crate::codec::Frame;
use crate::error::ErrorInt;
use crate::rtp::RtpPacket;
use crate::tokio::{Connection, ConnectionReader, ConnectionWriter};
use crate::{
    ConnectionContext, Error, ErrorKind, PacketContext, ReceivedMessage, RtspMessageContext,
};

const INPUT_QUEUE_LEN: usize = 64;

/// Resolves a `play()`, `pause()`, or `stop()` call.
pub(super) type Waiter = oneshot::Sender<Result<(), Error>>;

pub(super) enum Command {
    Connect {
        url: Url,
        creds: Option<Credentials>,
    },
    Play(Waiter),
    Pause(Waiter),
    Stop(Waiter),
}

/// State visible through the [`super::Session`] handle.
#[derive(Clone, Debug, Default)]
pub(super) struct Observed {
    pub(super) status: Status,
    pub(super) last_error: Option<Error>,
    pub(super) statistics: Statistics,
    pub(super) presentation: Option<Arc<Presentation>>,
}

/// Something learned by one of the I/O tasks.
enum Input {
    Connected(Result<Connection, std::io::Error>),
    Message(ReceivedMessage),
    ReadFailed(Error),
    Eof,
    WriteFailed(Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Purpose {
    Options,
    Describe,
    Setup(usize),
    Play,
    Pause,
    KeepAlive,
    Teardown,
}

/// A request awaiting its response, kept as built (without `CSeq` or
/// `Authorization`) so it can be resent after a `401`.
struct PendingRequest {
    purpose: Purpose,
    request: Request<Bytes>,
    retried: bool,

    /// When an unanswered request fails the session. Keepalives and
    /// `TEARDOWN` have their own timers.
    deadline: Option<Instant>,
}

struct Stream {
    /// Index within [`Presentation::medias`].
    media_i: usize,
    assembler: RtpFrameAssembler,
}

/// One connection's worth of session state. Dropping it closes the
/// connection and releases all transports.
struct Attempt {
    url: Url,
    creds: Option<Credentials>,
    conn_ctx: ConnectionContext,
    writer: Option<mpsc::UnboundedSender<Message<Bytes>>>,
    writer_task: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    request_timeout: Duration,

    /// The next `CSeq` header value to use when sending an RTSP request.
    next_cseq: u32,
    pending: HashMap<u32, PendingRequest>,

    /// The challenge accepted from the server; once set, every request
    /// carries credentials.
    auth: Option<AuthScheme>,
    presentation: Option<Arc<Presentation>>,
    streams: Vec<Stream>,
    session: Option<SessionHeader>,
    transports: TransportManager,
    keepalive: KeepAlive,
    pause_waiters: Vec<Waiter>,
}

impl Attempt {
    fn in_flight(&self, purpose: Purpose) -> bool {
        self.pending.values().any(|p| p.purpose == purpose)
    }

    /// The earliest response deadline among pending requests.
    fn request_deadline(&self) -> Option<(Instant, u32)> {
        self.pending
            .iter()
            .filter_map(|(&cseq, p)| p.deadline.map(|d| (d, cseq)))
            .min()
    }

    fn control_url(&self) -> Url {
        match &self.presentation {
            Some(p) => p.control().clone(),
            None => self.url.clone(),
        }
    }

    /// Queues a `TEARDOWN` which outlives the attempt: the writer task is
    /// detached, flushes it, and closes the connection on its own.
    fn detach_teardown(&mut self, user_agent: &str) {
        let control = match (&self.session, &self.presentation, &self.writer_task) {
            (Some(_), Some(p), Some(_)) => p.control().clone(),
            _ => return,
        };
        let req = teardown::request(&control);
        if self.send(user_agent, Purpose::Teardown, req, false).is_ok() {
            self.writer_task = None;
        }
    }

    /// Sends a request with a fresh `CSeq`.
    fn send(
        &mut self,
        user_agent: &str,
        purpose: Purpose,
        request: Request<Bytes>,
        retried: bool,
    ) -> Result<u32, Error> {
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        let mut wire = request.clone();
        wire.insert_header(headers::CSEQ, cseq.to_string());
        wire.insert_header(headers::USER_AGENT, user_agent.to_owned());
        if let Some(s) = &self.session {
            wire.insert_header(headers::SESSION, s.id.to_string());
        }
        if let (Some(scheme), Some(creds)) = (&self.auth, &self.creds) {
            let uri = wire.request_uri().map(|u| u.as_str()).unwrap_or("*");
            let authorization = auth::credentials(scheme, wire.method().into(), uri, creds);
            wire.insert_header(headers::AUTHORIZATION, authorization);
        }
        debug!(
            "[{}] sending {} CSeq={}",
            self.conn_ctx,
            Into::<&str>::into(request.method()),
            cseq
        );
        let sent = match &self.writer {
            Some(w) => w.send(Message::Request(wire)).is_ok(),
            None => false,
        };
        if !sent {
            return Err(wrap!(ErrorInt::WriteError {
                conn_ctx: self.conn_ctx,
                source: std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "connection writer has exited",
                ),
            }));
        }
        let deadline = match purpose {
            Purpose::KeepAlive | Purpose::Teardown => None,
            _ => Some(Instant::now() + self.request_timeout),
        };
        self.pending.insert(
            cseq,
            PendingRequest {
                purpose,
                request,
                retried,
                deadline,
            },
        );
        Ok(cseq)
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        for t in self.tasks.drain(..).chain(self.writer_task.take()) {
            t.abort();
        }
    }
}

pub(super) struct SessionTask {
    options: SessionOptions,
    cmds: mpsc::UnboundedReceiver<Command>,
    cmds_open: bool,
    status_tx: mpsc::UnboundedSender<StatusChange>,
    frames_tx: mpsc::Sender<Frame>,
    observed_tx: watch::Sender<Observed>,
    observed: Observed,
    inputs_tx: mpsc::Sender<(u64, Input)>,
    inputs_rx: mpsc::Receiver<(u64, Input)>,

    /// Identifies the current attempt; inputs from older ones are ignored.
    epoch: u64,
    attempt: Option<Attempt>,
    teardown: Option<Teardown>,

    /// True from `play()` until `pause()` or `stop()`; a reconnect resumes play.
    want_play: bool,
    play_waiters: Vec<Waiter>,

    /// The most recent `connect()`, for reconnects.
    target: Option<(Url, Option<Credentials>)>,
    reconnects: u32,
    stats: StatsCollector,
}

impl SessionTask {
    pub(super) fn new(
        options: SessionOptions,
        cmds: mpsc::UnboundedReceiver<Command>,
        status_tx: mpsc::UnboundedSender<StatusChange>,
        frames_tx: mpsc::Sender<Frame>,
        observed_tx: watch::Sender<Observed>,
    ) -> Self {
        let (inputs_tx, inputs_rx) = mpsc::channel(INPUT_QUEUE_LEN);
        let stats = StatsCollector::new(options.stats_interval, Instant::now());
        Self {
            options,
            cmds,
            cmds_open: true,
            status_tx,
            frames_tx,
            observed_tx,
            observed: Observed::default(),
            inputs_tx,
            inputs_rx,
            epoch: 0,
            attempt: None,
            teardown: None,
            want_play: false,
            play_waiters: Vec::new(),
            target: None,
            reconnects: 0,
            stats,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            if !self.cmds_open && self.attempt.is_none() && self.teardown.is_none() {
                debug!("session handle dropped; exiting");
                return;
            }
            let keepalive_deadline = self.attempt.as_ref().and_then(|a| a.keepalive.deadline());
            let request_deadline = match self.teardown {
                Some(_) => None,
                None => self.attempt.as_ref().and_then(Attempt::request_deadline),
            };
            let teardown_deadline = self.teardown.as_ref().map(Teardown::deadline);
            let stats_deadline = self.stats.deadline();
            tokio::select! {
                biased;
                cmd = self.cmds.recv(), if self.cmds_open => match cmd {
                    Some(c) => self.command(c),
                    None => {
                        self.cmds_open = false;
                        self.stop(None);
                    }
                },
                Some((epoch, input)) = self.inputs_rx.recv() => {
                    if epoch == self.epoch {
                        self.input(input);
                    } else {
                        trace!("ignoring input from stale attempt {}", epoch);
                    }
                },
                d = next_datagram(&mut self.attempt) => self.datagram(d),
                _ = sleep_until_opt(keepalive_deadline) => self.keepalive_tick(),
                _ = sleep_until_opt(request_deadline.map(|(d, _)| d)) => {
                    if let Some((_, cseq)) = request_deadline {
                        self.request_timed_out(cseq);
                    }
                },
                _ = sleep_until_opt(teardown_deadline) => {
                    debug!("TEARDOWN unanswered after {:?}", self.options.teardown_timeout);
                    self.finish_teardown();
                },
                _ = tokio::time::sleep_until(stats_deadline) => self.publish_stats(),
            }
        }
    }

    fn command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { url, creds } => self.connect(url, creds),
            Command::Play(w) => self.play(w),
            Command::Pause(w) => self.pause(w),
            Command::Stop(w) => self.stop(Some(w)),
        }
    }

    fn set_status(&mut self, status: Status, reason: Option<String>) {
        if self.observed.status == status {
            return;
        }
        debug!("status {:?} -> {:?}", self.observed.status, status);
        self.observed.status = status;
        let _ = self.observed_tx.send(self.observed.clone());
        let _ = self.status_tx.send(StatusChange { status, reason });
    }

    /// Closes the current attempt, if any, and ignores anything its tasks
    /// have already posted.
    fn drop_attempt(&mut self) -> Option<Attempt> {
        self.epoch += 1;
        self.attempt.take()
    }

    fn connect(&mut self, url: Url, creds: Option<Credentials>) {
        if let Some(t) = self.teardown.as_mut() {
            debug!("connect to {} queued behind TEARDOWN", &url);
            t.connect_after(url, creds);
            return;
        }
        match self.observed.status {
            Status::Disconnected | Status::Failed => {
                self.reconnects = 0;
                self.target = Some((url.clone(), creds.clone()));
                self.start_attempt(url, creds);
            }
            s => debug!("ignoring connect to {} in state {:?}", &url, s),
        }
    }

    fn start_attempt(&mut self, url: Url, creds: Option<Credentials>) {
        drop(self.drop_attempt());
        let epoch = self.epoch;
        let tx = self.inputs_tx.clone();
        let target = url.clone();
        let request_timeout = self.options.request_timeout;
        let connect = tokio::spawn(async move {
            let port = target.port().unwrap_or(crate::DEFAULT_RTSP_PORT);
            let r = match target.host() {
                Some(host) => {
                    match tokio::time::timeout(request_timeout, Connection::connect(host, port))
                        .await
                    {
                        Ok(r) => r,
                        Err(_) => Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            format!("connect timed out after {:?}", request_timeout),
                        )),
                    }
                }
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "URL has no host",
                )),
            };
            let _ = tx.send((epoch, Input::Connected(r))).await;
        });
        debug!("connecting to {}", &url);
        self.attempt = Some(Attempt {
            url,
            creds,
            conn_ctx: ConnectionContext::dummy(),
            writer: None,
            writer_task: None,
            tasks: vec![connect],
            request_timeout: self.options.request_timeout,
            next_cseq: 1,
            pending: HashMap::new(),
            auth: None,
            presentation: None,
            streams: Vec::new(),
            session: None,
            transports: TransportManager::new(self.options.transport),
            keepalive: KeepAlive::new(self.options.keepalive_interval),
            pause_waiters: Vec::new(),
        });
        self.observed.presentation = None;
        self.set_status(Status::Connecting, None);
    }

    fn play(&mut self, w: Waiter) {
        if self.teardown.is_some() {
            let _ = w.send(Err(wrap!(ErrorInt::FailedPrecondition(
                "session is stopping".to_owned()
            ))));
            return;
        }
        match self.observed.status {
            Status::Disconnected | Status::Failed | Status::Playing => {
                let _ = w.send(Ok(()));
            }
            Status::Connecting | Status::AwaitingCapabilities | Status::Negotiating => {
                self.want_play = true;
                self.play_waiters.push(w);
            }
            Status::Ready | Status::Paused => {
                self.want_play = true;
                self.play_waiters.push(w);
                self.send_play();
            }
        }
    }

    fn pause(&mut self, w: Waiter) {
        if self.observed.status != Status::Playing || self.teardown.is_some() {
            let _ = w.send(Ok(()));
            return;
        }
        let a = match self.attempt.as_mut() {
            Some(a) => a,
            None => {
                let _ = w.send(Ok(()));
                return;
            }
        };
        a.pause_waiters.push(w);
        if a.in_flight(Purpose::Pause) {
            return;
        }
        let req = Request::builder(Method::Pause, rtsp_types::Version::V1_0)
            .request_uri(a.control_url())
            .build(Bytes::new());
        self.send(Purpose::Pause, req);
    }

    fn stop(&mut self, waiter: Option<Waiter>) {
        for w in self.play_waiters.drain(..) {
            let _ = w.send(Err(wrap!(ErrorInt::FailedPrecondition(
                "session stopped before PLAY completed".to_owned()
            ))));
        }
        self.want_play = false;
        if let Some(t) = self.teardown.as_mut() {
            t.add_waiter(waiter);
            return;
        }
        let mut a = match self.attempt.take() {
            Some(a) => a,
            None => {
                self.set_status(Status::Disconnected, Some("stopped".to_owned()));
                if let Some(w) = waiter {
                    let _ = w.send(Ok(()));
                }
                return;
            }
        };
        a.keepalive.stop();
        for w in a.pause_waiters.drain(..) {
            let _ = w.send(Err(wrap!(ErrorInt::FailedPrecondition(
                "session stopped before PAUSE completed".to_owned()
            ))));
        }
        let control = match (&a.session, &a.presentation) {
            (Some(_), Some(p)) => Some(p.control().clone()),
            _ => None,
        };
        let sent = control.and_then(|c| {
            a.send(
                &self.options.user_agent,
                Purpose::Teardown,
                teardown::request(&c),
                false,
            )
            .map_err(|e| debug!("unable to send TEARDOWN: {}", e))
            .ok()
        });
        if sent.is_some() {
            // Keep the connection until the TEARDOWN is answered.
            self.attempt = Some(a);
            self.teardown = Some(Teardown::new(
                Instant::now() + self.options.teardown_timeout,
                waiter,
            ));
            return;
        }
        self.epoch += 1;
        drop(a);
        self.set_status(Status::Disconnected, Some("stopped".to_owned()));
        if let Some(w) = waiter {
            let _ = w.send(Ok(()));
        }
    }

    fn finish_teardown(&mut self) {
        let t = match self.teardown.take() {
            Some(t) => t,
            None => return,
        };
        drop(self.drop_attempt());
        self.set_status(Status::Disconnected, Some("stopped".to_owned()));
        let (waiters, then) = t.finish();
        for w in waiters {
            let _ = w.send(Ok(()));
        }
        if let Some((url, creds)) = then {
            self.connect(url, creds);
        }
    }

    /// Fails the session: one terminal status change per failure episode.
    fn fail(&mut self, e: Error) {
        if self.observed.status == Status::Failed && self.attempt.is_none() {
            debug!("ignoring error after failure: {}", e);
            return;
        }
        warn!("session failed: {}", e);
        if let Some(mut a) = self.drop_attempt() {
            for w in a.pause_waiters.drain(..) {
                let _ = w.send(Err(e.clone()));
            }
            if e.kind() != ErrorKind::Connection {
                a.detach_teardown(&self.options.user_agent);
            }
        }
        for w in self.play_waiters.drain(..) {
            let _ = w.send(Err(e.clone()));
        }
        self.want_play = false;
        self.observed.last_error = Some(e.clone());
        self.set_status(Status::Failed, Some(e.to_string()));
    }

    /// Sends a request on the current attempt, failing the session on error.
    fn send(&mut self, purpose: Purpose, req: Request<Bytes>) -> Option<u32> {
        let a = self.attempt.as_mut()?;
        match a.send(&self.options.user_agent, purpose, req, false) {
            Ok(cseq) => Some(cseq),
            Err(e) => {
                self.fail(e);
                None
            }
        }
    }

    fn input(&mut self, input: Input) {
        match input {
            Input::Connected(Ok(conn)) => self.connected(conn),
            Input::Connected(Err(e)) => self.fail(wrap!(ErrorInt::ConnectError(e))),
            Input::Message(m) => self.message(m),
            Input::ReadFailed(e) | Input::WriteFailed(e) => self.connection_lost(e),
            Input::Eof => {
                let conn_ctx = match &self.attempt {
                    Some(a) => a.conn_ctx,
                    None => return,
                };
                self.connection_lost(wrap!(ErrorInt::RtspEof { conn_ctx }));
            }
        }
    }

    fn request_timed_out(&mut self, cseq: u32) {
        let a = match self.attempt.as_mut() {
            Some(a) => a,
            None => return,
        };
        let pending = match a.pending.remove(&cseq) {
            Some(p) => p,
            None => return,
        };
        let e = wrap!(ErrorInt::ResponseTimeout {
            conn_ctx: a.conn_ctx,
            method: pending.request.method().clone(),
            cseq,
            timeout: a.request_timeout,
        });
        self.fail(e);
    }

    fn connection_lost(&mut self, e: Error) {
        if self.teardown.is_some() {
            debug!("connection ended during TEARDOWN: {}", e);
            self.finish_teardown();
            return;
        }
        self.fail(e);
    }

    fn connected(&mut self, conn: Connection) {
        let a = match self.attempt.as_mut() {
            Some(a) => a,
            None => return,
        };
        a.conn_ctx = *conn.ctx();
        let (reader, writer) = conn.split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        a.tasks.push(tokio::spawn(read_loop(
            reader,
            self.epoch,
            self.inputs_tx.clone(),
        )));
        a.writer_task = Some(tokio::spawn(write_loop(
            writer,
            writer_rx,
            self.epoch,
            self.inputs_tx.clone(),
        )));
        a.writer = Some(writer_tx);
        debug!("[{}] connected", a.conn_ctx);
        let req = Request::builder(Method::Options, rtsp_types::Version::V1_0)
            .request_uri(a.url.clone())
            .build(Bytes::new());
        self.set_status(Status::AwaitingCapabilities, None);
        self.send(Purpose::Options, req);
    }

    fn message(&mut self, m: ReceivedMessage) {
        match m.msg {
            Message::Response(r) => self.response(m.ctx, r),
            Message::Data(d) => self.interleaved(m.ctx, d),
            Message::Request(r) => warn!(
                "ignoring {} request from server at {}",
                Into::<&str>::into(r.method()),
                m.ctx
            ),
        }
    }

    fn response(&mut self, msg_ctx: RtspMessageContext, resp: Response<Bytes>) {
        let a = match self.attempt.as_mut() {
            Some(a) => a,
            None => return,
        };
        let conn_ctx = a.conn_ctx;
        let cseq = match parse::get_cseq(&resp) {
            Some(c) => c,
            None => {
                warn!("[{}, {}] ignoring response without CSeq", conn_ctx, msg_ctx);
                return;
            }
        };
        let pending = match a.pending.remove(&cseq) {
            Some(p) => p,
            None => {
                debug!(
                    "[{}, {}] ignoring response to unknown CSeq={}",
                    conn_ctx, msg_ctx, cseq
                );
                return;
            }
        };
        let status = resp.status();
        debug!(
            "[{}, {}] {} response to {} CSeq={}",
            conn_ctx,
            msg_ctx,
            status,
            Into::<&str>::into(pending.request.method()),
            cseq
        );
        if self.teardown.is_some() {
            if pending.purpose == Purpose::Teardown {
                if status == StatusCode::SessionNotFound {
                    debug!("TEARDOWN: session already gone");
                } else if !status.is_success() {
                    debug!("TEARDOWN failed with {}; closing anyway", status);
                }
                self.finish_teardown();
            }
            return;
        }
        if pending.purpose == Purpose::KeepAlive {
            a.keepalive.on_response(cseq);
        }
        if status == StatusCode::Unauthorized {
            let method = pending.request.method().clone();
            if let Err(description) = self.retry_with_auth(pending, &resp) {
                self.fail(wrap!(ErrorInt::AuthError {
                    conn_ctx,
                    msg_ctx,
                    method,
                    cseq,
                    description,
                }));
            }
            return;
        }
        let failure = || {
            wrap!(ErrorInt::RtspResponseError {
                conn_ctx,
                msg_ctx,
                method: pending.request.method().clone(),
                cseq,
                status,
                description: String::from_utf8_lossy(&resp.body()[..]).trim().to_owned(),
            })
        };
        match pending.purpose {
            Purpose::Options => {
                if !status.is_success() {
                    warn!("[{}, {}] OPTIONS returned {}; continuing", conn_ctx, msg_ctx, status);
                }
                self.options_done(&resp);
            }
            Purpose::KeepAlive if !status.is_success() => {
                let e = failure();
                self.keepalive_failed(e);
            }
            Purpose::KeepAlive => {}
            Purpose::Pause if !status.is_success() => {
                let e = failure();
                if let Some(a) = self.attempt.as_mut() {
                    for w in a.pause_waiters.drain(..) {
                        let _ = w.send(Err(e.clone()));
                    }
                }
            }
            _ if !status.is_success() => {
                let e = failure();
                self.fail(e);
            }
            Purpose::Describe => self.described(conn_ctx, msg_ctx, &resp),
            Purpose::Setup(i) => self.set_up(i, conn_ctx, msg_ctx, &resp),
            Purpose::Play => self.played(&resp),
            Purpose::Pause => self.paused(),
            Purpose::Teardown => {}
        }
    }

    /// Resends a request rejected with `401`, at most once.
    fn retry_with_auth(
        &mut self,
        pending: PendingRequest,
        resp: &Response<Bytes>,
    ) -> Result<(), String> {
        let a = match self.attempt.as_mut() {
            Some(a) => a,
            None => return Ok(()),
        };
        if pending.retried {
            return Err("server rejected credentials".to_owned());
        }
        if a.creds.is_none() {
            return Err("authentication required; no credentials supplied".to_owned());
        }
        let www_authenticate = resp
            .header(&headers::WWW_AUTHENTICATE)
            .ok_or_else(|| "Unauthorized without WWW-Authenticate header".to_owned())?;
        a.auth = Some(auth::challenge(www_authenticate.as_str())?);
        let purpose = pending.purpose;
        let cseq = a
            .send(&self.options.user_agent, purpose, pending.request, true)
            .map_err(|e| e.to_string())?;
        if purpose == Purpose::KeepAlive {
            a.keepalive.sent(cseq);
        }
        Ok(())
    }

    fn options_done(&mut self, resp: &Response<Bytes>) {
        let a = match self.attempt.as_mut() {
            Some(a) => a,
            None => return,
        };
        let caps = parse::parse_public(resp);
        debug!("[{}] server capabilities: {:?}", a.conn_ctx, caps);
        a.keepalive.set_use_get_parameter(caps.get_parameter);
        let req = Request::builder(Method::Describe, rtsp_types::Version::V1_0)
            .request_uri(a.url.clone())
            .header(headers::ACCEPT, "application/sdp")
            .build(Bytes::new());
        self.set_status(Status::Negotiating, None);
        self.send(Purpose::Describe, req);
    }

    fn described(
        &mut self,
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        resp: &Response<Bytes>,
    ) {
        let negotiation_error = |description| {
            wrap!(ErrorInt::NegotiationError {
                conn_ctx,
                msg_ctx,
                description,
            })
        };
        let a = match self.attempt.as_mut() {
            Some(a) => a,
            None => return,
        };
        let presentation = match parse::parse_describe(&a.url, resp) {
            Ok(p) => p,
            Err(description) => return self.fail(negotiation_error(description)),
        };
        let selected = sdp::select(presentation.medias(), self.options.media);
        if selected.is_empty() {
            let e = negotiation_error(format!(
                "no media matching {:?} among {} offered",
                self.options.media,
                presentation.medias().len()
            ));
            return self.fail(e);
        }
        let mut streams = Vec::with_capacity(selected.len());
        for (stream_i, &media_i) in selected.iter().enumerate() {
            let desc = &presentation.medias()[media_i];
            debug!(
                "stream {}: {} {}/{} pt={}",
                stream_i,
                desc.media(),
                desc.encoding_name(),
                desc.clock_rate(),
                desc.payload_type()
            );
            match RtpFrameAssembler::new(
                stream_i,
                desc.media(),
                desc.payload_type(),
                desc.clock_rate(),
                (self.options.depacketizer)(desc),
            ) {
                Ok(assembler) => streams.push(Stream { media_i, assembler }),
                Err(description) => return self.fail(negotiation_error(description)),
            }
        }
        let presentation = Arc::new(presentation);
        a.streams = streams;
        a.presentation = Some(presentation.clone());
        self.observed.presentation = Some(presentation);
        self.setup(0);
    }

    fn setup(&mut self, stream_i: usize) {
        let a = match self.attempt.as_mut() {
            Some(a) => a,
            None => return,
        };
        let (presentation, stream) = match (&a.presentation, a.streams.get(stream_i)) {
            (Some(p), Some(s)) => (p.clone(), s),
            _ => return,
        };
        let desc = &presentation.medias()[stream.media_i];
        let url = desc
            .control()
            .unwrap_or_else(|| presentation.control())
            .clone();
        let transport = match a.transports.setup(stream_i, a.conn_ctx.local_addr().ip()) {
            Ok(t) => t,
            Err(source) => {
                let e = wrap!(ErrorInt::TransportSetupError {
                    conn_ctx: a.conn_ctx,
                    media: desc.media(),
                    source,
                });
                return self.fail(e);
            }
        };
        let req = Request::builder(Method::Setup, rtsp_types::Version::V1_0)
            .request_uri(url)
            .header(headers::TRANSPORT, transport)
            .build(Bytes::new());
        self.send(Purpose::Setup(stream_i), req);
    }

    fn set_up(
        &mut self,
        stream_i: usize,
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        resp: &Response<Bytes>,
    ) {
        let negotiation_error = |description| {
            wrap!(ErrorInt::NegotiationError {
                conn_ctx,
                msg_ctx,
                description,
            })
        };
        let a = match self.attempt.as_mut() {
            Some(a) => a,
            None => return,
        };
        let setup = match parse::parse_setup(resp) {
            Ok(s) => s,
            Err(description) => return self.fail(negotiation_error(description)),
        };
        if let Some(old) = &a.session {
            if old.id != setup.session.id {
                let e = negotiation_error(format!(
                    "SETUP response changed session id from {:?} to {:?}",
                    &*old.id, &*setup.session.id
                ));
                return self.fail(e);
            }
        }
        let confirmed = a.transports.confirm(
            stream_i,
            &setup,
            conn_ctx.local_addr().ip(),
            conn_ctx.peer_addr().ip(),
        );
        match confirmed {
            Ok(()) => {}
            Err(ConfirmError::Negotiation(description)) => {
                return self.fail(negotiation_error(description))
            }
            Err(ConfirmError::Bind(source)) => {
                let media = match (&a.presentation, a.streams.get(stream_i)) {
                    (Some(p), Some(s)) => p.medias()[s.media_i].media(),
                    _ => return,
                };
                let e = wrap!(ErrorInt::TransportSetupError {
                    conn_ctx,
                    media,
                    source,
                });
                return self.fail(e);
            }
        }
        a.keepalive.set_server_timeout(setup.session.timeout_sec);
        debug!(
            "[{}] stream {} set up in session {:?}; transports: {:?}",
            conn_ctx, stream_i, &*setup.session.id, &a.transports
        );
        a.session = Some(setup.session);
        if stream_i + 1 < a.streams.len() {
            self.setup(stream_i + 1);
            return;
        }
        a.keepalive.start(Instant::now());
        self.set_status(Status::Ready, None);
        if self.want_play {
            self.send_play();
        }
    }

    fn send_play(&mut self) {
        let a = match self.attempt.as_mut() {
            Some(a) => a,
            None => return,
        };
        if a.in_flight(Purpose::Play) {
            return;
        }
        let mut b = Request::builder(Method::Play, rtsp_types::Version::V1_0)
            .request_uri(a.control_url());
        if self.observed.status == Status::Ready {
            b = b.header(headers::RANGE, "npt=0.000-");
        }
        self.send(Purpose::Play, b.build(Bytes::new()));
    }

    fn played(&mut self, resp: &Response<Bytes>) {
        let a = match self.attempt.as_mut() {
            Some(a) => a,
            None => return,
        };
        if let Some(p) = a.presentation.clone() {
            match parse::parse_rtp_info(resp, &p.base_url) {
                Ok(infos) => {
                    let n = a.streams.len();
                    for info in infos {
                        let i = a
                            .streams
                            .iter()
                            .position(|s| p.medias()[s.media_i].control() == Some(&info.url))
                            .or(if n == 1 { Some(0) } else { None });
                        match i {
                            Some(i) => a.streams[i].assembler.set_initial(info.seq, info.rtptime),
                            None => debug!("RTP-Info for unknown stream {}", &info.url),
                        }
                    }
                }
                Err(e) => warn!("[{}] ignoring unparseable RTP-Info: {}", a.conn_ctx, e),
            }
        }
        self.set_status(Status::Playing, None);
        for w in self.play_waiters.drain(..) {
            let _ = w.send(Ok(()));
        }
    }

    fn paused(&mut self) {
        self.want_play = false;
        self.set_status(Status::Paused, None);
        if let Some(a) = self.attempt.as_mut() {
            for w in a.pause_waiters.drain(..) {
                let _ = w.send(Ok(()));
            }
        }
    }

    /// Reconnects after a keepalive failure response, up to
    /// `max_reconnects` times.
    fn keepalive_failed(&mut self, e: Error) {
        let (url, creds) = match &self.target {
            Some(t) if self.reconnects < self.options.max_reconnects => t.clone(),
            _ => return self.fail(e),
        };
        self.reconnects += 1;
        info!(
            "keepalive failed ({}); reconnect attempt {}/{}",
            e, self.reconnects, self.options.max_reconnects
        );
        self.observed.last_error = Some(e);
        if let Some(mut a) = self.drop_attempt() {
            a.detach_teardown(&self.options.user_agent);
        }
        self.start_attempt(url, creds);
    }

    fn keepalive_tick(&mut self) {
        let a = match self.attempt.as_mut() {
            Some(a) => a,
            None => return,
        };
        match a.keepalive.tick(Instant::now()) {
            None => {}
            Some(Tick::Send) => {
                let req = Request::builder(a.keepalive.method(), rtsp_types::Version::V1_0)
                    .request_uri(a.control_url())
                    .build(Bytes::new());
                match a.send(&self.options.user_agent, Purpose::KeepAlive, req, false) {
                    Ok(cseq) => a.keepalive.sent(cseq),
                    Err(e) => self.fail(e),
                }
            }
            Some(Tick::TimedOut { cseq }) => {
                let e = wrap!(ErrorInt::KeepaliveTimeout {
                    conn_ctx: a.conn_ctx,
                    cseq,
                    interval: a.keepalive.interval(),
                });
                self.fail(e);
            }
        }
    }

    fn datagram(&mut self, d: Datagram) {
        if self.teardown.is_some() {
            return;
        }
        match d.result {
            Err(source) => {
                let conn_ctx = match &self.attempt {
                    Some(a) => a.conn_ctx,
                    None => return,
                };
                self.fail(wrap!(ErrorInt::UdpRecvError {
                    conn_ctx,
                    pkt_ctx: d.ctx,
                    source,
                }));
            }
            Ok(data) => match d.channel_type {
                ChannelType::Rtcp => self.stats.rtcp(),
                ChannelType::Rtp => self.rtp(d.stream_i, d.ctx, data),
            },
        }
    }

    fn interleaved(&mut self, msg_ctx: RtspMessageContext, data: rtsp_types::Data<Bytes>) {
        if self.teardown.is_some() {
            return;
        }
        let a = match self.attempt.as_ref() {
            Some(a) => a,
            None => return,
        };
        let channel_id = data.channel_id();
        match a.transports.route_interleaved(channel_id) {
            None => debug!(
                "[{}, {}] ignoring data on unassigned channel {}",
                a.conn_ctx, msg_ctx, channel_id
            ),
            Some(m) => match m.channel_type {
                ChannelType::Rtcp => self.stats.rtcp(),
                ChannelType::Rtp => {
                    self.rtp(m.stream_i, PacketContext::tcp(msg_ctx), data.into_body())
                }
            },
        }
    }

    fn rtp(&mut self, stream_i: usize, ctx: PacketContext, data: Bytes) {
        let pkt = match RtpPacket::parse(data) {
            Ok(p) => p,
            Err(e) => {
                debug!("[{}] stream {}: {}", ctx, stream_i, e);
                self.stats.invalid();
                return;
            }
        };
        let stream = match self
            .attempt
            .as_mut()
            .and_then(|a| a.streams.get_mut(stream_i))
        {
            Some(s) => s,
            None => return,
        };
        stream.assembler.ingest(ctx, pkt);
        for frame in stream.assembler.drain() {
            self.stats.frame(frame.data.len());
            match self.frames_tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(f)) => {
                    trace!("frame queue full; dropping {} frame {}", f.media, &f.timestamp);
                    self.stats.dropped();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    fn publish_stats(&mut self) {
        let now = Instant::now();
        match &self.attempt {
            Some(a) if !a.streams.is_empty() => {
                self.observed.statistics = self
                    .stats
                    .publish(now, a.streams.iter().map(|s| s.assembler.stats()));
                let _ = self.observed_tx.send(self.observed.clone());
            }
            _ => {
                self.stats.publish(now, std::iter::empty());
            }
        }
    }
}

async fn next_datagram(attempt: &mut Option<Attempt>) -> Datagram {
    match attempt {
        Some(a) => a.transports.next_datagram().await,
        None => futures::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => futures::future::pending().await,
    }
}

async fn read_loop(mut reader: ConnectionReader, epoch: u64, tx: mpsc::Sender<(u64, Input)>) {
    loop {
        let input = match reader.next().await {
            Some(Ok(m)) => Input::Message(m),
            Some(Err(e)) => Input::ReadFailed(e),
            None => Input::Eof,
        };
        let done = !matches!(input, Input::Message(_));
        if tx.send((epoch, input)).await.is_err() || done {
            return;
        }
    }
}

async fn write_loop(
    mut writer: ConnectionWriter,
    mut rx: mpsc::UnboundedReceiver<Message<Bytes>>,
    epoch: u64,
    tx: mpsc::Sender<(u64, Input)>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = writer.send(msg).await {
            let _ = tx.send((epoch, Input::WriteFailed(e))).await;
            return;
        }
    }
    writer.close().await;
}
