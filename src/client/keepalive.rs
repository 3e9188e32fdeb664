// Copyright (C) 2021 rtspflow contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Keepalive scheduling for an established session.

use std::time::Duration;

use tokio::time::Instant;

const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// What the session should do when the keepalive deadline passes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Tick {
    /// Send a keepalive request and report its `CSeq` via [`KeepAlive::sent`].
    Send,

    /// The previous keepalive went unanswered for a whole interval.
    TimedOut { cseq: u32 },
}

/// Timer state for keepalive requests.
///
/// Runs from `Ready` until teardown. At most one keepalive is outstanding;
/// if it's still unanswered when the next one is due, the session is dead.
#[derive(Debug)]
pub(crate) struct KeepAlive {
    configured: Duration,
    interval: Duration,
    next_tick: Option<Instant>,
    waiting: Option<u32>,
    use_get_parameter: bool,
}

impl KeepAlive {
    pub(crate) fn new(configured: Duration) -> Self {
        let configured = configured.max(MIN_INTERVAL);
        Self {
            configured,
            interval: configured,
            next_tick: None,
            waiting: None,
            use_get_parameter: false,
        }
    }

    /// Uses `GET_PARAMETER` rather than `OPTIONS`, as when the server lists it
    /// in `Public`.
    pub(crate) fn set_use_get_parameter(&mut self, use_get_parameter: bool) {
        self.use_get_parameter = use_get_parameter;
    }

    pub(crate) fn method(&self) -> rtsp_types::Method {
        if self.use_get_parameter {
            rtsp_types::Method::GetParameter
        } else {
            rtsp_types::Method::Options
        }
    }

    /// Shortens the interval to half the server's session timeout if needed.
    pub(crate) fn set_server_timeout(&mut self, timeout_sec: u32) {
        let half = Duration::from_secs(u64::from(timeout_sec)) / 2;
        self.interval = self.configured.min(half).max(MIN_INTERVAL);
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    pub(crate) fn start(&mut self, now: Instant) {
        self.next_tick = Some(now + self.interval);
        self.waiting = None;
    }

    pub(crate) fn stop(&mut self) {
        self.next_tick = None;
        self.waiting = None;
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Advances the timer; returns `None` if nothing is due yet.
    pub(crate) fn tick(&mut self, now: Instant) -> Option<Tick> {
        match self.next_tick {
            Some(t) if t <= now => {}
            _ => return None,
        }
        if let Some(cseq) = self.waiting {
            self.stop();
            return Some(Tick::TimedOut { cseq });
        }
        self.next_tick = Some(now + self.interval);
        Some(Tick::Send)
    }

    pub(crate) fn sent(&mut self, cseq: u32) {
        self.waiting = Some(cseq);
    }

    /// Notes a response; returns true if it answered the outstanding keepalive.
    pub(crate) fn on_response(&mut self, cseq: u32) -> bool {
        if self.waiting == Some(cseq) {
            self.waiting = None;
            return true;
        }
        false
    }
}
