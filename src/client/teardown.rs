// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Best-effort `TEARDOWN` on `stop()`.

use bytes::Bytes;
use rtsp_types::{Method, Request};
use tokio::time::Instant;
use url::Url;

use super::auth::Credentials;
use super::session::Waiter;

/// Builds the `TEARDOWN` for the presentation's aggregate control URL. `CSeq`,
/// `Session`, and `Authorization` are added when it's sent.
pub(super) fn request(control: &Url) -> Request<Bytes> {
    Request::builder(Method::Teardown, rtsp_types::Version::V1_0)
        .request_uri(control.clone())
        .build(Bytes::new())
}

/// An outstanding `TEARDOWN`.
///
/// Any response (success, `454 Session Not Found`, or otherwise), a broken
/// connection, or the deadline ends it. Until then the connection stays open
/// and media is discarded.
pub(super) struct Teardown {
    deadline: Instant,
    waiters: Vec<Waiter>,

    /// A `connect()` which arrived mid-teardown, to start once it's done.
    then: Option<(Url, Option<Credentials>)>,
}

impl Teardown {
    pub(super) fn new(deadline: Instant, waiter: Option<Waiter>) -> Self {
        Self {
            deadline,
            waiters: waiter.into_iter().collect(),
            then: None,
        }
    }

    pub(super) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Adds a `stop()` caller; a repeated stop also cancels a queued connect.
    pub(super) fn add_waiter(&mut self, waiter: Option<Waiter>) {
        self.then = None;
        self.waiters.extend(waiter);
    }

    pub(super) fn connect_after(&mut self, url: Url, creds: Option<Credentials>) {
        self.then = Some((url, creds));
    }

    pub(super) fn finish(self) -> (Vec<Waiter>, Option<(Url, Option<Credentials>)>) {
        (self.waiters, self.then)
    }
}
