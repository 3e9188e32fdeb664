// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing of RTSP response headers: `CSeq`, `Public`, `Session`,
//! `Transport`, `RTP-Info`, and the `DESCRIBE` body.

use bytes::Bytes;
use std::net::IpAddr;
use url::Url;

use super::sdp::Presentation;

/// Joins a control URL to a base URL in a non-RFC-compliant but common way.
/// This matches what live555 and ffmpeg do: a relative control is appended
/// after a `/` rather than resolved per RFC 3986.
pub(crate) fn join_control(base_url: &Url, control: &str) -> Result<Url, String> {
    if control == "*" {
        return Ok(base_url.clone());
    }
    if let Ok(absolute_url) = Url::parse(control) {
        return Ok(absolute_url);
    }

    Url::parse(&format!(
        "{}{}{}",
        base_url.as_str(),
        if base_url.as_str().ends_with('/') {
            ""
        } else {
            "/"
        },
        control
    ))
    .map_err(|e| {
        format!(
            "unable to join base url {} with control url {:?}: {}",
            base_url, control, e
        )
    })
}

/// Returns the `CSeq` from an RTSP response as a `u32`, or `None` if missing/unparseable.
pub(crate) fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|cseq| cseq.as_str().trim().parse().ok())
}

/// Methods the server advertised in its `OPTIONS` response's `Public` header.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Capabilities {
    pub(crate) get_parameter: bool,
    pub(crate) set_parameter: bool,
}

pub(crate) fn parse_public(response: &rtsp_types::Response<Bytes>) -> Capabilities {
    let mut caps = Capabilities::default();
    if let Some(public) = response.header(&rtsp_types::headers::PUBLIC) {
        for m in public.as_str().split(',') {
            let m = m.trim();
            if m.eq_ignore_ascii_case("GET_PARAMETER") {
                caps.get_parameter = true;
            } else if m.eq_ignore_ascii_case("SET_PARAMETER") {
                caps.set_parameter = true;
            }
        }
    }
    caps
}

/// Parses a successful RTSP `DESCRIBE` response into a [`Presentation`].
pub(crate) fn parse_describe(
    request_url: &Url,
    response: &rtsp_types::Response<Bytes>,
) -> Result<Presentation, String> {
    if let Some(ct) = response.header(&rtsp_types::headers::CONTENT_TYPE) {
        let mime = ct.as_str().split(';').next().unwrap_or("").trim();
        if !mime.eq_ignore_ascii_case("application/sdp") {
            return Err(format!(
                "DESCRIBE response has unexpected Content-Type {:?}",
                ct.as_str()
            ));
        }
    }

    // https://tools.ietf.org/html/rfc2326#appendix-C.1.1
    let base_url = response
        .header(&rtsp_types::headers::CONTENT_BASE)
        .map(|v| (rtsp_types::headers::CONTENT_BASE, v))
        .or_else(|| {
            response
                .header(&rtsp_types::headers::CONTENT_LOCATION)
                .map(|v| (rtsp_types::headers::CONTENT_LOCATION, v))
        })
        .map(|(h, v)| Url::parse(v.as_str()).map_err(|e| format!("bad {} {:?}: {}", h, v, e)))
        .unwrap_or_else(|| Ok(request_url.clone()))?;

    super::sdp::parse(&response.body()[..], request_url, &base_url).map_err(|e| {
        format!(
            "{}\n\n{:#?}",
            e,
            crate::hex::LimitedHex::new(&response.body()[..], 1024)
        )
    })
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SessionHeader {
    pub(crate) id: Box<str>,
    pub(crate) timeout_sec: u32,
}

/// Parses a `Session` header value: `id[;timeout=N]`, default timeout 60.
pub(crate) fn parse_session_header(value: &str) -> Result<SessionHeader, String> {
    // https://datatracker.ietf.org/doc/html/rfc2326#section-12.37
    let mut parts = value.split(';');
    let id = parts.next().unwrap_or("").trim();
    if id.is_empty() {
        return Err(format!("Empty session id in {:?}", value));
    }
    let mut timeout_sec = 60;
    for p in parts {
        let p = p.trim();
        match p.split_once('=') {
            Some((k, v)) if k.trim().eq_ignore_ascii_case("timeout") => {
                timeout_sec = v
                    .trim()
                    .parse()
                    .map_err(|_| format!("Unparseable timeout {:?}", v))?;
            }
            _ => log::debug!("Ignoring Session header parameter {:?}", p),
        }
    }
    Ok(SessionHeader {
        id: id.into(),
        timeout_sec,
    })
}

#[derive(Debug)]
pub(crate) struct SetupResponse {
    pub(crate) session: SessionHeader,
    pub(crate) ssrc: Option<u32>,
    pub(crate) channel_id: Option<u8>,
    pub(crate) source: Option<IpAddr>,
    pub(crate) client_port: Option<(u16, u16)>,
    pub(crate) server_port: Option<(u16, u16)>,
}

fn parse_pair<T: std::str::FromStr + Copy>(s: &str) -> Option<(T, Option<T>)> {
    let mut it = s.splitn(2, '-');
    let a = it.next()?.trim().parse().ok()?;
    match it.next() {
        None => Some((a, None)),
        Some(b) => Some((a, Some(b.trim().parse().ok()?))),
    }
}

/// Parses a `SETUP` response's `Session` and `Transport` headers.
pub(crate) fn parse_setup(response: &rtsp_types::Response<Bytes>) -> Result<SetupResponse, String> {
    let session = response
        .header(&rtsp_types::headers::SESSION)
        .ok_or_else(|| "Missing Session header".to_string())?;
    let session = parse_session_header(session.as_str())?;
    let transport = response
        .header(&rtsp_types::headers::TRANSPORT)
        .ok_or_else(|| "Missing Transport header".to_string())?;
    let mut channel_id = None;
    let mut ssrc = None;
    let mut source = None;
    let mut client_port = None;
    let mut server_port = None;
    for part in transport.as_str().split(';') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("ssrc=") {
            ssrc = Some(
                u32::from_str_radix(v.trim(), 16).map_err(|_| format!("Unparseable ssrc {}", v))?,
            );
        } else if let Some(interleaved) = part.strip_prefix("interleaved=") {
            let (n, m) = parse_pair::<u8>(interleaved)
                .ok_or_else(|| format!("bad interleaved channels {:?}", interleaved))?;
            if let Some(m) = m {
                if n.checked_add(1) != Some(m) {
                    log::debug!("Expected adjacent channels; got {}-{}", n, m);
                }
            }
            channel_id = Some(n);
        } else if let Some(s) = part.strip_prefix("source=") {
            source = Some(
                s.parse()
                    .map_err(|_| format!("Transport header has unparseable source {:?}", s))?,
            );
        } else if let Some(s) = part.strip_prefix("server_port=") {
            let (n, m) =
                parse_pair::<u16>(s).ok_or_else(|| format!("bad server_port {:?}", s))?;
            server_port = Some((n, m.unwrap_or(n.wrapping_add(1))));
        } else if let Some(s) = part.strip_prefix("client_port=") {
            let (n, m) =
                parse_pair::<u16>(s).ok_or_else(|| format!("bad client_port {:?}", s))?;
            client_port = Some((n, m.unwrap_or(n.wrapping_add(1))));
        }
    }
    Ok(SetupResponse {
        session,
        ssrc,
        channel_id,
        source,
        client_port,
        server_port,
    })
}

/// One stream's entry in a `PLAY` response's `RTP-Info` header.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct RtpInfo {
    pub(crate) url: Url,
    pub(crate) seq: Option<u16>,
    pub(crate) rtptime: Option<u32>,
}

/// Parses a `PLAY` response's `RTP-Info` header, if any.
pub(crate) fn parse_rtp_info(
    response: &rtsp_types::Response<Bytes>,
    base_url: &Url,
) -> Result<Vec<RtpInfo>, String> {
    // https://tools.ietf.org/html/rfc2326#section-12.33
    let rtp_info = match response.header(&rtsp_types::headers::RTP_INFO) {
        Some(r) => r,
        None => return Ok(Vec::new()),
    };
    let mut out = Vec::new();
    for s in rtp_info.as_str().split(',') {
        let s = s.trim();
        if s.is_empty() {
            continue;
        }
        let mut parts = s.split(';');
        let url = parts
            .next()
            .and_then(|u| u.trim().strip_prefix("url="))
            .ok_or_else(|| format!("RTP-Info entry missing stream URL: {:?}", s))?;
        let url = join_control(base_url, url)?;
        let mut entry = RtpInfo {
            url,
            seq: None,
            rtptime: None,
        };
        for part in parts {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| format!("RTP-Info param {:?} has no =", part))?;
            match key.trim() {
                "seq" => {
                    entry.seq = Some(
                        value
                            .trim()
                            .parse()
                            .map_err(|_| format!("bad seq {:?}", value))?,
                    )
                }
                "rtptime" => {
                    entry.rtptime = Some(
                        value
                            .trim()
                            .parse()
                            .map_err(|_| format!("bad rtptime {:?}", value))?,
                    )
                }
                _ => {}
            }
        }
        out.push(entry);
    }
    Ok(out)
}
