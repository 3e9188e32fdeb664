// Copyright (C) 2021 rtspflow contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tolerant parsing of the SDP subset RTSP servers send in `DESCRIBE`
//! responses ([RFC 8866](https://datatracker.ietf.org/doc/html/rfc8866)),
//! and selection of the streams to set up.
//!
//! Cameras produce a lot of slightly broken SDP. Only the absence of any
//! `m=` line is fatal; malformed `a=`/`c=` lines and unusable media sections
//! are logged and skipped.

use std::num::NonZeroU16;

use log::{debug, warn};
use url::Url;

use super::parse::join_control;
use super::MediaSelection;
use crate::codec::MediaType;

/// A static payload type in the [RTP parameters
/// registry](https://www.iana.org/assignments/rtp-parameters/rtp-parameters.xhtml#rtp-parameters-1):
/// encoding name, media type, clock rate, channels.
type StaticPayloadType = (&'static str, MediaType, u32, Option<u16>);

/// All registered static payload types, indexed by number.
/// The registry is officially closed, so this list should never change.
#[rustfmt::skip]
static STATIC_PAYLOAD_TYPES: [Option<StaticPayloadType>; 35] = [
    /* 0 */ Some(("pcmu", MediaType::Audio, 8_000, Some(1))),
    /* 1 */ None,
    /* 2 */ None,
    /* 3 */ Some(("gsm", MediaType::Audio, 8_000, Some(1))),
    /* 4 */ Some(("g723", MediaType::Audio, 8_000, Some(1))),
    /* 5 */ Some(("dvi4", MediaType::Audio, 8_000, Some(1))),
    /* 6 */ Some(("dvi4", MediaType::Audio, 16_000, Some(1))),
    /* 7 */ Some(("lpc", MediaType::Audio, 8_000, Some(1))),
    /* 8 */ Some(("pcma", MediaType::Audio, 8_000, Some(1))),
    /* 9 */ Some(("g722", MediaType::Audio, 8_000, Some(1))),
    /* 10 */ Some(("l16", MediaType::Audio, 44_100, Some(2))),
    /* 11 */ Some(("l16", MediaType::Audio, 44_100, Some(1))),
    /* 12 */ Some(("qcelp", MediaType::Audio, 8_000, Some(1))),
    /* 13 */ Some(("cn", MediaType::Audio, 8_000, Some(1))),
    /* 14 */ Some(("mpa", MediaType::Audio, 90_000, None)),
    /* 15 */ Some(("g728", MediaType::Audio, 8_000, Some(1))),
    /* 16 */ Some(("dvi4", MediaType::Audio, 11_025, Some(1))),
    /* 17 */ Some(("dvi4", MediaType::Audio, 22_050, Some(1))),
    /* 18 */ Some(("g729", MediaType::Audio, 8_000, Some(1))),
    /* 19 */ None,
    /* 20 */ None,
    /* 21 */ None,
    /* 22 */ None,
    /* 23 */ None,
    /* 24 */ None,
    /* 25 */ Some(("celb", MediaType::Video, 90_000, None)),
    /* 26 */ Some(("jpeg", MediaType::Video, 90_000, None)),
    /* 27 */ None,
    /* 28 */ Some(("nv", MediaType::Video, 90_000, None)),
    /* 29 */ None,
    /* 30 */ None,
    /* 31 */ Some(("h261", MediaType::Video, 90_000, None)),
    /* 32 */ Some(("mpv", MediaType::Video, 90_000, None)),
    /* 33 */ Some(("mp2t", MediaType::Video, 90_000, None)),
    /* 34 */ Some(("h263", MediaType::Video, 90_000, None)),
];

/// One audio or video media section of a session description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaDescription {
    pub(crate) media: MediaType,
    pub(crate) payload_type: u8,
    pub(crate) encoding_name: String,
    pub(crate) clock_rate: u32,
    pub(crate) channels: Option<NonZeroU16>,
    pub(crate) fmtp: Option<String>,
    pub(crate) control: Option<Url>,
    pub(crate) transport_hint: String,
}

impl MediaDescription {
    pub fn media(&self) -> MediaType {
        self.media
    }

    /// The RTP payload type: the first format listed on the `m=` line.
    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Lowercased encoding name, eg `h264` or `pcmu`.
    pub fn encoding_name(&self) -> &str {
        &self.encoding_name
    }

    /// RTP timestamp clock rate, in Hz. Never zero.
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn channels(&self) -> Option<NonZeroU16> {
        self.channels
    }

    /// Format-specific parameters from `a=fmtp`, for the depacketizer.
    pub fn fmtp(&self) -> Option<&str> {
        self.fmtp.as_deref()
    }

    /// The stream's `SETUP` URL, if it has its own `a=control`.
    pub fn control(&self) -> Option<&Url> {
        self.control.as_ref()
    }

    /// The `<proto>` field of the `m=` line, eg `RTP/AVP`.
    pub fn transport_hint(&self) -> &str {
        &self.transport_hint
    }
}

/// A parsed session description.
#[derive(Clone, Debug)]
pub struct Presentation {
    /// Base for relative control URLs.
    pub(crate) base_url: Url,

    /// Aggregate control URL for `PLAY`, `PAUSE`, and `TEARDOWN`.
    pub(crate) control: Url,

    /// Audio and video media in SDP order.
    pub(crate) medias: Vec<MediaDescription>,
}

impl Presentation {
    pub fn medias(&self) -> &[MediaDescription] {
        &self.medias
    }

    pub fn control(&self) -> &Url {
        &self.control
    }
}

/// Media section in progress, as collected from its lines.
struct RawMedia {
    line_no: usize,
    media: String,
    proto: String,
    fmt: String,
    rtpmap: Option<String>,
    fmtp: Option<String>,
    control: Option<String>,
}

/// Parses an SDP body.
///
/// `request_url` is the URL the `DESCRIBE` was sent to; `base_url` is the
/// base for relative control URLs (`Content-Base`, `Content-Location`, or the
/// request URL).
pub(crate) fn parse(sdp: &[u8], request_url: &Url, base_url: &Url) -> Result<Presentation, String> {
    let text = String::from_utf8_lossy(sdp);
    let mut session_control = None;
    let mut raw_medias: Vec<RawMedia> = Vec::new();
    let mut m_lines = 0;
    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let (ty, value) = match line.split_once('=') {
            Some((t, v)) if t.len() == 1 => (t, v),
            _ => {
                warn!("Skipping malformed SDP line {}: {:?}", line_no, line);
                continue;
            }
        };
        match ty {
            "v" if value.trim() != "0" => {
                debug!("Unexpected SDP version {:?} on line {}", value, line_no);
            }
            "m" => {
                m_lines += 1;
                let mut parts = value.split_ascii_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(media), Some(_port), Some(proto)) => {
                        let fmt = parts.collect::<Vec<_>>().join(" ");
                        raw_medias.push(RawMedia {
                            line_no,
                            media: media.to_owned(),
                            proto: proto.to_owned(),
                            fmt,
                            rtpmap: None,
                            fmtp: None,
                            control: None,
                        });
                    }
                    _ => {
                        warn!("Skipping malformed SDP m= line {}: {:?}", line_no, line);
                        // Attributes up to the next m= line belong to nothing.
                        raw_medias.push(RawMedia {
                            line_no,
                            media: String::new(),
                            proto: String::new(),
                            fmt: String::new(),
                            rtpmap: None,
                            fmtp: None,
                            control: None,
                        });
                    }
                }
            }
            "c" => {
                // c=<nettype> <addrtype> <connection-address>
                if value.split_ascii_whitespace().count() != 3 {
                    warn!("Skipping malformed SDP c= line {}: {:?}", line_no, line);
                }
            }
            "a" => {
                let (name, attr_value) = match value.split_once(':') {
                    Some((n, v)) => (n, Some(v.trim())),
                    None => (value, None),
                };
                match (raw_medias.last_mut(), name, attr_value) {
                    (None, "control", Some(v)) => session_control = Some(v.to_owned()),
                    (Some(m), "control", Some(v)) => m.control = Some(v.to_owned()),
                    (Some(m), "rtpmap", Some(v)) => {
                        // Only the first format is used, so keep only its rtpmap.
                        match v.split_once(' ') {
                            Some((pt, rest)) if pt == first_fmt(&m.fmt) => {
                                m.rtpmap = Some(rest.trim().to_owned())
                            }
                            Some(_) => {}
                            None => warn!("Skipping malformed SDP rtpmap on line {}", line_no),
                        }
                    }
                    (Some(m), "fmtp", Some(v)) => match v.split_once(' ') {
                        Some((pt, rest)) if pt == first_fmt(&m.fmt) => {
                            m.fmtp = Some(rest.trim().to_owned())
                        }
                        Some(_) => {}
                        None => warn!("Skipping malformed SDP fmtp on line {}", line_no),
                    },
                    (_, "control" | "rtpmap" | "fmtp", None) => {
                        warn!("Skipping SDP a={} with no value on line {}", name, line_no);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
    if m_lines == 0 {
        return Err("SDP has no media (m=) lines".to_owned());
    }

    let control = match session_control {
        Some(c) => join_control(base_url, &c)?,
        None => request_url.clone(),
    };
    let medias = raw_medias
        .iter()
        .filter(|m| !m.media.is_empty())
        .filter_map(|m| match parse_media(base_url, m) {
            Ok(d) => d,
            Err(e) => {
                warn!("Skipping SDP media on line {}: {}", m.line_no, e);
                None
            }
        })
        .collect();
    Ok(Presentation {
        base_url: base_url.clone(),
        control,
        medias,
    })
}

fn first_fmt(fmt: &str) -> &str {
    fmt.split_ascii_whitespace().next().unwrap_or("")
}

/// Interprets one media section. Returns `Ok(None)` for media types other
/// than audio and video.
fn parse_media(base_url: &Url, m: &RawMedia) -> Result<Option<MediaDescription>, String> {
    let media = match MediaType::from_sdp(&m.media) {
        Some(t) => t,
        None => {
            debug!("Ignoring {} media on line {}", &m.media, m.line_no);
            return Ok(None);
        }
    };

    // RFC 8866 section 5.14: with an RTP proto, the fmt sub-fields are RTP
    // payload types; the first is the default.
    if !m.proto.starts_with("RTP/") && !m.proto.contains("/RTP/") {
        return Err(format!("expected RTP-based proto, got {:?}", m.proto));
    }
    let pt_str = first_fmt(&m.fmt);
    let payload_type = pt_str
        .parse::<u8>()
        .ok()
        .filter(|pt| pt & 0x80 == 0)
        .ok_or_else(|| format!("invalid RTP payload type {:?}", pt_str))?;

    let (encoding_name, clock_rate, channels) = match &m.rtpmap {
        Some(rtpmap) => {
            // encoding-name "/" clock-rate [ "/" channels ]
            let mut parts = rtpmap.split('/');
            let encoding_name = parts.next().unwrap_or("");
            let clock_rate = parts
                .next()
                .and_then(|c| c.trim().parse::<u32>().ok())
                .ok_or_else(|| format!("bad clock rate in rtpmap {:?}", rtpmap))?;
            let channels = match parts.next() {
                Some(c) => Some(
                    c.trim()
                        .parse::<u16>()
                        .ok()
                        .and_then(NonZeroU16::new)
                        .ok_or_else(|| format!("bad channels in rtpmap {:?}", rtpmap))?,
                ),
                None => None,
            };
            (encoding_name.to_ascii_lowercase(), clock_rate, channels)
        }
        None => {
            let (encoding, static_media, clock_rate, channels) = STATIC_PAYLOAD_TYPES
                .get(usize::from(payload_type))
                .and_then(Option::as_ref)
                .ok_or_else(|| {
                    format!(
                        "expected rtpmap or assigned static payload type (got {})",
                        payload_type
                    )
                })?;
            if *static_media != media {
                return Err(format!(
                    "{} media can't use {} payload type {}",
                    media, static_media, payload_type
                ));
            }
            (
                (*encoding).to_owned(),
                *clock_rate,
                channels.and_then(NonZeroU16::new),
            )
        }
    };
    if clock_rate == 0 {
        return Err("clock rate 0".to_owned());
    }
    let control = m
        .control
        .as_deref()
        .map(|c| join_control(base_url, c))
        .transpose()?;
    Ok(Some(MediaDescription {
        media,
        payload_type,
        encoding_name,
        clock_rate,
        channels,
        fmtp: m.fmtp.clone(),
        control,
        transport_hint: m.proto.clone(),
    }))
}

/// Applies the caller's media intent: the first video and/or the first
/// audio media, in SDP order. Returned indices are into `medias`.
pub(crate) fn select(medias: &[MediaDescription], selection: MediaSelection) -> Vec<usize> {
    let want = |t: MediaType| match selection {
        MediaSelection::VideoOnly => t == MediaType::Video,
        MediaSelection::AudioOnly => t == MediaType::Audio,
        MediaSelection::VideoAndAudio => true,
    };
    let mut have_video = false;
    let mut have_audio = false;
    let mut out = Vec::new();
    for (i, m) in medias.iter().enumerate() {
        let have = match m.media {
            MediaType::Video => &mut have_video,
            MediaType::Audio => &mut have_audio,
        };
        if !want(m.media) || *have {
            continue;
        }
        *have = true;
        out.push(i);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_VIDEO: &str = "v=0\r\n\
        o=- 1 1 IN IP4 192.168.1.10\r\n\
        s=Session\r\n\
        c=IN IP4 0.0.0.0\r\n\
        t=0 0\r\n\
        a=control:*\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1\r\n\
        a=control:trackID=1\r\n\
        m=video 0 RTP/AVP 97\r\n\
        a=rtpmap:97 H265/90000\r\n\
        a=control:trackID=2\r\n\
        m=audio 0 RTP/AVP 0\r\n\
        a=control:trackID=3\r\n";

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn two_video_video_only() {
        let base = url("rtsp://cam/stream/");
        let p = parse(TWO_VIDEO.as_bytes(), &url("rtsp://cam/stream"), &base).unwrap();
        assert_eq!(p.medias.len(), 3);
        assert_eq!(p.control, base);
        let selected = select(&p.medias, MediaSelection::VideoOnly);
        assert_eq!(selected, vec![0]);
        let m = &p.medias[selected[0]];
        assert_eq!(m.encoding_name(), "h264");
        assert_eq!(m.clock_rate(), 90_000);
        assert_eq!(m.fmtp(), Some("packetization-mode=1"));
        assert_eq!(m.control().unwrap().as_str(), "rtsp://cam/stream/trackID=1");
        assert_eq!(m.transport_hint(), "RTP/AVP");

        assert_eq!(select(&p.medias, MediaSelection::VideoAndAudio), vec![0, 2]);
        assert_eq!(select(&p.medias, MediaSelection::AudioOnly), vec![2]);
    }

    #[test]
    fn static_payload_type() {
        let p = parse(TWO_VIDEO.as_bytes(), &url("rtsp://cam/s"), &url("rtsp://cam/s")).unwrap();
        let a = &p.medias[2];
        assert_eq!(a.media(), MediaType::Audio);
        assert_eq!(a.encoding_name(), "pcmu");
        assert_eq!(a.clock_rate(), 8_000);
        assert_eq!(a.channels().map(NonZeroU16::get), Some(1));
        assert_eq!(a.control().unwrap().as_str(), "rtsp://cam/s/trackID=3");
    }

    #[test]
    fn tolerates_malformed_lines() {
        let sdp = b"v=0\n\
            garbage line\n\
            c=IN IP4\n\
            a=control\n\
            m=video 0 RTP/AVP 96\n\
            a=rtpmap:96\n\
            a=rtpmap:96 H264/90000\n\
            a=fmtp:96\n\
            m=audio\n\
            a=rtpmap:0 PCMU/8000\n\
            m=application 0 RTP/AVP 107\n\
            a=rtpmap:107 vnd.onvif.metadata/90000\n\
            m=audio 0 RTP/AVP 98\n\
            a=rtpmap:98 mpeg4-generic/0\n";
        let p = parse(sdp, &url("rtsp://cam/s"), &url("rtsp://cam/s")).unwrap();
        assert_eq!(p.medias.len(), 1);
        assert_eq!(p.medias[0].encoding_name(), "h264");
        assert_eq!(p.medias[0].control(), None);
        assert_eq!(p.control.as_str(), "rtsp://cam/s");
    }

    #[test]
    fn no_media_is_error() {
        let e = parse(
            b"v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=x\r\nt=0 0\r\n",
            &url("rtsp://cam/s"),
            &url("rtsp://cam/s"),
        )
        .unwrap_err();
        assert!(e.contains("no media"), "{}", e);
    }

    #[test]
    fn dynamic_without_rtpmap_skipped() {
        let p = parse(
            b"v=0\r\nm=video 0 RTP/AVP 96\r\nm=video 0 RTP/AVP 26\r\n",
            &url("rtsp://cam/s"),
            &url("rtsp://cam/s"),
        )
        .unwrap();
        assert_eq!(p.medias.len(), 1);
        assert_eq!(p.medias[0].encoding_name(), "jpeg");
    }
}
