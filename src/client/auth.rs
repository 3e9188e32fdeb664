// Copyright (C) 2021 rtspflow contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP `Basic` and `Digest` authentication, as in
//! [RFC 2617](https://datatracker.ietf.org/doc/html/rfc2617).
//!
//! Digest is computed without `qop`: `MD5(HA1:nonce:HA2)`. Servers which
//! offer `qop=auth` are still answered this way, as RFC 2617 requires them
//! to accept RFC 2069-style responses.

use base64::{engine::general_purpose, Engine as _};
use log::debug;
use md5::{Digest, Md5};

/// Username and password for the RTSP server.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum AuthScheme {
    Basic {
        realm: Option<String>,
    },
    Digest {
        realm: String,
        nonce: String,
        opaque: Option<String>,
    },
}

/// Parses a `WWW-Authenticate` header value.
///
/// When the server lists several challenges (some servers fold a `Basic`
/// and a `Digest` challenge into one header), `Digest` is preferred.
pub(crate) fn challenge(www_authenticate: &str) -> Result<AuthScheme, String> {
    let challenges = split_challenges(www_authenticate);
    if challenges.is_empty() {
        return Err("empty WWW-Authenticate header".to_owned());
    }
    let mut basic = None;
    for (scheme, params) in &challenges {
        if scheme.eq_ignore_ascii_case("digest") {
            let get = |k: &str| {
                params
                    .iter()
                    .find(|(pk, _)| pk.eq_ignore_ascii_case(k))
                    .map(|(_, v)| v.clone())
            };
            if let Some(algorithm) = get("algorithm") {
                if !algorithm.eq_ignore_ascii_case("md5") {
                    return Err(format!("unsupported Digest algorithm {:?}", algorithm));
                }
            }
            if let Some(qop) = get("qop") {
                debug!("ignoring Digest qop={:?}; answering without qop", qop);
            }
            let realm = get("realm").ok_or_else(|| "Digest challenge has no realm".to_owned())?;
            let nonce = get("nonce").ok_or_else(|| "Digest challenge has no nonce".to_owned())?;
            return Ok(AuthScheme::Digest {
                realm,
                nonce,
                opaque: get("opaque"),
            });
        } else if scheme.eq_ignore_ascii_case("basic") && basic.is_none() {
            basic = Some(AuthScheme::Basic {
                realm: params
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("realm"))
                    .map(|(_, v)| v.clone()),
            });
        }
    }
    basic.ok_or_else(|| {
        format!(
            "unsupported authentication scheme {:?}",
            challenges[0].0.as_str()
        )
    })
}

/// Computes the `Authorization` header value for one request.
pub(crate) fn credentials(
    scheme: &AuthScheme,
    method: &str,
    uri: &str,
    creds: &Credentials,
) -> String {
    match scheme {
        AuthScheme::Basic { .. } => {
            let raw = format!("{}:{}", creds.username, creds.password);
            format!("Basic {}", general_purpose::STANDARD.encode(raw))
        }
        AuthScheme::Digest {
            realm,
            nonce,
            opaque,
        } => {
            let response = digest_response(creds, realm, nonce, method, uri);
            let mut v = format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
                creds.username, realm, nonce, uri, response
            );
            if let Some(o) = opaque {
                v.push_str(&format!(", opaque=\"{}\"", o));
            }
            v
        }
    }
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn digest_response(
    creds: &Credentials,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", creds.username, realm, creds.password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2))
}

/// Splits a header into `(scheme, params)` pairs.
///
/// Params are comma-separated `key=value` or `key="quoted value"` items; an
/// item that doesn't look like a param starts a new challenge.
fn split_challenges(header: &str) -> Vec<(String, Vec<(String, String)>)> {
    let mut out: Vec<(String, Vec<(String, String)>)> = Vec::new();
    for item in split_items(header) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        // "Digest realm=..." starts a challenge; "realm=..." continues one.
        let (scheme, rest) = match item.split_once(|c: char| c.is_ascii_whitespace()) {
            Some((s, r)) if !s.contains('=') => (Some(s), r.trim_start()),
            _ if !item.contains('=') => (Some(item), ""),
            _ => (None, item),
        };
        if let Some(s) = scheme {
            out.push((s.to_owned(), Vec::new()));
        }
        if rest.is_empty() {
            continue;
        }
        let Some((_, params)) = out.last_mut() else {
            continue;
        };
        if let Some((k, v)) = rest.split_once('=') {
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(v);
            params.push((k.trim().to_owned(), v.replace("\\\"", "\"")));
        }
    }
    out
}

/// Splits on commas outside quoted strings.
fn split_items(header: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in header.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                items.push(&header[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&header[start..]);
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn axis_creds() -> Credentials {
        Credentials {
            username: "admin".to_owned(),
            password: "admin12345".to_owned(),
        }
    }

    #[test]
    fn digest_known_vector() {
        let scheme = challenge(r#"Digest realm="AXIS_WS_ACCC8E3A0A8F", nonce="000057c3""#).unwrap();
        assert_eq!(
            scheme,
            AuthScheme::Digest {
                realm: "AXIS_WS_ACCC8E3A0A8F".to_owned(),
                nonce: "000057c3".to_owned(),
                opaque: None,
            }
        );
        let creds = axis_creds();
        assert_eq!(
            md5_hex("admin:AXIS_WS_ACCC8E3A0A8F:admin12345"),
            "75502e61a6f5f950b275812704ee7c82"
        );
        assert_eq!(
            md5_hex("DESCRIBE:rtsp://host/stream"),
            "97452694f91963d4b76ffc811da1a06b"
        );
        let header = credentials(&scheme, "DESCRIBE", "rtsp://host/stream", &creds);
        assert_eq!(
            header,
            "Digest username=\"admin\", realm=\"AXIS_WS_ACCC8E3A0A8F\", nonce=\"000057c3\", \
             uri=\"rtsp://host/stream\", response=\"7e02f82354e97ca89847c4e2644ec34d\""
        );

        // Deterministic.
        assert_eq!(
            header,
            credentials(&scheme, "DESCRIBE", "rtsp://host/stream", &creds)
        );
    }

    #[test]
    fn basic() {
        let scheme = challenge(r#"Basic realm="cam""#).unwrap();
        assert_eq!(
            scheme,
            AuthScheme::Basic {
                realm: Some("cam".to_owned())
            }
        );
        assert_eq!(
            credentials(&scheme, "OPTIONS", "rtsp://host/", &axis_creds()),
            "Basic YWRtaW46YWRtaW4xMjM0NQ=="
        );
    }

    #[test]
    fn prefers_digest() {
        let scheme = challenge(
            r#"Basic realm="x", Digest realm="y, with comma", nonce="abc", opaque="op", qop="auth""#,
        )
        .unwrap();
        assert_eq!(
            scheme,
            AuthScheme::Digest {
                realm: "y, with comma".to_owned(),
                nonce: "abc".to_owned(),
                opaque: Some("op".to_owned()),
            }
        );
        let header = credentials(&scheme, "SETUP", "rtsp://h/s", &axis_creds());
        assert!(header.ends_with(", opaque=\"op\""), "{}", header);
    }

    #[test_case("Bearer token=abc" ; "bearer")]
    #[test_case("NTLM" ; "bare scheme")]
    #[test_case("" ; "empty")]
    #[test_case(r#"Digest realm="r", nonce="n", algorithm=SHA-256"# ; "sha256")]
    #[test_case(r#"Digest realm="r""# ; "no nonce")]
    fn unsupported(header: &str) {
        challenge(header).unwrap_err();
    }

    #[test]
    fn case_insensitive_scheme() {
        assert!(matches!(
            challenge(r#"DIGEST realm="r", nonce="n""#).unwrap(),
            AuthScheme::Digest { .. }
        ));
        assert!(matches!(
            challenge("basic").unwrap(),
            AuthScheme::Basic { realm: None }
        ));
    }
}
