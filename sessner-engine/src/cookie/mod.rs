//! Cookie model and RFC 6265 parsing.
//!
//! Parsing follows the tolerant rules of RFC 6265 §5.2: the `name=value`
//! pair runs up to the first semicolon, then the attributes `Expires`,
//! `Max-Age`, `Domain`, `Path`, `Secure`, `HttpOnly` and `SameSite` are
//! recognized case-insensitively. Unknown attributes are ignored.

mod jar;
mod suffix;

pub use jar::SessionCookieJar;
pub use suffix::{domain_lookup_keys, host_matches_domain};

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::utils::now_millis;

/// Same-site policy of a cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SameSite {
    #[default]
    NoRestriction,
    Lax,
    Strict,
}

/// A cookie as captured and stored by the engine. The value is opaque.
///
/// `expires_at` is an absolute epoch-millis timestamp; `None` marks a
/// session cookie (no expiry). `created_at` orders duplicate names in
/// request headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Stored verbatim as received, with or without a leading dot.
    pub domain: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "crate::utils::is_default")]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "crate::utils::is_default")]
    pub http_only: bool,
    #[serde(default, skip_serializing_if = "crate::utils::is_default")]
    pub same_site: SameSite,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

impl Cookie {
    /// Bare `name=value` cookie scoped to `host` at `/`.
    pub fn new_host_only(name: impl Into<String>, value: impl Into<String>, host: &str) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: host.to_owned(),
            path: "/".to_owned(),
            secure: false,
            http_only: false,
            same_site: SameSite::default(),
            expires_at: None,
            created_at: now_millis(),
        }
    }

    /// `(domain, path, name)` primary key of the session cookie store.
    pub fn equivalence_key(&self) -> (&str, &str, &str) {
        (&self.domain, &self.path, &self.name)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }

    /// Serialized `name=value` pair for a `Cookie` request header.
    pub fn pair(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

/// Build a `Cookie` request-header value from an ordered match set.
pub fn build_cookie_header(cookies: &[Cookie]) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }
    Some(
        cookies
            .iter()
            .map(Cookie::pair)
            .collect::<Vec<_>>()
            .join("; "),
    )
}

/// Parse a single `Set-Cookie` header received for `request_host`.
///
/// Returns `None` when no `name=value` pair can be extracted. Expiry is
/// resolved to an absolute timestamp here; `Max-Age` wins over `Expires`
/// when both are present (RFC 6265 §5.3 step 3).
pub fn parse_set_cookie(header: &str, request_host: &str, now: i64) -> Option<Cookie> {
    let mut parts = header.split(';');
    let pair = parts.next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = Cookie {
        name: name.to_owned(),
        value: value.trim().to_owned(),
        domain: request_host.to_owned(),
        path: "/".to_owned(),
        secure: false,
        http_only: false,
        same_site: SameSite::default(),
        expires_at: None,
        created_at: now,
    };

    let mut expires_attr = None;
    let mut max_age_attr = None;
    for part in parts {
        let part = part.trim();
        if let Some((k, v)) = part.split_once('=') {
            let v = v.trim();
            match k.trim().to_ascii_lowercase().as_str() {
                "expires" => expires_attr = parse_http_date(v),
                "max-age" => max_age_attr = v.parse::<i64>().ok(),
                "domain" if !v.is_empty() => cookie.domain = v.to_owned(),
                "path" if v.starts_with('/') => cookie.path = v.to_owned(),
                "samesite" => {
                    cookie.same_site = if v.eq_ignore_ascii_case("lax") {
                        SameSite::Lax
                    } else if v.eq_ignore_ascii_case("strict") {
                        SameSite::Strict
                    } else {
                        SameSite::NoRestriction
                    }
                }
                _ => {}
            }
        } else if part.eq_ignore_ascii_case("secure") {
            cookie.secure = true;
        } else if part.eq_ignore_ascii_case("httponly") {
            cookie.http_only = true;
        }
    }

    cookie.expires_at = match (max_age_attr, expires_attr) {
        (Some(secs), _) => Some(now.saturating_add(secs.saturating_mul(1000))),
        (None, Some(at)) => Some(at),
        (None, None) => None,
    };
    Some(cookie)
}

/// Parse the `Expires` attribute date formats seen in the wild:
/// RFC 1123 (`Wed, 21 Oct 2015 07:28:00 GMT`), the obsolete RFC 850 form
/// with dashes, and its two-digit-year variant.
fn parse_http_date(s: &str) -> Option<i64> {
    if let Ok(t) = DateTime::parse_from_rfc2822(s) {
        return Some(t.timestamp_millis());
    }
    for fmt in ["%a, %d-%b-%Y %H:%M:%S GMT", "%A, %d-%b-%y %H:%M:%S GMT"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(t.and_utc().timestamp_millis());
        }
    }
    None
}

/// RFC 6265 §5.1.4 path matching, segment aware.
///
/// `/app` matches `/app` and `/app/x` but never `/apple`.
pub fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    if cookie_path == request_path {
        return true;
    }
    if !request_path.starts_with(cookie_path) {
        return false;
    }
    cookie_path.ends_with('/') || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_value_and_attributes() {
        let c = parse_set_cookie(
            "sid=AAA; Path=/app; Secure; HttpOnly; SameSite=Strict",
            "example.test",
            1_000,
        )
        .unwrap();
        assert_eq!(c.name, "sid");
        assert_eq!(c.value, "AAA");
        assert_eq!(c.domain, "example.test");
        assert_eq!(c.path, "/app");
        assert!(c.secure);
        assert!(c.http_only);
        assert_eq!(c.same_site, SameSite::Strict);
        assert_eq!(c.expires_at, None);
    }

    #[test]
    fn domain_attribute_is_stored_verbatim() {
        let c = parse_set_cookie("a=1; Domain=.example.test", "sub.example.test", 0).unwrap();
        assert_eq!(c.domain, ".example.test");
        let c = parse_set_cookie("a=1; Domain=example.test", "sub.example.test", 0).unwrap();
        assert_eq!(c.domain, "example.test");
    }

    #[test]
    fn absent_domain_and_path_default() {
        let c = parse_set_cookie("a=1", "example.test", 0).unwrap();
        assert_eq!(c.domain, "example.test");
        assert_eq!(c.path, "/");
    }

    #[test]
    fn max_age_wins_over_expires() {
        let c = parse_set_cookie(
            "a=1; Expires=Wed, 21 Oct 2015 07:28:00 GMT; Max-Age=60",
            "example.test",
            10_000,
        )
        .unwrap();
        assert_eq!(c.expires_at, Some(70_000));
    }

    #[test]
    fn expires_rfc1123() {
        let c = parse_set_cookie(
            "a=1; Expires=Wed, 21 Oct 2015 07:28:00 GMT",
            "example.test",
            0,
        )
        .unwrap();
        assert_eq!(c.expires_at, Some(1_445_412_480_000));
    }

    #[test]
    fn non_positive_max_age_is_already_expired() {
        let now = 50_000;
        let c = parse_set_cookie("a=1; Max-Age=0", "example.test", now).unwrap();
        assert!(c.is_expired(now));
        let c = parse_set_cookie("a=1; Max-Age=-5", "example.test", now).unwrap();
        assert!(c.is_expired(now));
    }

    #[test]
    fn nameless_pair_is_rejected() {
        assert!(parse_set_cookie("=oops", "example.test", 0).is_none());
        assert!(parse_set_cookie("no-equals-here", "example.test", 0).is_none());
    }

    #[test]
    fn path_matching_is_segment_aware() {
        assert!(path_matches("/", "/anything"));
        assert!(path_matches("/app", "/app"));
        assert!(path_matches("/app", "/app/x"));
        assert!(path_matches("/app/", "/app/x"));
        assert!(!path_matches("/app", "/apple"));
        assert!(!path_matches("/app/x", "/app"));
    }

    #[test]
    fn header_joins_with_semicolon_space() {
        let a = Cookie::new_host_only("a", "1", "h");
        let b = Cookie::new_host_only("b", "2", "h");
        assert_eq!(build_cookie_header(&[a, b]).unwrap(), "a=1; b=2");
        assert_eq!(build_cookie_header(&[]), None);
    }
}
