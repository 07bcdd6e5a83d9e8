//! HTTP header interception.
//!
//! The request rewriter injects the bound session's cookies and the
//! response rewriter strips `Set-Cookie` so the host jar never sees them.
//! Where the host only grants read-only interception the interceptor
//! still captures cookies and records domain activity; removal then falls
//! to the change capturer and the sweeper.

use http::{header, HeaderMap, HeaderValue};
use tracing::{debug, warn};
use url::Url;

use crate::{
    cookie::{build_cookie_header, parse_set_cookie},
    host::TabId,
    store::SharedStore,
    utils::now_millis,
};

pub struct HttpInterceptor {
    store: SharedStore,
    /// False in degraded (read-only) interception mode.
    rewrite_headers: bool,
}

impl HttpInterceptor {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            rewrite_headers: true,
        }
    }

    pub fn read_only(store: SharedStore) -> Self {
        Self {
            store,
            rewrite_headers: false,
        }
    }

    /// Rewrite an outgoing request for `tab`. Unbound tabs pass through
    /// untouched. Never fails: an inconsistency degrades to pass-through.
    pub fn on_request(&self, tab: TabId, url: &Url, headers: &mut HeaderMap) {
        let Some(host) = url.host_str() else {
            return;
        };
        let now = now_millis();
        let mut store = self.store.write();
        let Some(session_id) = store.session_for_tab(tab).map(str::to_owned) else {
            return;
        };
        store.record_domain_activity(&session_id, host, now);
        let cookies = match store.cookies_for(&session_id, host, url.path(), now) {
            Ok(c) => c,
            Err(e) => {
                warn!(tab = %tab, error = %e, "cookie lookup failed, passing request through");
                return;
            }
        };
        drop(store);

        if !self.rewrite_headers {
            return;
        }
        headers.remove(header::COOKIE);
        if let Some(value) = build_cookie_header(&cookies) {
            match HeaderValue::from_str(&value) {
                Ok(v) => {
                    headers.insert(header::COOKIE, v);
                }
                Err(e) => warn!(tab = %tab, error = %e, "unencodable cookie header dropped"),
            }
        }
    }

    /// Capture and strip `Set-Cookie` on an incoming response for `tab`.
    /// Returns how many cookies were captured into the session store.
    pub fn on_response(&self, tab: TabId, url: &Url, headers: &mut HeaderMap) -> usize {
        let Some(host) = url.host_str() else {
            return 0;
        };
        let now = now_millis();
        let mut store = self.store.write();
        let Some(session_id) = store.session_for_tab(tab).map(str::to_owned) else {
            return 0;
        };

        let mut captured = 0;
        for raw in headers.get_all(header::SET_COOKIE) {
            let Ok(text) = raw.to_str() else {
                continue;
            };
            let Some(cookie) = parse_set_cookie(text, host, now) else {
                debug!(tab = %tab, "unparseable set-cookie dropped");
                continue;
            };
            if cookie.is_expired(now) {
                continue;
            }
            match store.store_cookie(&session_id, cookie, now) {
                Ok(_) => captured += 1,
                Err(e) => warn!(tab = %tab, error = %e, "cookie capture failed"),
            }
        }
        drop(store);

        if self.rewrite_headers {
            headers.remove(header::SET_COOKIE);
        }
        captured
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;
    use parking_lot::RwLock;
    use std::sync::Arc;

    fn setup() -> (SharedStore, String, TabId) {
        let store = Arc::new(RwLock::new(StateStore::new()));
        let session = store.write().create_session(None, None, 0).unwrap();
        let tab = TabId(1);
        store.write().bind_tab(tab, &session, 0).unwrap();
        (store, session, tab)
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn response_cookies_are_captured_and_stripped() {
        let (store, session, tab) = setup();
        let interceptor = HttpInterceptor::new(store.clone());

        let mut headers = HeaderMap::new();
        headers.append(
            header::SET_COOKIE,
            HeaderValue::from_static("sid=AAA; Path=/; Secure; HttpOnly"),
        );
        headers.append(
            header::SET_COOKIE,
            HeaderValue::from_static("theme=dark; Path=/app"),
        );
        let captured =
            interceptor.on_response(tab, &url("https://example.test/login"), &mut headers);
        assert_eq!(captured, 2);
        assert!(headers.get(header::SET_COOKIE).is_none());

        let jar = store.read();
        let cookies = jar
            .cookies_for(&session, "example.test", "/app/x", now_millis())
            .unwrap();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "theme");
    }

    #[test]
    fn request_gets_a_single_joined_cookie_header() {
        let (store, session, tab) = setup();
        store
            .write()
            .store_cookie(
                &session,
                crate::cookie::Cookie::new_host_only("a", "1", "example.test"),
                0,
            )
            .unwrap();
        store
            .write()
            .store_cookie(
                &session,
                crate::cookie::Cookie::new_host_only("b", "2", "example.test"),
                0,
            )
            .unwrap();

        let interceptor = HttpInterceptor::new(store);
        let mut headers = HeaderMap::new();
        // a stale host-jar header must be replaced, not appended to
        headers.insert(header::COOKIE, HeaderValue::from_static("leak=1"));
        interceptor.on_request(tab, &url("https://example.test/me"), &mut headers);

        let sent: Vec<_> = headers.get_all(header::COOKIE).iter().collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to_str().unwrap(), "a=1; b=2");
    }

    #[test]
    fn unbound_tab_passes_through() {
        let (store, _, _) = setup();
        let interceptor = HttpInterceptor::new(store);
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("keep=me"));
        interceptor.on_request(TabId(99), &url("https://example.test/"), &mut headers);
        assert_eq!(headers.get(header::COOKIE).unwrap(), "keep=me");

        let mut headers = HeaderMap::new();
        headers.insert(header::SET_COOKIE, HeaderValue::from_static("sid=X"));
        let captured = interceptor.on_response(TabId(99), &url("https://example.test/"), &mut headers);
        assert_eq!(captured, 0);
        assert!(headers.get(header::SET_COOKIE).is_some());
    }

    #[test]
    fn expired_set_cookie_is_dropped() {
        let (store, session, tab) = setup();
        let interceptor = HttpInterceptor::new(store.clone());
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SET_COOKIE,
            HeaderValue::from_static("gone=1; Max-Age=0"),
        );
        let captured = interceptor.on_response(tab, &url("https://example.test/"), &mut headers);
        assert_eq!(captured, 0);
        assert!(store
            .read()
            .cookies_for(&session, "example.test", "/", now_millis())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn read_only_mode_captures_without_touching_headers() {
        let (store, session, tab) = setup();
        let interceptor = HttpInterceptor::read_only(store.clone());

        let mut headers = HeaderMap::new();
        headers.insert(header::SET_COOKIE, HeaderValue::from_static("sid=AAA"));
        let captured = interceptor.on_response(tab, &url("https://example.test/"), &mut headers);
        assert_eq!(captured, 1);
        assert!(headers.get(header::SET_COOKIE).is_some());

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("host=jar"));
        interceptor.on_request(tab, &url("https://example.test/"), &mut headers);
        assert_eq!(headers.get(header::COOKIE).unwrap(), "host=jar");
        // activity is still recorded for the noopener heuristic
        assert!(store
            .read()
            .find_recent_session_for_domain("example.test", now_millis(), 30_000)
            .is_some());
        let _ = session;
    }

    #[test]
    fn request_records_domain_activity() {
        let (store, session, tab) = setup();
        let interceptor = HttpInterceptor::new(store.clone());
        interceptor.on_request(tab, &url("https://example.test/"), &mut HeaderMap::new());
        assert_eq!(
            store
                .read()
                .find_recent_session_for_domain("example.test", now_millis(), 30_000),
            Some(session)
        );
    }
}
