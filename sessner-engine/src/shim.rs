//! In-page `document.cookie` shim: the engine half of the bridge and the
//! page-side optimistic cache model.
//!
//! The page-context override services a synchronous getter, so it keeps a
//! cache string: the setter appends optimistically and posts the raw
//! cookie string over the bridge; the getter refreshes the cache when it
//! is older than 500 ms. The "set then immediately get" pattern pages
//! rely on therefore always observes the just-set pair.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{
    cookie::parse_set_cookie,
    host::{TabHost, TabId},
    store::SharedStore,
    utils::now_millis,
    Error, Result,
};

/// Cache entries older than this trigger a refresh pull.
pub const CACHE_STALENESS_MILLIS: i64 = 500;

/// Messages crossing the page ↔ extension bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShimMessage {
    SetCookie { cookie_string: String },
    GetCookies,
}

/// Extension-realm side of the bridge: forwards writes into the session
/// store and services cache-refresh pulls.
pub struct CookieShimBridge {
    store: SharedStore,
    tabs: Arc<dyn TabHost>,
}

impl CookieShimBridge {
    pub fn new(store: SharedStore, tabs: Arc<dyn TabHost>) -> Self {
        Self { store, tabs }
    }

    async fn tab_origin(&self, tab: TabId) -> Result<(String, String)> {
        let info = self
            .tabs
            .tab_info(tab)
            .await?
            .ok_or_else(|| Error::InvalidInput(format!("tab {tab} is gone")))?;
        let raw = info
            .url
            .ok_or_else(|| Error::InvalidInput(format!("tab {tab} has no URL")))?;
        let url =
            Url::parse(&raw).map_err(|e| Error::InvalidInput(format!("tab {tab} URL: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidInput(format!("tab {tab} URL has no host")))?
            .to_owned();
        Ok((host, url.path().to_owned()))
    }

    /// `SET_COOKIE` from the page: parse the assignment against the
    /// tab's origin and store it in the bound session.
    pub async fn handle_set(&self, tab: TabId, cookie_string: &str) -> Result<()> {
        let (host, _) = self.tab_origin(tab).await?;
        let now = now_millis();
        let mut store = self.store.write();
        let session_id = store
            .session_for_tab(tab)
            .map(str::to_owned)
            .ok_or_else(|| Error::UnknownSession(format!("tab {tab} is unbound")))?;
        let cookie = parse_set_cookie(cookie_string, &host, now)
            .ok_or_else(|| Error::InvalidInput(format!("unparseable cookie {cookie_string:?}")))?;
        if cookie.is_expired(now) {
            // an expired write is a delete in document.cookie terms
            if let Some(jar) = store.jar_mut(&session_id) {
                let _ = jar.remove(&cookie.domain, &cookie.path, &cookie.name);
            }
            return Ok(());
        }
        debug!(tab = %tab, cookie = %cookie.name, "page script cookie captured");
        store.store_cookie(&session_id, cookie, now)?;
        Ok(())
    }

    /// `GET_COOKIES` refresh pull: the serialized cookie string for the
    /// tab's current origin. `HttpOnly` cookies are never exposed to
    /// `document.cookie`.
    pub async fn serve_cookies(&self, tab: TabId) -> Result<String> {
        let (host, path) = self.tab_origin(tab).await?;
        let now = now_millis();
        let store = self.store.read();
        let session_id = store
            .session_for_tab(tab)
            .ok_or_else(|| Error::UnknownSession(format!("tab {tab} is unbound")))?;
        let cookies = store.cookies_for(session_id, &host, &path, now)?;
        Ok(cookies
            .iter()
            .filter(|c| !c.http_only)
            .map(|c| c.pair())
            .collect::<Vec<_>>()
            .join("; "))
    }

    pub async fn handle(&self, tab: TabId, message: ShimMessage) -> Result<Option<String>> {
        match message {
            ShimMessage::SetCookie { cookie_string } => {
                self.handle_set(tab, &cookie_string).await?;
                Ok(None)
            }
            ShimMessage::GetCookies => Ok(Some(self.serve_cookies(tab).await?)),
        }
    }
}

/// Page-side cache state machine.
///
/// Invariants:
/// - after `optimistic_set("n=v")`, `read` contains `n=v` until the next
///   `apply_refresh`, regardless of staleness;
/// - `read` asks for a refresh when the cache is older than
///   [`CACHE_STALENESS_MILLIS`];
/// - a set always asks for an immediate refresh.
#[derive(Debug, Default)]
pub struct ShimCache {
    entries: Vec<(String, String)>,
    last_refresh: i64,
}

/// What the caller should do after a cache operation.
#[derive(Debug, PartialEq, Eq)]
pub enum RefreshHint {
    Fresh,
    RefreshNeeded,
}

impl ShimCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `document.cookie` getter. Returns the serialized cache and
    /// whether a refresh pull should be scheduled.
    pub fn read(&self, now: i64) -> (String, RefreshHint) {
        let hint = if now - self.last_refresh > CACHE_STALENESS_MILLIS {
            RefreshHint::RefreshNeeded
        } else {
            RefreshHint::Fresh
        };
        let text = self
            .entries
            .iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        (text, hint)
    }

    /// The `document.cookie` setter: record `name=value` optimistically
    /// and always request an immediate refresh.
    pub fn optimistic_set(&mut self, cookie_string: &str) -> RefreshHint {
        let pair = cookie_string.split(';').next().unwrap_or_default();
        if let Some((name, value)) = pair.split_once('=') {
            let name = name.trim().to_owned();
            let value = value.trim().to_owned();
            match self.entries.iter_mut().find(|(n, _)| *n == name) {
                Some(entry) => entry.1 = value,
                None => self.entries.push((name, value)),
            }
        }
        RefreshHint::RefreshNeeded
    }

    /// Replace the cache with the engine's serialized answer.
    pub fn apply_refresh(&mut self, serialized: &str, now: i64) {
        self.entries = serialized
            .split(';')
            .filter_map(|pair| {
                let (n, v) = pair.trim().split_once('=')?;
                Some((n.to_owned(), v.to_owned()))
            })
            .collect();
        self.last_refresh = now;
    }
}
