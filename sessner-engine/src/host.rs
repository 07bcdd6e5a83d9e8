//! Traits over the extension-host surface the engine consumes, plus
//! in-memory reference implementations used in tests and embeddings.
//!
//! The host cookie jar is shared with the host itself; the engine treats
//! any cookie found there for a bound tab's origin as a leak.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicI64, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{cookie::Cookie, Result};

/// Host tab handle. Handles are ephemeral and may be reused by the host
/// after closure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct TabId(pub i64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the host reports about a tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: TabId,
    pub url: Option<String>,
    pub opener: Option<TabId>,
}

/// The browser's own cookie storage.
#[async_trait]
pub trait HostCookieJar: Send + Sync {
    /// Every host-jar cookie whose domain matches `host`.
    async fn cookies_for_host(&self, host: &str) -> Result<Vec<Cookie>>;

    /// Remove one cookie. `Ok(false)` means it was not present.
    async fn remove_cookie(&self, domain: &str, path: &str, name: &str) -> Result<bool>;
}

/// Tab control and decoration.
#[async_trait]
pub trait TabHost: Send + Sync {
    async fn open_tab(&self, url: &str) -> Result<TabId>;

    async fn tab_info(&self, tab: TabId) -> Result<Option<TabInfo>>;

    /// All tabs currently alive in the host.
    async fn list_tabs(&self) -> Result<Vec<TabInfo>>;

    /// Bring `tab` to the foreground.
    async fn focus_tab(&self, tab: TabId) -> Result<()>;

    /// Repaint the toolbar badge for `tab`.
    async fn paint_badge(&self, tab: TabId, color: &str) -> Result<()>;
}

/// In-memory host jar. Cookies live in a flat list, the way the host
/// exposes them through its cookie API.
#[derive(Default, Clone)]
pub struct MemoryHostJar {
    cookies: Arc<RwLock<Vec<Cookie>>>,
    failing_removes: Arc<AtomicUsize>,
}

impl MemoryHostJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, cookie: Cookie) {
        let mut jar = self.cookies.write();
        jar.retain(|c| c.equivalence_key() != cookie.equivalence_key());
        jar.push(cookie);
    }

    pub fn len(&self) -> usize {
        self.cookies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.read().is_empty()
    }

    /// Make the next `n` remove calls report failure, for retry tests.
    pub fn fail_next_removes(&self, n: usize) {
        self.failing_removes.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl HostCookieJar for MemoryHostJar {
    async fn cookies_for_host(&self, host: &str) -> Result<Vec<Cookie>> {
        Ok(self
            .cookies
            .read()
            .iter()
            .filter(|c| crate::cookie::host_matches_domain(&c.domain, host))
            .cloned()
            .collect())
    }

    async fn remove_cookie(&self, domain: &str, path: &str, name: &str) -> Result<bool> {
        if self
            .failing_removes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(false);
        }
        let mut jar = self.cookies.write();
        let before = jar.len();
        jar.retain(|c| c.equivalence_key() != (domain, path, name));
        Ok(jar.len() != before)
    }
}

/// In-memory tab host.
#[derive(Default, Clone)]
pub struct MemoryTabHost {
    tabs: Arc<RwLock<HashMap<TabId, TabInfo>>>,
    next_id: Arc<AtomicI64>,
    badges: Arc<RwLock<HashMap<TabId, String>>>,
    focused: Arc<RwLock<Option<TabId>>>,
}

impl MemoryTabHost {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicI64::new(1)),
            ..Default::default()
        }
    }

    /// Simulate a host-created tab (user action, restart reattachment).
    pub fn spawn_tab(&self, url: Option<&str>, opener: Option<TabId>) -> TabId {
        let id = TabId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.tabs.write().insert(
            id,
            TabInfo {
                id,
                url: url.map(str::to_owned),
                opener,
            },
        );
        id
    }

    pub fn navigate(&self, tab: TabId, url: &str) {
        if let Some(info) = self.tabs.write().get_mut(&tab) {
            info.url = Some(url.to_owned());
        }
    }

    pub fn close_tab(&self, tab: TabId) {
        self.tabs.write().remove(&tab);
        self.badges.write().remove(&tab);
    }

    pub fn badge(&self, tab: TabId) -> Option<String> {
        self.badges.read().get(&tab).cloned()
    }

    pub fn focused(&self) -> Option<TabId> {
        *self.focused.read()
    }
}

#[async_trait]
impl TabHost for MemoryTabHost {
    async fn open_tab(&self, url: &str) -> Result<TabId> {
        Ok(self.spawn_tab(Some(url), None))
    }

    async fn tab_info(&self, tab: TabId) -> Result<Option<TabInfo>> {
        Ok(self.tabs.read().get(&tab).cloned())
    }

    async fn list_tabs(&self) -> Result<Vec<TabInfo>> {
        let mut tabs: Vec<_> = self.tabs.read().values().cloned().collect();
        tabs.sort_by_key(|t| t.id);
        Ok(tabs)
    }

    async fn focus_tab(&self, tab: TabId) -> Result<()> {
        *self.focused.write() = Some(tab);
        Ok(())
    }

    async fn paint_badge(&self, tab: TabId, color: &str) -> Result<()> {
        self.badges.write().insert(tab, color.to_owned());
        Ok(())
    }
}
