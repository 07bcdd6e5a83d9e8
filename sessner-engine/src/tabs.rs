//! Tab lifecycle: which session a tab belongs to at each moment.
//!
//! Creation rules, in order: explicit binding, opener inheritance,
//! navigation-target inheritance, then the noopener heuristic on the
//! tab's first request. Closure unbinds and hands empty sessions to the
//! session lifecycle manager.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::debug;

use crate::{
    host::{TabHost, TabId, TabInfo},
    sessions::SessionLifecycleManager,
    store::SharedStore,
    utils::now_millis,
    Result,
};

pub struct TabLifecycleManager {
    store: SharedStore,
    tabs_host: Arc<dyn TabHost>,
    sessions: Arc<SessionLifecycleManager>,
    recent_window_millis: i64,
    /// Last-known URL per tab, kept so closing URLs can be snapshotted
    /// after the host has already dropped the tab.
    last_urls: RwLock<HashMap<TabId, String>>,
    /// URLs of tabs that closed out of each session since it last had a
    /// full tab set; consumed when the session empties.
    closing_urls: RwLock<HashMap<String, Vec<String>>>,
}

impl TabLifecycleManager {
    pub fn new(
        store: SharedStore,
        tabs_host: Arc<dyn TabHost>,
        sessions: Arc<SessionLifecycleManager>,
        recent_window_millis: i64,
    ) -> Self {
        Self {
            store,
            tabs_host,
            sessions,
            recent_window_millis,
            last_urls: RwLock::new(HashMap::new()),
            closing_urls: RwLock::new(HashMap::new()),
        }
    }

    /// Rule 1: a tab created on behalf of an explicit user request is
    /// bound at creation.
    pub async fn bind_explicit(&self, tab: TabId, session_id: &str) -> Result<()> {
        self.store.write().bind_tab(tab, session_id, now_millis())?;
        self.repaint(tab).await;
        Ok(())
    }

    /// Rules 2 and 3: inherit the opener's (or navigation source's)
    /// binding at creation. Without one the tab stays unbound and waits
    /// for rule 4.
    pub async fn on_tab_created(&self, info: &TabInfo) -> Result<Option<String>> {
        if let Some(url) = &info.url {
            self.last_urls.write().insert(info.id, url.clone());
        }
        let source = info.opener;
        let inherited = source.and_then(|src| {
            self.store
                .read()
                .session_for_tab(src)
                .map(str::to_owned)
        });
        if let Some(session_id) = &inherited {
            self.store.write().bind_tab(info.id, session_id, now_millis())?;
            debug!(tab = %info.id, session = %session_id, "tab inherited opener binding");
            self.repaint(info.id).await;
        }
        Ok(inherited)
    }

    /// Rule 3 when the host reports the navigation source separately
    /// from the opener.
    pub async fn on_navigation_target(&self, source: TabId, new_tab: TabId) -> Result<Option<String>> {
        if self.store.read().session_for_tab(new_tab).is_some() {
            return Ok(self.store.read().session_for_tab(new_tab).map(str::to_owned));
        }
        let inherited = self.store.read().session_for_tab(source).map(str::to_owned);
        if let Some(session_id) = &inherited {
            self.store.write().bind_tab(new_tab, session_id, now_millis())?;
            debug!(tab = %new_tab, session = %session_id, "tab inherited navigation source");
            self.repaint(new_tab).await;
        }
        Ok(inherited)
    }

    /// Rule 4, the noopener heuristic: an unbound tab issuing its first
    /// request to `host` joins the session most recently active on that
    /// host, if any.
    pub async fn on_first_request(&self, tab: TabId, host: &str) -> Result<Option<String>> {
        if let Some(bound) = self.store.read().session_for_tab(tab) {
            return Ok(Some(bound.to_owned()));
        }
        let now = now_millis();
        let found = self
            .store
            .read()
            .find_recent_session_for_domain(host, now, self.recent_window_millis);
        if let Some(session_id) = &found {
            self.store.write().bind_tab(tab, session_id, now)?;
            debug!(tab = %tab, session = %session_id, host, "noopener heuristic bound tab");
            self.repaint(tab).await;
        }
        Ok(found)
    }

    /// Track navigations so closing URLs stay known.
    pub fn on_url_changed(&self, tab: TabId, url: &str) {
        self.last_urls.write().insert(tab, url.to_owned());
    }

    /// Activation and navigation-complete repaint the badge for the
    /// bound session.
    pub async fn on_activated(&self, tab: TabId) {
        self.repaint(tab).await;
    }

    /// UI request to bring a tab to the foreground.
    pub async fn switch_to(&self, tab: TabId) -> Result<()> {
        self.tabs_host.focus_tab(tab).await?;
        self.repaint(tab).await;
        Ok(())
    }

    async fn repaint(&self, tab: TabId) {
        let color = {
            let store = self.store.read();
            store
                .session_for_tab(tab)
                .and_then(|sid| store.session(sid))
                .map(|s| s.color.clone())
        };
        if let Some(color) = color {
            if let Err(e) = self.tabs_host.paint_badge(tab, &color).await {
                debug!(tab = %tab, error = %e, "badge repaint failed");
            }
        }
    }

    /// Closure: unbind, remember the closing URL, and hand an emptied
    /// session to the session lifecycle policy.
    pub async fn on_tab_removed(&self, tab: TabId) -> Result<()> {
        let last_url = self.last_urls.write().remove(&tab);
        let Some((session_id, emptied)) = self.store.write().unbind_tab(tab) else {
            return Ok(());
        };
        if let Some(url) = last_url {
            self.closing_urls
                .write()
                .entry(session_id.clone())
                .or_default()
                .push(url);
        }
        if emptied {
            let urls = self
                .closing_urls
                .write()
                .remove(&session_id)
                .unwrap_or_default();
            self.sessions.on_session_emptied(&session_id, urls).await?;
        }
        Ok(())
    }

    /// Drop per-tab scratch state for handles the host no longer knows.
    /// Run at startup reconciliation; tab handles are reused.
    pub async fn forget_stale_handles(&self) -> Result<()> {
        let live: Vec<TabId> = self
            .tabs_host
            .list_tabs()
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        self.last_urls.write().retain(|tab, _| live.contains(tab));
        Ok(())
    }
}
