//! The State Store: sole authority for mutable isolation state.
//!
//! The store is passive data plus pure operations. Orchestration (tier
//! limits, dormant policy, persistence triggers) lives in the lifecycle
//! managers, which hold the store behind the engine's single writer.

mod session;

pub use session::{canonical_name, color_for_id, Session, SessionState, COLOR_PALETTE};

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    cookie::{Cookie, SessionCookieJar},
    host::TabId,
    license::Tier,
    utils::new_session_id,
    Error, Result,
};

/// The store behind the engine's single writer. All engine-side
/// mutations happen on the event loop; the lock is uncontended by design.
pub type SharedStore = Arc<RwLock<StateStore>>;

/// Serializable image of the full isolation state, the shape persisted
/// under the `sessionStore` key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub sessions: BTreeMap<String, Session>,
    pub cookie_store: BTreeMap<String, SessionCookieJar>,
    pub tab_to_session: BTreeMap<TabId, String>,
}

/// Engine counters logged by the keep-alive task.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStats {
    pub sessions: usize,
    pub active: usize,
    pub dormant: usize,
    pub tabs: usize,
    pub cookies: usize,
}

#[derive(Default)]
pub struct StateStore {
    sessions: HashMap<String, Session>,
    tab_to_session: HashMap<TabId, String>,
    cookies: HashMap<String, SessionCookieJar>,
    /// `domain → session id → last seen (epoch millis)`; feeds only the
    /// noopener heuristic and is never persisted.
    domain_activity: HashMap<String, HashMap<String, i64>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session. `limit` carries the tier's concurrent-session
    /// cap when one applies; the count compares against non-dormant
    /// sessions only.
    pub fn create_session(
        &mut self,
        name: Option<String>,
        limit: Option<(Tier, usize)>,
        now: i64,
    ) -> Result<String> {
        if let Some((tier, max)) = limit {
            if self.count_by_state(SessionState::Active) >= max {
                return Err(Error::LimitExceeded { tier, limit: max });
            }
        }
        let name = match name {
            Some(n) => Some(self.validate_name(&n, None)?),
            None => None,
        };
        let id = new_session_id();
        let session = Session::new(id.clone(), name, now);
        debug!(session = %id, color = %session.color, "session created");
        self.cookies.insert(id.clone(), SessionCookieJar::new());
        self.sessions.insert(id.clone(), session);
        Ok(id)
    }

    /// Admit an externally built session (import, restore).
    pub fn insert_session(&mut self, session: Session, jar: SessionCookieJar) {
        self.cookies.insert(session.id.clone(), jar);
        self.sessions.insert(session.id.clone(), session);
    }

    /// Remove a session with its cookies, bindings and activity entries.
    pub fn delete_session(&mut self, id: &str) -> Result<Session> {
        let session = self
            .sessions
            .remove(id)
            .ok_or_else(|| Error::UnknownSession(id.to_owned()))?;
        self.cookies.remove(id);
        self.tab_to_session.retain(|_, sid| sid != id);
        for by_session in self.domain_activity.values_mut() {
            by_session.remove(id);
        }
        Ok(session)
    }

    /// Set or clear a session's display name, enforcing NFC
    /// case-insensitive uniqueness across the active + dormant set.
    pub fn rename_session(&mut self, id: &str, name: Option<String>) -> Result<()> {
        if !self.sessions.contains_key(id) {
            return Err(Error::UnknownSession(id.to_owned()));
        }
        let name = match name {
            Some(n) => Some(self.validate_name(&n, Some(id))?),
            None => None,
        };
        if let Some(session) = self.sessions.get_mut(id) {
            session.name = name;
        }
        Ok(())
    }

    fn validate_name(&self, name: &str, exclude: Option<&str>) -> Result<String> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("session name is empty".into()));
        }
        let canon = canonical_name(trimmed);
        let taken = self.sessions.values().any(|s| {
            exclude != Some(s.id.as_str())
                && s.name.as_deref().is_some_and(|n| canonical_name(n) == canon)
        });
        if taken {
            return Err(Error::InvalidInput(format!(
                "session name {trimmed:?} is already in use"
            )));
        }
        Ok(trimmed.to_owned())
    }

    /// Bind `tab` to `session_id`. Idempotent; overwrites a prior binding.
    /// A dormant or imported session becomes active again.
    pub fn bind_tab(&mut self, tab: TabId, session_id: &str, now: i64) -> Result<()> {
        if !self.sessions.contains_key(session_id) {
            return Err(Error::UnknownSession(session_id.to_owned()));
        }
        if let Some(prior) = self.tab_to_session.insert(tab, session_id.to_owned()) {
            if prior != session_id {
                if let Some(s) = self.sessions.get_mut(&prior) {
                    s.tabs.retain(|t| *t != tab);
                }
            }
        }
        if let Some(session) = self.sessions.get_mut(session_id) {
            if !session.tabs.contains(&tab) {
                session.tabs.push(tab);
            }
            session.state = SessionState::Active;
            session.touch(now);
        }
        Ok(())
    }

    /// Clear a tab's binding. Returns the session id and whether its tab
    /// list became empty; the caller owns the dormant/delete decision.
    pub fn unbind_tab(&mut self, tab: TabId) -> Option<(String, bool)> {
        let session_id = self.tab_to_session.remove(&tab)?;
        let emptied = match self.sessions.get_mut(&session_id) {
            Some(s) => {
                s.tabs.retain(|t| *t != tab);
                s.tabs.is_empty()
            }
            None => false,
        };
        Some((session_id, emptied))
    }

    pub fn session_for_tab(&self, tab: TabId) -> Option<&str> {
        self.tab_to_session.get(&tab).map(String::as_str)
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn session_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn count_by_state(&self, state: SessionState) -> usize {
        self.sessions.values().filter(|s| s.state == state).count()
    }

    /// Upsert a cookie into a session's jar. The cookie arrives already
    /// normalized (absent path → `/`, absent domain → request host);
    /// an expired cookie is rejected here and never stored. Returns the
    /// replaced cookie, if any.
    pub fn store_cookie(
        &mut self,
        session_id: &str,
        cookie: Cookie,
        now: i64,
    ) -> Result<Option<Cookie>> {
        let jar = self
            .cookies
            .get_mut(session_id)
            .ok_or_else(|| Error::UnknownSession(session_id.to_owned()))?;
        Ok(jar.store(cookie, now))
    }

    /// Ordered match set for a request at `(host, path)`; see
    /// [`SessionCookieJar::cookies_for`].
    pub fn cookies_for(
        &self,
        session_id: &str,
        host: &str,
        path: &str,
        now: i64,
    ) -> Result<Vec<Cookie>> {
        let jar = self
            .cookies
            .get(session_id)
            .ok_or_else(|| Error::UnknownSession(session_id.to_owned()))?;
        Ok(jar.cookies_for(host, path, now))
    }

    pub fn jar(&self, session_id: &str) -> Option<&SessionCookieJar> {
        self.cookies.get(session_id)
    }

    pub fn jar_mut(&mut self, session_id: &str) -> Option<&mut SessionCookieJar> {
        self.cookies.get_mut(session_id)
    }

    pub fn record_domain_activity(&mut self, session_id: &str, host: &str, now: i64) {
        self.domain_activity
            .entry(host.to_owned())
            .or_default()
            .insert(session_id.to_owned(), now);
    }

    /// The session most recently seen on `host` within `window_millis`,
    /// if any. Only resident sessions qualify.
    pub fn find_recent_session_for_domain(
        &self,
        host: &str,
        now: i64,
        window_millis: i64,
    ) -> Option<String> {
        self.domain_activity
            .get(host)?
            .iter()
            .filter(|(sid, seen)| {
                now - **seen <= window_millis && self.sessions.contains_key(*sid)
            })
            .max_by_key(|(_, seen)| **seen)
            .map(|(sid, _)| sid.clone())
    }

    /// Drop activity entries older than the window.
    pub fn prune_domain_activity(&mut self, now: i64, window_millis: i64) {
        self.domain_activity.retain(|_, by_session| {
            by_session.retain(|_, seen| now - *seen <= window_millis);
            !by_session.is_empty()
        });
    }

    /// Drop expired cookies across every session.
    pub fn purge_expired_cookies(&mut self, now: i64) -> usize {
        self.cookies.values_mut().map(|jar| jar.purge_expired(now)).sum()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            sessions: self.sessions.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            cookie_store: self.cookies.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            tab_to_session: self.tab_to_session.iter().map(|(k, v)| (*k, v.clone())).collect(),
        }
    }

    /// Replace the full state from a snapshot. Tab bindings pointing at
    /// non-resident sessions are dropped; the count of dropped bindings
    /// is returned.
    pub fn restore(&mut self, snapshot: Snapshot) -> usize {
        self.sessions = snapshot.sessions.into_iter().collect();
        self.cookies = snapshot.cookie_store.into_iter().collect();
        for session in self.sessions.values() {
            self.cookies.entry(session.id.clone()).or_default();
        }
        let mut dropped = 0;
        self.tab_to_session = snapshot
            .tab_to_session
            .into_iter()
            .filter(|(_, sid)| {
                let resident = self.sessions.contains_key(sid);
                if !resident {
                    dropped += 1;
                }
                resident
            })
            .collect();
        // tab lists must mirror the surviving bindings exactly
        for session in self.sessions.values_mut() {
            session.tabs.clear();
        }
        let bindings: Vec<_> = self
            .tab_to_session
            .iter()
            .map(|(tab, sid)| (*tab, sid.clone()))
            .collect();
        for (tab, sid) in bindings {
            if let Some(s) = self.sessions.get_mut(&sid) {
                s.tabs.push(tab);
            }
        }
        self.domain_activity.clear();
        dropped
    }

    /// Drop every tab binding. Tab handles are ephemeral and reused by
    /// the host, so restored bindings are meaningless until startup
    /// reconciliation rebuilds them.
    pub fn clear_tab_bindings(&mut self) {
        self.tab_to_session.clear();
        for session in self.sessions.values_mut() {
            session.tabs.clear();
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            sessions: self.sessions.len(),
            active: self.count_by_state(SessionState::Active),
            dormant: self.count_by_state(SessionState::Dormant),
            tabs: self.tab_to_session.len(),
            cookies: self.cookies.values().map(SessionCookieJar::len).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_session() -> (StateStore, String) {
        let mut store = StateStore::new();
        let id = store.create_session(None, None, 1_000).unwrap();
        (store, id)
    }

    #[test]
    fn limit_applies_to_active_sessions_only() {
        let mut store = StateStore::new();
        let limit = Some((Tier::Free, 2));
        let a = store.create_session(None, limit, 0).unwrap();
        store.create_session(None, limit, 0).unwrap();
        let err = store.create_session(None, limit, 0).unwrap_err();
        assert!(matches!(err, Error::LimitExceeded { limit: 2, .. }));

        // a dormant session frees a slot
        store.session_mut(&a).unwrap().state = SessionState::Dormant;
        store.create_session(None, limit, 0).unwrap();
    }

    #[test]
    fn name_uniqueness_is_case_insensitive() {
        let mut store = StateStore::new();
        store.create_session(Some("Work".into()), None, 0).unwrap();
        let err = store.create_session(Some("  wORK ".into()), None, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn bind_is_idempotent_and_overwrites() {
        let (mut store, a) = store_with_session();
        let b = store.create_session(None, None, 1_000).unwrap();
        let tab = TabId(7);

        store.bind_tab(tab, &a, 2_000).unwrap();
        store.bind_tab(tab, &a, 3_000).unwrap();
        assert_eq!(store.session(&a).unwrap().tabs, vec![tab]);

        store.bind_tab(tab, &b, 4_000).unwrap();
        assert!(store.session(&a).unwrap().tabs.is_empty());
        assert_eq!(store.session(&b).unwrap().tabs, vec![tab]);
        assert_eq!(store.session_for_tab(tab), Some(b.as_str()));
    }

    #[test]
    fn bind_unknown_session_fails() {
        let mut store = StateStore::new();
        let err = store.bind_tab(TabId(1), "session_0_missing", 0).unwrap_err();
        assert!(matches!(err, Error::UnknownSession(_)));
    }

    #[test]
    fn unbind_reports_emptied_session() {
        let (mut store, a) = store_with_session();
        store.bind_tab(TabId(1), &a, 0).unwrap();
        store.bind_tab(TabId(2), &a, 0).unwrap();
        assert_eq!(store.unbind_tab(TabId(1)), Some((a.clone(), false)));
        assert_eq!(store.unbind_tab(TabId(2)), Some((a.clone(), true)));
        assert_eq!(store.unbind_tab(TabId(2)), None);
    }

    #[test]
    fn store_cookie_requires_resident_session() {
        let mut store = StateStore::new();
        let c = Cookie::new_host_only("a", "1", "example.test");
        assert!(store.store_cookie("session_0_gone", c, 0).is_err());
    }

    #[test]
    fn recent_domain_lookup_respects_window() {
        let (mut store, a) = store_with_session();
        let b = store.create_session(None, None, 0).unwrap();
        store.record_domain_activity(&a, "example.test", 10_000);
        store.record_domain_activity(&b, "example.test", 25_000);

        assert_eq!(
            store.find_recent_session_for_domain("example.test", 30_000, 30_000),
            Some(b.clone())
        );
        // a's entry is outside the window now
        assert_eq!(
            store.find_recent_session_for_domain("example.test", 41_000, 30_000),
            Some(b.clone())
        );
        assert_eq!(
            store.find_recent_session_for_domain("example.test", 60_000, 30_000),
            None
        );
    }

    #[test]
    fn deleted_sessions_never_win_the_heuristic() {
        let (mut store, a) = store_with_session();
        store.record_domain_activity(&a, "example.test", 0);
        store.delete_session(&a).unwrap();
        assert_eq!(store.find_recent_session_for_domain("example.test", 1, 30_000), None);
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let (mut store, a) = store_with_session();
        store.bind_tab(TabId(3), &a, 0).unwrap();
        store
            .store_cookie(&a, Cookie::new_host_only("sid", "AAA", "example.test"), 0)
            .unwrap();

        let snap = store.snapshot();
        let mut restored = StateStore::new();
        assert_eq!(restored.restore(snap.clone()), 0);
        assert_eq!(restored.snapshot(), snap);
    }

    #[test]
    fn restore_drops_stale_bindings() {
        let (store, a) = store_with_session();
        let mut snap = store.snapshot();
        snap.tab_to_session.insert(TabId(9), "session_0_ghost".into());
        snap.tab_to_session.insert(TabId(1), a.clone());

        let mut restored = StateStore::new();
        assert_eq!(restored.restore(snap), 1);
        assert_eq!(restored.session_for_tab(TabId(9)), None);
        assert_eq!(restored.session(&a).unwrap().tabs, vec![TabId(1)]);
    }

    #[test]
    fn delete_session_clears_every_trace() {
        let (mut store, a) = store_with_session();
        store.bind_tab(TabId(1), &a, 0).unwrap();
        store.record_domain_activity(&a, "example.test", 0);
        store.delete_session(&a).unwrap();
        assert!(store.session(&a).is_none());
        assert_eq!(store.session_for_tab(TabId(1)), None);
        assert!(store.jar(&a).is_none());
    }
}
