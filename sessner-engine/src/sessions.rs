//! Session lifecycle: creation, limits, dormant policy, import/export
//! and startup reconciliation.
//!
//! The manager orchestrates the passive state store, the persistence
//! manager and the license controller; nothing here is reachable from
//! page realms.

use std::{collections::BTreeMap, sync::Arc};

use serde::Serialize;
use tracing::{info, warn};
use url::Url;

use crate::{
    config::EngineConfig,
    export::{export_sessions, import_sessions, ExportDocument, SessionExport},
    host::{TabHost, TabId, TabInfo},
    license::{ExportCapability, LicenseController, Tier},
    persist::{PersistenceManager, KEY_AUTO_RESTORE},
    store::{canonical_name, Session, SessionState, SharedStore},
    utils::now_millis,
    Error, Result,
};

/// Result of a bulk dormant delete; continues past individual failures.
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BulkDeleteReport {
    pub total_found: usize,
    pub deleted: usize,
    pub errors_by_session: BTreeMap<String, String>,
}

/// Result of an import: new session ids plus the renames applied to
/// resolve name collisions.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported: Vec<String>,
    pub renames: BTreeMap<String, String>,
}

/// Answer for `canCreateSession`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanCreateView {
    pub allowed: bool,
    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    pub active_count: usize,
}

pub struct SessionLifecycleManager {
    store: SharedStore,
    persistence: PersistenceManager,
    license: Arc<LicenseController>,
    tabs_host: Arc<dyn TabHost>,
    cfg: EngineConfig,
}

impl SessionLifecycleManager {
    pub fn new(
        store: SharedStore,
        persistence: PersistenceManager,
        license: Arc<LicenseController>,
        tabs_host: Arc<dyn TabHost>,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            store,
            persistence,
            license,
            tabs_host,
            cfg,
        }
    }

    async fn persist_now(&self) -> Result<()> {
        let snapshot = self.store.read().snapshot();
        self.persistence.save_now(&snapshot).await
    }

    async fn persist_debounced(&self) {
        let snapshot = self.store.read().snapshot();
        self.persistence.save_debounced(snapshot).await;
    }

    /// Create a session, enforcing the tier's concurrent limit and the
    /// custom-name gate.
    pub async fn create_session(&self, name: Option<String>) -> Result<String> {
        let now = now_millis();
        let tier = self.license.tier(now);
        let features = self.license.features(now);
        if name.is_some() && !features.custom_names {
            return Err(Error::TierRestricted {
                tier,
                feature: "customNames".into(),
            });
        }
        let limit = features.max_concurrent_sessions.map(|m| (tier, m));
        let mut store = self.store.write();
        let id = store.create_session(name, limit, now)?;
        // color is assigned once, from the palette slice the tier allows
        if let Some(size) = features.badge_palette_size {
            if let Some(session) = store.session_mut(&id) {
                session.color = crate::store::color_for_id(&id, size);
            }
        }
        drop(store);
        self.persist_now().await?;
        Ok(id)
    }

    pub fn can_create(&self) -> CanCreateView {
        let now = now_millis();
        let tier = self.license.tier(now);
        let limit = self.license.features(now).max_concurrent_sessions;
        let active_count = self.store.read().count_by_state(SessionState::Active);
        CanCreateView {
            allowed: limit.is_none_or(|m| active_count < m),
            tier,
            limit,
            active_count,
        }
    }

    pub async fn set_name(&self, session_id: &str, name: Option<String>) -> Result<()> {
        let now = now_millis();
        if name.is_some() && !self.license.features(now).custom_names {
            return Err(Error::TierRestricted {
                tier: self.license.tier(now),
                feature: "customNames".into(),
            });
        }
        self.store.write().rename_session(session_id, name)?;
        self.persist_debounced().await;
        Ok(())
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let session = self.store.write().delete_session(session_id)?;
        info!(session = %session.id, "session deleted");
        self.persist_now().await?;
        Ok(())
    }

    /// Sessions listed in the UI's dormant pane. Imported sessions count
    /// as dormant until opened.
    pub fn dormant_sessions(&self) -> Vec<Session> {
        let store = self.store.read();
        let mut out: Vec<_> = store
            .sessions()
            .filter(|s| s.state != SessionState::Active)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        out
    }

    /// Policy when a session's last tab closes: ENTERPRISE with
    /// auto-restore enabled deletes (ephemeral policy); everyone else
    /// goes dormant with the closing URLs snapshotted for reopen.
    pub async fn on_session_emptied(&self, session_id: &str, closing_urls: Vec<String>) -> Result<()> {
        let now = now_millis();
        let ephemeral = self.license.features(now).auto_restore && self.auto_restore_enabled().await;
        if ephemeral {
            self.store.write().delete_session(session_id)?;
            info!(session = %session_id, "empty session deleted (ephemeral policy)");
        } else {
            let mut store = self.store.write();
            let Some(session) = store.session_mut(session_id) else {
                return Err(Error::UnknownSession(session_id.to_owned()));
            };
            session.state = SessionState::Dormant;
            if !closing_urls.is_empty() {
                session.persisted_tabs = Some(closing_urls);
            }
            session.touch(now);
            info!(session = %session_id, "session dormant");
        }
        self.persist_now().await?;
        Ok(())
    }

    /// Reopen a dormant session: open a tab per persisted URL and bind
    /// each one.
    pub async fn reopen(&self, session_id: &str) -> Result<Vec<TabId>> {
        let urls = {
            let store = self.store.read();
            let session = store
                .session(session_id)
                .ok_or_else(|| Error::UnknownSession(session_id.to_owned()))?;
            if session.state == SessionState::Active {
                return Err(Error::InvalidInput(format!(
                    "session {session_id} is already open"
                )));
            }
            session.persisted_tabs.clone().unwrap_or_default()
        };
        let now = now_millis();
        let mut opened = Vec::new();
        for url in &urls {
            let tab = self.tabs_host.open_tab(url).await?;
            self.store.write().bind_tab(tab, session_id, now)?;
            opened.push(tab);
        }
        {
            let mut store = self.store.write();
            if let Some(session) = store.session_mut(session_id) {
                session.state = SessionState::Active;
                session.persisted_tabs = None;
                session.touch(now);
            }
        }
        self.persist_now().await?;
        Ok(opened)
    }

    /// Sequential per-session deletion that continues past failures.
    pub async fn delete_all_dormant(&self) -> BulkDeleteReport {
        let targets: Vec<String> = self
            .dormant_sessions()
            .into_iter()
            .map(|s| s.id)
            .collect();
        let mut report = BulkDeleteReport {
            total_found: targets.len(),
            ..Default::default()
        };
        for id in targets {
            match self.store.write().delete_session(&id) {
                Ok(_) => report.deleted += 1,
                Err(e) => {
                    report.errors_by_session.insert(id, e.to_string());
                }
            }
        }
        if let Err(e) = self.persist_now().await {
            warn!(error = %e, "persist after bulk delete failed");
        }
        report
    }

    /// Export one session, or all of them. Tier gating: PREMIUM may
    /// export single sessions, ENTERPRISE everything; a password needs
    /// the encryption feature.
    pub async fn export(
        &self,
        session_id: Option<&str>,
        password: Option<&str>,
    ) -> Result<ExportDocument> {
        let now = now_millis();
        let tier = self.license.tier(now);
        let features = self.license.features(now);
        match features.export {
            ExportCapability::None => {
                return Err(Error::TierRestricted {
                    tier,
                    feature: "export".into(),
                })
            }
            ExportCapability::Single if session_id.is_none() => {
                return Err(Error::TierRestricted {
                    tier,
                    feature: "bulkExport".into(),
                })
            }
            _ => {}
        }
        if password.is_some() && !features.export_encryption {
            return Err(Error::TierRestricted {
                tier,
                feature: "exportEncryption".into(),
            });
        }

        let store = self.store.read();
        let exports: Vec<SessionExport> = match session_id {
            Some(id) => {
                let session = store
                    .session(id)
                    .ok_or_else(|| Error::UnknownSession(id.to_owned()))?;
                vec![SessionExport {
                    session: session.clone(),
                    cookies: store.jar(id).cloned().unwrap_or_default(),
                }]
            }
            None => store
                .sessions()
                .map(|s| SessionExport {
                    session: s.clone(),
                    cookies: store.jar(&s.id).cloned().unwrap_or_default(),
                })
                .collect(),
        };
        drop(store);
        export_sessions(exports, self.cfg.export_compress_threshold_bytes, password)
    }

    /// Import sessions from an export document. Imported sessions get a
    /// fresh id, keep their creation timestamps and cookies, rename on
    /// collision with a " (2)"-style suffix and materialize dormant.
    pub async fn import(
        &self,
        doc: &ExportDocument,
        password: Option<&str>,
    ) -> Result<ImportReport> {
        let now = now_millis();
        if self.license.features(now).export == ExportCapability::None {
            return Err(Error::TierRestricted {
                tier: self.license.tier(now),
                feature: "export".into(),
            });
        }
        let incoming = import_sessions(doc, password, self.cfg.import_max_bytes)?;

        let mut report = ImportReport::default();
        let mut store = self.store.write();
        for entry in incoming {
            let mut session = entry.session;
            let original_name = session.name.clone();
            if let Some(name) = original_name.as_deref() {
                let resolved = dedupe_name(name, |candidate| {
                    let canon = canonical_name(candidate);
                    store
                        .sessions()
                        .any(|s| s.name.as_deref().is_some_and(|n| canonical_name(n) == canon))
                });
                if resolved != name {
                    report.renames.insert(name.to_owned(), resolved.clone());
                }
                session.name = Some(resolved);
            }
            let new_id = crate::utils::new_session_id();
            session.id = new_id.clone();
            session.state = SessionState::Imported;
            session.tabs.clear();
            store.insert_session(session, entry.cookies);
            report.imported.push(new_id);
        }
        drop(store);
        self.persist_now().await?;
        info!(imported = report.imported.len(), "sessions imported");
        Ok(report)
    }

    pub async fn auto_restore_enabled(&self) -> bool {
        self.persistence
            .get_value::<bool>(KEY_AUTO_RESTORE)
            .await
            .ok()
            .flatten()
            .unwrap_or(false)
    }

    /// The preference persists independently of tier; it only takes
    /// effect while the tier grants the feature.
    pub async fn set_auto_restore(&self, enabled: bool) -> Result<()> {
        self.persistence.put_value(KEY_AUTO_RESTORE, &enabled).await
    }

    /// Record every active session's current tab URLs so a restart can
    /// reconstruct bindings by URL.
    pub async fn refresh_persisted_tabs(&self) -> Result<()> {
        let tabs = self.tabs_host.list_tabs().await?;
        let mut by_session: BTreeMap<String, Vec<String>> = BTreeMap::new();
        {
            let store = self.store.read();
            for info in &tabs {
                if let (Some(sid), Some(url)) = (store.session_for_tab(info.id), info.url.as_ref())
                {
                    by_session.entry(sid.to_owned()).or_default().push(url.clone());
                }
            }
        }
        let mut store = self.store.write();
        for (sid, urls) in by_session {
            if let Some(session) = store.session_mut(&sid) {
                session.persisted_tabs = Some(urls);
            }
        }
        Ok(())
    }

    /// Post-grace reconciliation after a restart, in order: stale
    /// bindings are already gone (cleared at restore), ENTERPRISE
    /// auto-restore reclaims reattached tabs by URL, remaining empty
    /// active sessions go dormant, and FREE-tier dormant sessions past
    /// the persistence window are dropped.
    pub async fn reconcile_startup(&self) -> Result<()> {
        let now = now_millis();
        if self.license.features(now).auto_restore && self.auto_restore_enabled().await {
            self.auto_restore_reconcile(now).await?;
        }
        self.convert_empty_actives(now);
        self.expire_dormant_past_window(now);
        self.persist_now().await?;
        Ok(())
    }

    /// Claim host-reattached tabs whose URL matches a persisted URL by
    /// exact (host, path). Unmatched URLs stay persisted for manual
    /// reopen.
    async fn auto_restore_reconcile(&self, now: i64) -> Result<()> {
        let reattached = self.tabs_host.list_tabs().await?;
        let mut claimed: Vec<TabId> = Vec::new();
        let mut bindings: Vec<(TabId, String, String)> = Vec::new();

        {
            let store = self.store.read();
            let sessions: Vec<&Session> = store
                .sessions()
                .filter(|s| s.persisted_tabs.is_some())
                .collect();
            for session in sessions {
                let Some(urls) = &session.persisted_tabs else {
                    continue;
                };
                for url in urls {
                    if let Some(info) = match_tab(url, &reattached, &claimed) {
                        claimed.push(info.id);
                        bindings.push((info.id, session.id.clone(), url.clone()));
                    }
                }
            }
        }

        let mut store = self.store.write();
        for (tab, session_id, url) in &bindings {
            if let Err(e) = store.bind_tab(*tab, session_id, now) {
                warn!(tab = %tab, error = %e, "auto-restore bind failed");
                continue;
            }
            if let Some(session) = store.session_mut(session_id) {
                if let Some(urls) = &mut session.persisted_tabs {
                    if let Some(pos) = urls.iter().position(|u| u == url) {
                        urls.remove(pos);
                    }
                    if urls.is_empty() {
                        session.persisted_tabs = None;
                    }
                }
            }
        }
        if !bindings.is_empty() {
            info!(reclaimed = bindings.len(), "auto-restore reattached tabs");
        }
        Ok(())
    }

    /// Restored sessions whose tabs did not come back go dormant; their
    /// persisted URLs stay for manual reopen.
    fn convert_empty_actives(&self, now: i64) {
        let mut store = self.store.write();
        let empty: Vec<String> = store
            .sessions()
            .filter(|s| s.state == SessionState::Active && s.tabs.is_empty())
            .map(|s| s.id.clone())
            .collect();
        for id in empty {
            if let Some(session) = store.session_mut(&id) {
                session.state = SessionState::Dormant;
                session.touch(now);
            }
        }
    }

    /// FREE-tier dormant sessions older than the persistence window are
    /// dropped. Paid tiers keep dormant sessions indefinitely.
    fn expire_dormant_past_window(&self, now: i64) {
        let Some(days) = self.license.features(now).persistence_window_days else {
            return;
        };
        let cutoff = now - i64::from(days) * 24 * 60 * 60 * 1000;
        let mut store = self.store.write();
        let expired: Vec<String> = store
            .sessions()
            .filter(|s| s.state != SessionState::Active && s.last_accessed < cutoff)
            .map(|s| s.id.clone())
            .collect();
        for id in expired {
            if store.delete_session(&id).is_ok() {
                info!(session = %id, "dormant session expired past persistence window");
            }
        }
    }

    /// Hourly cleanup: drop expired cookies everywhere. No structural
    /// changes to sessions.
    pub async fn dormant_cleanup(&self) -> usize {
        let purged = self.store.write().purge_expired_cookies(now_millis());
        if purged > 0 {
            self.persist_debounced().await;
        }
        purged
    }
}

/// First free name in the `name`, `name (2)`, `name (3)` … sequence.
fn dedupe_name(name: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(name) {
        return name.to_owned();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{name} ({n})");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn match_tab<'a>(url: &str, tabs: &'a [TabInfo], claimed: &[TabId]) -> Option<&'a TabInfo> {
    let wanted = Url::parse(url).ok()?;
    tabs.iter().find(|info| {
        if claimed.contains(&info.id) {
            return false;
        }
        let Some(candidate) = info.url.as_deref().and_then(|u| Url::parse(u).ok()) else {
            return false;
        };
        candidate.host_str() == wanted.host_str() && candidate.path() == wanted.path()
    })
}
