//! Periodic task scheduling on host recurring timers.
//!
//! Every task is idempotent and safe to skip across long host
//! suspensions; missed ticks are skipped, never replayed in a burst.

use std::sync::Arc;

use tokio::{task::JoinHandle, time};
use tracing::{debug, info, warn};

use crate::{
    capture::CookieChangeCapturer,
    config::SchedulerConfig,
    license::LicenseController,
    persist::PersistenceManager,
    sessions::SessionLifecycleManager,
    store::SharedStore,
    utils::now_millis,
};

pub struct Scheduler {
    cfg: SchedulerConfig,
    store: SharedStore,
    capturer: Arc<CookieChangeCapturer>,
    license: Arc<LicenseController>,
    sessions: Arc<SessionLifecycleManager>,
    persistence: PersistenceManager,
}

/// Keep this guard alive while the engine runs; dropping it stops every
/// periodic task.
pub struct SchedulerGuard {
    handles: Vec<JoinHandle<()>>,
}

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn interval_skipping(secs: u64) -> time::Interval {
    let mut interval = time::interval(std::time::Duration::from_secs(secs.max(1)));
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    interval
}

impl Scheduler {
    pub fn new(
        cfg: SchedulerConfig,
        store: SharedStore,
        capturer: Arc<CookieChangeCapturer>,
        license: Arc<LicenseController>,
        sessions: Arc<SessionLifecycleManager>,
        persistence: PersistenceManager,
    ) -> Self {
        Self {
            cfg,
            store,
            capturer,
            license,
            sessions,
            persistence,
        }
    }

    pub fn start(self) -> SchedulerGuard {
        let mut handles = Vec::new();

        // cookie-leak sweeper
        let capturer = self.capturer.clone();
        let sweep_secs = self.cfg.sweeper_interval_secs;
        handles.push(tokio::spawn(async move {
            let mut tick = interval_skipping(sweep_secs);
            loop {
                tick.tick().await;
                match capturer.sweep().await {
                    Ok(0) => {}
                    Ok(n) => info!(swept = n, "cookie sweeper removed host-jar leaks"),
                    Err(e) => warn!(error = %e, "cookie sweep failed"),
                }
            }
        }));

        // license check
        let license = self.license.clone();
        let license_secs = self.cfg.license_check_interval_secs;
        handles.push(tokio::spawn(async move {
            let mut tick = interval_skipping(license_secs);
            loop {
                tick.tick().await;
                if let Err(e) = license.validate_if_due(now_millis()).await {
                    warn!(error = %e, "periodic license validation failed");
                }
            }
        }));

        // dormant cleanup: expired cookies only, no structural changes
        let sessions = self.sessions.clone();
        let cleanup_secs = self.cfg.dormant_cleanup_interval_secs;
        handles.push(tokio::spawn(async move {
            let mut tick = interval_skipping(cleanup_secs);
            loop {
                tick.tick().await;
                let purged = sessions.dormant_cleanup().await;
                if purged > 0 {
                    debug!(purged, "dormant cleanup dropped expired cookies");
                }
            }
        }));

        // keep-alive: persist dirty state and log engine stats
        let sessions = self.sessions.clone();
        let persistence = self.persistence.clone();
        let store = self.store.clone();
        let keepalive_secs = self.cfg.keepalive_interval_secs;
        handles.push(tokio::spawn(async move {
            let mut tick = interval_skipping(keepalive_secs);
            loop {
                tick.tick().await;
                if let Err(e) = sessions.refresh_persisted_tabs().await {
                    warn!(error = %e, "keep-alive tab snapshot failed");
                }
                if let Err(e) = persistence.flush_pending().await {
                    warn!(error = %e, "keep-alive flush failed");
                }
                store.write().prune_domain_activity(now_millis(), 30_000);
                let stats = store.read().stats();
                let persisted_keys = persistence.persisted_key_count().await;
                debug!(
                    sessions = stats.sessions,
                    active = stats.active,
                    dormant = stats.dormant,
                    tabs = stats.tabs,
                    cookies = stats.cookies,
                    persisted_keys,
                    "engine keep-alive"
                );
            }
        }));

        SchedulerGuard { handles }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::cookie::Cookie;
    use crate::host::{MemoryHostJar, MemoryTabHost};
    use crate::license::LicenseClient;
    use crate::persist::{MemoryDocumentStore, MemoryLayer};
    use crate::store::StateStore;
    use parking_lot::RwLock;

    #[tokio::test]
    async fn sweeper_clears_leaks_on_its_own() {
        let store: SharedStore = Arc::new(RwLock::new(StateStore::new()));
        let jar = MemoryHostJar::new();
        let tabs = MemoryTabHost::new();
        let persistence = PersistenceManager::new(
            Arc::new(MemoryLayer::new()),
            Arc::new(MemoryLayer::new()),
            Arc::new(MemoryDocumentStore::new()),
            std::time::Duration::from_millis(10),
        );
        let cfg = EngineConfig::default();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let license = Arc::new(LicenseController::new(
            Arc::new(LicenseClient::new(cfg.license.clone()).unwrap()),
            persistence.clone(),
            cfg.license.clone(),
            "test".into(),
            tx,
        ));
        let sessions = Arc::new(SessionLifecycleManager::new(
            store.clone(),
            persistence.clone(),
            license.clone(),
            Arc::new(tabs.clone()),
            cfg,
        ));
        let capturer = Arc::new(CookieChangeCapturer::new(
            store.clone(),
            Arc::new(jar.clone()),
            Arc::new(tabs.clone()),
        ));

        let session = store.write().create_session(None, None, 0).unwrap();
        let tab = tabs.spawn_tab(Some("https://example.test/"), None);
        store.write().bind_tab(tab, &session, 0).unwrap();
        jar.insert(Cookie::new_host_only("leak", "1", "example.test"));

        let scheduler = Scheduler::new(
            SchedulerConfig {
                sweeper_interval_secs: 1,
                license_check_interval_secs: 3_600,
                dormant_cleanup_interval_secs: 3_600,
                keepalive_interval_secs: 1,
            },
            store,
            capturer,
            license,
            sessions,
            persistence,
        );
        let guard = scheduler.start();
        tokio::time::sleep(std::time::Duration::from_millis(1_300)).await;
        assert!(jar.is_empty());
        drop(guard);
    }
}
