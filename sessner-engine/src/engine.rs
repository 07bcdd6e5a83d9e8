//! The engine value owned by the process entry point.
//!
//! Components hold shared handles to the single-writer state store; all
//! orchestration flows through the lifecycle managers. Startup runs
//! restore → STARTUP_GRACE → READY with exactly one reconciliation pass,
//! so restored sessions are not structurally cleaned up before the host
//! has had a chance to reattach their tabs.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{info, warn};

use crate::{
    capture::CookieChangeCapturer,
    config::EngineConfig,
    host::{HostCookieJar, TabHost},
    intercept::HttpInterceptor,
    license::{LicenseApi, LicenseClient, LicenseController, LicenseEvent},
    persist::{DocumentStore, KeyValueLayer, PersistenceManager},
    scheduler::{Scheduler, SchedulerGuard},
    sessions::SessionLifecycleManager,
    shim::CookieShimBridge,
    store::{SessionState, SharedStore, StateStore},
    utils::now_millis,
    Result,
};

/// Initialization phase, reported through `getInitializationState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnginePhase {
    StartupGrace,
    Ready,
}

/// Host-provided backends the engine runs against.
pub struct EngineHosts {
    pub ephemeral: Arc<dyn KeyValueLayer>,
    pub durable: Arc<dyn KeyValueLayer>,
    pub documents: Arc<dyn DocumentStore>,
    pub cookie_jar: Arc<dyn HostCookieJar>,
    pub tabs: Arc<dyn TabHost>,
    /// Override for tests; `None` builds the real wire client.
    pub license_api: Option<Arc<dyn LicenseApi>>,
    pub user_agent: String,
}

/// Per-session summary for the UI (`getSessionStatus`).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusView {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub color: String,
    pub state: SessionState,
    pub tab_count: usize,
    pub cookie_count: usize,
    pub created_at: i64,
    pub last_accessed: i64,
    pub persisted_tab_count: usize,
}

pub struct Engine {
    cfg: EngineConfig,
    store: SharedStore,
    persistence: PersistenceManager,
    license: Arc<LicenseController>,
    sessions: Arc<SessionLifecycleManager>,
    tabs: Arc<crate::tabs::TabLifecycleManager>,
    interceptor: HttpInterceptor,
    capturer: Arc<CookieChangeCapturer>,
    shim: CookieShimBridge,
    phase: RwLock<EnginePhase>,
    scheduler_guard: Mutex<Option<SchedulerGuard>>,
}

impl Engine {
    /// Build and start the engine: restore persisted state, enter the
    /// startup grace window, schedule reconciliation and the periodic
    /// tasks. Returns the engine and the license/UI event stream.
    pub async fn init(
        cfg: EngineConfig,
        hosts: EngineHosts,
    ) -> Result<(Arc<Self>, UnboundedReceiver<LicenseEvent>)> {
        let persistence = PersistenceManager::new(
            hosts.ephemeral,
            hosts.durable,
            hosts.documents,
            std::time::Duration::from_millis(cfg.persistence.debounce_millis),
        );

        let store: SharedStore = Arc::new(RwLock::new(StateStore::new()));
        if let Some((snapshot, source)) = persistence.restore().await? {
            let dropped = store.write().restore(snapshot);
            if dropped > 0 {
                warn!(dropped, "dropped tab bindings pointing at missing sessions");
            }
            // tab handles are reused by the host; stale bindings are
            // cleared and rebuilt by reconciliation
            store.write().clear_tab_bindings();
            info!(?source, "engine state restored");
        }

        let (events_tx, events_rx) = unbounded_channel();
        let api: Arc<dyn LicenseApi> = match hosts.license_api {
            Some(api) => api,
            None => Arc::new(LicenseClient::new(cfg.license.clone())?),
        };
        let license = Arc::new(LicenseController::new(
            api,
            persistence.clone(),
            cfg.license.clone(),
            hosts.user_agent,
            events_tx,
        ));
        license.init().await?;

        let sessions = Arc::new(SessionLifecycleManager::new(
            store.clone(),
            persistence.clone(),
            license.clone(),
            hosts.tabs.clone(),
            cfg.clone(),
        ));
        let tabs = Arc::new(crate::tabs::TabLifecycleManager::new(
            store.clone(),
            hosts.tabs.clone(),
            sessions.clone(),
            cfg.recent_domain_window_millis,
        ));
        let capturer = Arc::new(CookieChangeCapturer::new(
            store.clone(),
            hosts.cookie_jar,
            hosts.tabs.clone(),
        ));
        let interceptor = HttpInterceptor::new(store.clone());
        let shim = CookieShimBridge::new(store.clone(), hosts.tabs);

        let engine = Arc::new(Self {
            store: store.clone(),
            persistence: persistence.clone(),
            license: license.clone(),
            sessions: sessions.clone(),
            tabs,
            interceptor,
            capturer: capturer.clone(),
            shim,
            phase: RwLock::new(EnginePhase::StartupGrace),
            cfg: cfg.clone(),
            scheduler_guard: Mutex::new(None),
        });

        // grace window, then exactly one reconciliation pass
        let grace = std::time::Duration::from_secs(cfg.persistence.startup_grace_secs);
        let reconciler = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(e) = reconciler.sessions.reconcile_startup().await {
                warn!(error = %e, "startup reconciliation failed");
            }
            if let Err(e) = reconciler.tabs.forget_stale_handles().await {
                warn!(error = %e, "stale handle cleanup failed");
            }
            *reconciler.phase.write() = EnginePhase::Ready;
            info!("engine ready");
        });

        let guard = Scheduler::new(
            cfg.scheduler.clone(),
            store,
            capturer,
            license,
            sessions,
            persistence,
        )
        .start();
        *engine.scheduler_guard.lock() = Some(guard);

        Ok((engine, events_rx))
    }

    pub fn phase(&self) -> EnginePhase {
        *self.phase.read()
    }

    /// Force the grace window shut (tests and explicit host signals).
    pub async fn finish_startup(&self) -> Result<()> {
        if *self.phase.read() == EnginePhase::Ready {
            return Ok(());
        }
        self.sessions.reconcile_startup().await?;
        self.tabs.forget_stale_handles().await?;
        *self.phase.write() = EnginePhase::Ready;
        Ok(())
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn persistence(&self) -> &PersistenceManager {
        &self.persistence
    }

    pub fn license(&self) -> &Arc<LicenseController> {
        &self.license
    }

    pub fn sessions(&self) -> &Arc<SessionLifecycleManager> {
        &self.sessions
    }

    pub fn tabs(&self) -> &Arc<crate::tabs::TabLifecycleManager> {
        &self.tabs
    }

    pub fn interceptor(&self) -> &HttpInterceptor {
        &self.interceptor
    }

    pub fn capturer(&self) -> &Arc<CookieChangeCapturer> {
        &self.capturer
    }

    pub fn shim(&self) -> &CookieShimBridge {
        &self.shim
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn session_status(&self) -> Vec<SessionStatusView> {
        let store = self.store.read();
        let mut out: Vec<_> = store
            .sessions()
            .map(|s| SessionStatusView {
                id: s.id.clone(),
                name: s.name.clone(),
                color: s.color.clone(),
                state: s.state,
                tab_count: s.tabs.len(),
                cookie_count: store.jar(&s.id).map(|j| j.len()).unwrap_or(0),
                created_at: s.created_at,
                last_accessed: s.last_accessed,
                persisted_tab_count: s.persisted_tabs.as_ref().map(Vec::len).unwrap_or(0),
            })
            .collect();
        out.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        out
    }

    /// Flush dirty state on an orderly shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        if let Err(e) = self.sessions.refresh_persisted_tabs().await {
            warn!(error = %e, "tab snapshot on shutdown failed");
        }
        let snapshot = self.store.read().snapshot();
        self.persistence.save_now(&snapshot).await?;
        self.scheduler_guard.lock().take();
        info!(at = now_millis(), "engine stopped");
        Ok(())
    }
}
