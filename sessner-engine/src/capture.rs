//! Cookie-change capture: the late-binding backstop.
//!
//! Catches cookies that enter the host jar through any path the header
//! interceptor does not cover (script SDKs, redirects during gaps). The
//! host already accepted the cookie, so no domain validation happens
//! here; it is routed to every session whose bound tabs are on a
//! matching host, then deleted from the host jar.

use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};
use url::Url;

use crate::{
    cookie::{host_matches_domain, Cookie},
    host::{HostCookieJar, TabHost},
    store::SharedStore,
    utils::now_millis,
    Result,
};

const DELETE_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct CookieChangeCapturer {
    store: SharedStore,
    host_jar: Arc<dyn HostCookieJar>,
    tabs: Arc<dyn TabHost>,
}

impl CookieChangeCapturer {
    pub fn new(store: SharedStore, host_jar: Arc<dyn HostCookieJar>, tabs: Arc<dyn TabHost>) -> Self {
        Self { store, host_jar, tabs }
    }

    /// Handle one host-jar change event. Deletions are ignored; the jar
    /// shrinking is never a leak. Returns the sessions that captured the
    /// cookie.
    pub async fn on_cookie_changed(&self, cookie: Cookie, removed: bool) -> Result<Vec<String>> {
        if removed {
            return Ok(Vec::new());
        }
        let now = now_millis();
        let targets = self.sessions_on_matching_hosts(&cookie).await?;
        {
            let mut store = self.store.write();
            for session_id in &targets {
                if let Err(e) = store.store_cookie(session_id, cookie.clone(), now) {
                    warn!(session = %session_id, error = %e, "capture routing failed");
                }
            }
        }
        if !targets.is_empty() {
            debug!(cookie = %cookie.name, sessions = targets.len(), "host-jar cookie captured");
        }
        self.delete_with_retry(&cookie).await;
        Ok(targets)
    }

    /// Sessions with at least one live bound tab whose current URL host
    /// matches the cookie's domain in the RFC 6265 sense.
    async fn sessions_on_matching_hosts(&self, cookie: &Cookie) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for info in self.tabs.list_tabs().await? {
            let Some(host) = info
                .url
                .as_deref()
                .and_then(|u| Url::parse(u).ok())
                .and_then(|u| u.host_str().map(str::to_owned))
            else {
                continue;
            };
            if !host_matches_domain(&cookie.domain, &host) {
                continue;
            }
            let store = self.store.read();
            if let Some(session_id) = store.session_for_tab(info.id) {
                if !out.iter().any(|s| s == session_id) {
                    out.push(session_id.to_owned());
                }
            }
        }
        Ok(out)
    }

    /// Delete from the host jar; on failure retry once after 100 ms and
    /// otherwise leave the cookie to the sweeper.
    async fn delete_with_retry(&self, cookie: &Cookie) {
        match self
            .host_jar
            .remove_cookie(&cookie.domain, &cookie.path, &cookie.name)
            .await
        {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => warn!(cookie = %cookie.name, error = %e, "host-jar delete failed"),
        }
        tokio::time::sleep(DELETE_RETRY_DELAY).await;
        match self
            .host_jar
            .remove_cookie(&cookie.domain, &cookie.path, &cookie.name)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(cookie = %cookie.name, "host-jar delete retry missed, sweeper will catch it"),
            Err(e) => warn!(cookie = %cookie.name, error = %e, "host-jar delete retry failed"),
        }
    }

    /// The sweeper pass: enumerate host-jar cookies for every bound
    /// tab's current host and delete them. The session store stays the
    /// sole durable source. Returns the number deleted.
    pub async fn sweep(&self) -> Result<usize> {
        let mut hosts = Vec::new();
        for info in self.tabs.list_tabs().await? {
            let bound = self.store.read().session_for_tab(info.id).is_some();
            if !bound {
                continue;
            }
            if let Some(host) = info
                .url
                .as_deref()
                .and_then(|u| Url::parse(u).ok())
                .and_then(|u| u.host_str().map(str::to_owned))
            {
                if !hosts.contains(&host) {
                    hosts.push(host);
                }
            }
        }
        let mut deleted = 0;
        for host in hosts {
            for leak in self.host_jar.cookies_for_host(&host).await? {
                if self
                    .host_jar
                    .remove_cookie(&leak.domain, &leak.path, &leak.name)
                    .await?
                {
                    deleted += 1;
                }
            }
        }
        if deleted > 0 {
            debug!(deleted, "sweeper removed leaked host-jar cookies");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MemoryHostJar, MemoryTabHost};
    use crate::store::StateStore;
    use parking_lot::RwLock;

    struct Fixture {
        capturer: CookieChangeCapturer,
        store: SharedStore,
        jar: MemoryHostJar,
        tabs: MemoryTabHost,
    }

    fn fixture() -> Fixture {
        let store: SharedStore = Arc::new(RwLock::new(StateStore::new()));
        let jar = MemoryHostJar::new();
        let tabs = MemoryTabHost::new();
        let capturer = CookieChangeCapturer::new(
            store.clone(),
            Arc::new(jar.clone()),
            Arc::new(tabs.clone()),
        );
        Fixture { capturer, store, jar, tabs }
    }

    #[tokio::test]
    async fn routes_to_sessions_on_matching_hosts_and_deletes() {
        let f = fixture();
        let a = f.store.write().create_session(None, None, 0).unwrap();
        let b = f.store.write().create_session(None, None, 0).unwrap();
        let t1 = f.tabs.spawn_tab(Some("https://app.example.com/x"), None);
        let t2 = f.tabs.spawn_tab(Some("https://other.test/"), None);
        f.store.write().bind_tab(t1, &a, 0).unwrap();
        f.store.write().bind_tab(t2, &b, 0).unwrap();

        let mut leak = Cookie::new_host_only("sdk", "v", ".example.com");
        leak.domain = ".example.com".into();
        f.jar.insert(leak.clone());

        let routed = f.capturer.on_cookie_changed(leak, false).await.unwrap();
        assert_eq!(routed, vec![a.clone()]);
        assert!(f.jar.is_empty());
        assert_eq!(
            f.store
                .read()
                .cookies_for(&a, "app.example.com", "/", 0)
                .unwrap()
                .len(),
            1
        );
        assert!(f.store.read().cookies_for(&b, "other.test", "/", 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn deletion_events_are_ignored() {
        let f = fixture();
        let c = Cookie::new_host_only("x", "1", "example.test");
        let routed = f.capturer.on_cookie_changed(c, true).await.unwrap();
        assert!(routed.is_empty());
    }

    #[tokio::test]
    async fn delete_failure_retries_once() {
        let f = fixture();
        let c = Cookie::new_host_only("x", "1", "example.test");
        f.jar.insert(c.clone());
        f.jar.fail_next_removes(1);
        f.capturer.on_cookie_changed(c, false).await.unwrap();
        assert!(f.jar.is_empty());
    }

    #[tokio::test]
    async fn sweep_clears_bound_hosts_only() {
        let f = fixture();
        let a = f.store.write().create_session(None, None, 0).unwrap();
        let t1 = f.tabs.spawn_tab(Some("https://bound.test/"), None);
        f.store.write().bind_tab(t1, &a, 0).unwrap();
        // an unbound tab's host is not swept
        f.tabs.spawn_tab(Some("https://unbound.test/"), None);

        f.jar.insert(Cookie::new_host_only("a", "1", "bound.test"));
        f.jar.insert(Cookie::new_host_only("b", "2", "unbound.test"));

        let deleted = f.capturer.sweep().await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(f.jar.len(), 1);
    }
}
