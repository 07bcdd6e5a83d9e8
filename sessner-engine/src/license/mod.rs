//! License and tier control.
//!
//! The controller owns the cached license record and derives the
//! effective tier from it: a record validated within the fresh window is
//! trusted, one inside the grace window keeps its tier, and anything
//! older degrades to FREE. Degradation never locks the user out of
//! existing sessions.

mod client;
mod device;
mod features;

pub use client::{
    ApiAck, LicenseApi, LicenseClient, UpdateInfo, ValidateVerdict, VerifyPayload, PRODUCT_NAME,
};
pub use device::{derive_device_id, new_salt};
pub use features::{ExportCapability, FeatureSet, Tier};

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::{
    config::LicenseConfig,
    persist::{PersistenceManager, KEY_DEVICE_ID, KEY_LICENSE, KEY_PENDING_UPDATE},
    Error, Result,
};

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    Active,
    Expired,
    Blocked,
}

/// Cached license record, persisted under `sessner_license`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseRecord {
    pub key: String,
    pub tier: Tier,
    pub status: LicenseStatus,
    pub device_id: String,
    pub last_validated: i64,
    pub features: FeatureSet,
    #[serde(default)]
    downgrade_notified: bool,
}

/// Notifications surfaced to the UI through the engine's event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum LicenseEvent {
    /// Validation could not reach the server but the cached tier still
    /// holds.
    GracePeriod { tier: Tier, last_validated: i64 },
    /// The grace window ran out; the effective tier is FREE now.
    Downgraded { from: Tier },
    /// The server rejected the key; the user should renew.
    Expired { renew_url: String },
    /// A newer build is available.
    UpdateAvailable(UpdateInfo),
}

/// Status view for the UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseStatusView {
    pub tier: Tier,
    pub licensed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<LicenseStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_validated: Option<i64>,
    pub in_grace: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

pub struct LicenseController {
    api: Arc<dyn LicenseApi>,
    persistence: PersistenceManager,
    cfg: LicenseConfig,
    user_agent: String,
    cached: RwLock<Option<LicenseRecord>>,
    device_id: RwLock<Option<String>>,
    events: UnboundedSender<LicenseEvent>,
}

impl LicenseController {
    pub fn new(
        api: Arc<dyn LicenseApi>,
        persistence: PersistenceManager,
        cfg: LicenseConfig,
        user_agent: String,
        events: UnboundedSender<LicenseEvent>,
    ) -> Self {
        Self {
            api,
            persistence,
            cfg,
            user_agent,
            cached: RwLock::new(None),
            device_id: RwLock::new(None),
            events,
        }
    }

    /// Load the persisted device identity and license record.
    pub async fn init(&self) -> Result<()> {
        if let Some(id) = self.persistence.get_value::<String>(KEY_DEVICE_ID).await? {
            *self.device_id.write() = Some(id);
        }
        if let Some(record) = self
            .persistence
            .get_value::<LicenseRecord>(KEY_LICENSE)
            .await?
        {
            *self.cached.write() = Some(record);
        }
        Ok(())
    }

    /// Existing device id, or a freshly derived and persisted one.
    pub async fn ensure_device_id(&self) -> Result<String> {
        if let Some(id) = self.device_id.read().clone() {
            return Ok(id);
        }
        let id = derive_device_id(&self.user_agent, &new_salt());
        self.persistence.put_value(KEY_DEVICE_ID, &id).await?;
        *self.device_id.write() = Some(id.clone());
        Ok(id)
    }

    fn fresh_window(&self) -> i64 {
        self.cfg.fresh_window_days * DAY_MILLIS
    }

    fn grace_window(&self) -> i64 {
        self.cfg.grace_window_days * DAY_MILLIS
    }

    /// Effective tier at `now`, grace policy applied.
    pub fn tier(&self, now: i64) -> Tier {
        let cached = self.cached.read();
        let Some(record) = cached.as_ref() else {
            return Tier::Free;
        };
        if record.status != LicenseStatus::Active {
            return Tier::Free;
        }
        if now - record.last_validated > self.grace_window() {
            return Tier::Free;
        }
        record.tier
    }

    pub fn features(&self, now: i64) -> FeatureSet {
        FeatureSet::for_tier(self.tier(now))
    }

    pub fn status_view(&self, now: i64) -> LicenseStatusView {
        let cached = self.cached.read();
        let tier = match cached.as_ref() {
            Some(r)
                if r.status == LicenseStatus::Active
                    && now - r.last_validated <= self.grace_window() =>
            {
                r.tier
            }
            _ => Tier::Free,
        };
        let in_grace = cached.as_ref().is_some_and(|r| {
            r.status == LicenseStatus::Active
                && now - r.last_validated > self.fresh_window()
                && now - r.last_validated <= self.grace_window()
        });
        LicenseStatusView {
            tier,
            licensed: cached.is_some(),
            status: cached.as_ref().map(|r| r.status),
            last_validated: cached.as_ref().map(|r| r.last_validated),
            in_grace,
            device_id: self.device_id.read().clone(),
        }
    }

    /// Activation: ensure a device identity, bind it to the key, pull the
    /// full record and cache the computed tier.
    pub async fn activate(&self, key: &str, now: i64) -> Result<Tier> {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::InvalidInput("license key is empty".into()));
        }
        let device_id = self.ensure_device_id().await?;
        self.api.register_device(&device_id, key).await?;
        let payload = self.api.verify(key).await?;
        if payload.item_reference != PRODUCT_NAME {
            return Err(Error::ValidationFailure(format!(
                "license is for {:?}, not {PRODUCT_NAME}",
                payload.item_reference
            )));
        }
        let status = match payload.status.to_ascii_lowercase().as_str() {
            "blocked" => LicenseStatus::Blocked,
            "expired" => LicenseStatus::Expired,
            _ => LicenseStatus::Active,
        };
        let tier = Tier::from_limits(payload.max_allowed_devices, payload.max_allowed_domains);
        let record = LicenseRecord {
            key: key.to_owned(),
            tier,
            status,
            device_id,
            last_validated: now,
            features: FeatureSet::for_tier(tier),
            downgrade_notified: false,
        };
        self.persistence.put_value(KEY_LICENSE, &record).await?;
        info!(%tier, "license activated");
        *self.cached.write() = Some(record);
        Ok(tier)
    }

    /// Periodic validation, driven by the scheduler every 24 hours.
    /// Skips while the record is inside the fresh window.
    pub async fn validate_if_due(&self, now: i64) -> Result<()> {
        let Some(record) = self.cached.read().clone() else {
            return Ok(());
        };
        if record.status != LicenseStatus::Active {
            return Ok(());
        }
        if now - record.last_validated < self.fresh_window() {
            return Ok(());
        }
        match self.api.validate(&record.key).await {
            Ok(ValidateVerdict::Valid) => {
                let mut updated = record;
                updated.last_validated = now;
                updated.downgrade_notified = false;
                self.persistence.put_value(KEY_LICENSE, &updated).await?;
                *self.cached.write() = Some(updated);
            }
            Ok(ValidateVerdict::Invalid) => {
                let mut updated = record;
                updated.status = LicenseStatus::Expired;
                self.persistence.put_value(KEY_LICENSE, &updated).await?;
                *self.cached.write() = Some(updated);
                let _ = self.events.send(LicenseEvent::Expired {
                    renew_url: self.cfg.base_url.clone(),
                });
            }
            Err(e) => {
                let age = now - record.last_validated;
                if age <= self.grace_window() {
                    warn!(error = %e, "license validation unreachable, trusting cached tier");
                    let _ = self.events.send(LicenseEvent::GracePeriod {
                        tier: record.tier,
                        last_validated: record.last_validated,
                    });
                } else if !record.downgrade_notified {
                    warn!(error = %e, "grace window exhausted, degrading to FREE");
                    let mut updated = record;
                    updated.downgrade_notified = true;
                    let from = updated.tier;
                    self.persistence.put_value(KEY_LICENSE, &updated).await?;
                    *self.cached.write() = Some(updated);
                    let _ = self.events.send(LicenseEvent::Downgraded { from });
                }
            }
        }
        Ok(())
    }

    /// Unbind the device and purge the cached record. The purge happens
    /// even when the server is unreachable so the user is never stuck
    /// licensed-but-broken.
    pub async fn deactivate(&self) -> Result<()> {
        let record = self.cached.read().clone();
        if let Some(record) = record {
            if let Err(e) = self
                .api
                .unregister_device(&record.device_id, &record.key)
                .await
            {
                warn!(error = %e, "device unregister failed, purging local record anyway");
            }
        }
        self.persistence.delete_value(KEY_LICENSE).await?;
        *self.cached.write() = None;
        Ok(())
    }

    /// Query the changelog endpoint; persist and announce a pending
    /// update when the advertised version is newer than `current`.
    pub async fn check_for_updates(&self, current: &str) -> Result<Option<UpdateInfo>> {
        let info = self.api.changelog().await?;
        if !version_newer(&info.version, current) {
            return Ok(None);
        }
        self.persistence.put_value(KEY_PENDING_UPDATE, &info).await?;
        let _ = self.events.send(LicenseEvent::UpdateAvailable(info.clone()));
        Ok(Some(info))
    }
}

/// Dotted numeric version comparison; missing components count as zero.
fn version_newer(candidate: &str, current: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|c| c.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(candidate), parse(current));
    let len = a.len().max(b.len());
    for i in 0..len {
        let (x, y) = (a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0));
        if x != y {
            return x > y;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{MemoryDocumentStore, MemoryLayer};
    use parking_lot::Mutex;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct StubApi {
        verify: VerifyPayload,
        validate: Mutex<Vec<Result<ValidateVerdict>>>,
    }

    impl StubApi {
        fn premium() -> Self {
            Self {
                verify: VerifyPayload {
                    status: "active".into(),
                    item_reference: PRODUCT_NAME.into(),
                    max_allowed_domains: 10,
                    max_allowed_devices: 1,
                    email: None,
                },
                validate: Mutex::new(Vec::new()),
            }
        }

        fn queue_validate(&self, r: Result<ValidateVerdict>) {
            self.validate.lock().push(r);
        }
    }

    #[async_trait::async_trait]
    impl LicenseApi for StubApi {
        async fn register_device(&self, _device_id: &str, _key: &str) -> Result<ApiAck> {
            Ok(ApiAck {
                result: "success".into(),
                message: String::new(),
                code: None,
            })
        }

        async fn unregister_device(&self, _device_id: &str, _key: &str) -> Result<ApiAck> {
            Ok(ApiAck {
                result: "success".into(),
                message: String::new(),
                code: None,
            })
        }

        async fn verify(&self, _key: &str) -> Result<VerifyPayload> {
            Ok(self.verify.clone())
        }

        async fn validate(&self, _key: &str) -> Result<ValidateVerdict> {
            self.validate
                .lock()
                .pop()
                .unwrap_or(Ok(ValidateVerdict::Valid))
        }

        async fn changelog(&self) -> Result<UpdateInfo> {
            Ok(UpdateInfo {
                version: "2.1.0".into(),
                url: "https://prod.merafsolutions.com/sessner-2.1.0.zip".into(),
                changelog: String::new(),
            })
        }
    }

    fn controller(api: Arc<StubApi>) -> (LicenseController, UnboundedReceiver<LicenseEvent>) {
        let persistence = PersistenceManager::new(
            Arc::new(MemoryLayer::new()),
            Arc::new(MemoryLayer::new()),
            Arc::new(MemoryDocumentStore::new()),
            std::time::Duration::from_millis(10),
        );
        let (tx, rx) = unbounded_channel();
        let controller = LicenseController::new(
            api,
            persistence,
            LicenseConfig::default(),
            "Mozilla/5.0 test".into(),
            tx,
        );
        (controller, rx)
    }

    #[tokio::test]
    async fn activation_computes_tier_and_persists() {
        let (c, _rx) = controller(Arc::new(StubApi::premium()));
        let tier = c.activate("KEY-1", 1_000).await.unwrap();
        assert_eq!(tier, Tier::Premium);
        assert_eq!(c.tier(1_000), Tier::Premium);
        assert!(c.status_view(1_000).licensed);

        // the record survives a fresh controller over the same persistence
        let persisted = c
            .persistence
            .get_value::<LicenseRecord>(KEY_LICENSE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.tier, Tier::Premium);
    }

    #[tokio::test]
    async fn wrong_product_fails_activation() {
        let mut api = StubApi::premium();
        api.verify.item_reference = "OtherProduct".into();
        let (c, _rx) = controller(Arc::new(api));
        assert!(matches!(
            c.activate("KEY-1", 0).await.unwrap_err(),
            Error::ValidationFailure(_)
        ));
        assert_eq!(c.tier(0), Tier::Free);
    }

    #[tokio::test]
    async fn grace_then_downgrade_timeline() {
        let api = Arc::new(StubApi::premium());
        let (c, mut rx) = controller(api.clone());
        let t0 = 0;
        c.activate("KEY-1", t0).await.unwrap();

        // day 8: network error — tier holds, grace announced
        api.queue_validate(Err(Error::NetworkTimeout("down".into())));
        c.validate_if_due(t0 + 8 * DAY_MILLIS).await.unwrap();
        assert_eq!(c.tier(t0 + 8 * DAY_MILLIS), Tier::Premium);
        assert!(matches!(
            rx.try_recv().unwrap(),
            LicenseEvent::GracePeriod { tier: Tier::Premium, .. }
        ));

        // day 31: still failing — FREE now, one downgrade notice
        api.queue_validate(Err(Error::NetworkTimeout("down".into())));
        c.validate_if_due(t0 + 31 * DAY_MILLIS).await.unwrap();
        assert_eq!(c.tier(t0 + 31 * DAY_MILLIS), Tier::Free);
        assert!(matches!(
            rx.try_recv().unwrap(),
            LicenseEvent::Downgraded { from: Tier::Premium }
        ));

        // repeated failures stay silent
        api.queue_validate(Err(Error::NetworkTimeout("down".into())));
        c.validate_if_due(t0 + 32 * DAY_MILLIS).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_verdict_expires_the_license() {
        let api = Arc::new(StubApi::premium());
        let (c, mut rx) = controller(api.clone());
        c.activate("KEY-1", 0).await.unwrap();

        api.queue_validate(Ok(ValidateVerdict::Invalid));
        c.validate_if_due(8 * DAY_MILLIS).await.unwrap();
        assert_eq!(c.tier(8 * DAY_MILLIS), Tier::Free);
        assert!(matches!(rx.try_recv().unwrap(), LicenseEvent::Expired { .. }));
    }

    #[tokio::test]
    async fn fresh_record_skips_validation() {
        let api = Arc::new(StubApi::premium());
        let (c, _rx) = controller(api.clone());
        c.activate("KEY-1", 0).await.unwrap();
        // a queued failure must not even be consulted inside the window
        api.queue_validate(Err(Error::NetworkTimeout("down".into())));
        c.validate_if_due(3 * DAY_MILLIS).await.unwrap();
        assert_eq!(api.validate.lock().len(), 1);
    }

    #[tokio::test]
    async fn successful_validation_refreshes_the_window() {
        let api = Arc::new(StubApi::premium());
        let (c, _rx) = controller(api.clone());
        c.activate("KEY-1", 0).await.unwrap();
        api.queue_validate(Ok(ValidateVerdict::Valid));
        c.validate_if_due(10 * DAY_MILLIS).await.unwrap();
        // 25 further days without contact is still inside grace
        assert_eq!(c.tier(35 * DAY_MILLIS), Tier::Premium);
    }

    #[tokio::test]
    async fn deactivate_purges_even_without_server() {
        let (c, _rx) = controller(Arc::new(StubApi::premium()));
        c.activate("KEY-1", 0).await.unwrap();
        c.deactivate().await.unwrap();
        assert_eq!(c.tier(0), Tier::Free);
        assert!(c
            .persistence
            .get_value::<LicenseRecord>(KEY_LICENSE)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn device_id_is_minted_once() {
        let (c, _rx) = controller(Arc::new(StubApi::premium()));
        let a = c.ensure_device_id().await.unwrap();
        let b = c.ensure_device_id().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 22);
    }

    #[tokio::test]
    async fn update_check_persists_pending_update() {
        let (c, mut rx) = controller(Arc::new(StubApi::premium()));
        let info = c.check_for_updates("2.0.0").await.unwrap().unwrap();
        assert_eq!(info.version, "2.1.0");
        assert!(matches!(rx.try_recv().unwrap(), LicenseEvent::UpdateAvailable(_)));
        assert!(c.check_for_updates("2.1.0").await.unwrap().is_none());
        assert!(c.check_for_updates("3.0").await.unwrap().is_none());
    }

    #[test]
    fn version_comparison() {
        assert!(version_newer("2.1.0", "2.0.9"));
        assert!(version_newer("2.0.10", "2.0.9"));
        assert!(!version_newer("2.0.0", "2.0.0"));
        assert!(!version_newer("1.9", "2.0"));
        assert!(version_newer("2.0.0.1", "2.0.0"));
    }
}
