//! Typed request/response surface for UI pages and content scripts.
//!
//! Requests are a tagged sum over the `action` discriminator; an unknown
//! action is a hard `InvalidInput`. Every response carries
//! `success: bool`; failures add `error`, an optional `errorCode`, and
//! `requiresUpgrade` + `tier` when the UI should render an upgrade
//! prompt.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{
    engine::Engine,
    export::ExportDocument,
    host::TabId,
    store::SessionState,
    utils::now_millis,
    Error, Result,
};

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    CreateNewSession {
        #[serde(default)]
        name: Option<String>,
    },
    GetActiveSessions,
    #[serde(rename_all = "camelCase")]
    GetSessionId { tab_id: i64 },
    #[serde(rename_all = "camelCase")]
    SwitchToTab { tab_id: i64 },
    #[serde(rename_all = "camelCase")]
    SetSessionName {
        session_id: String,
        #[serde(default)]
        name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ExportSession {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ImportSessions {
        document: ExportDocument,
        #[serde(default)]
        password: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    DeleteDormantSession { session_id: String },
    DeleteAllDormantSessions,
    GetTier,
    GetFeatures,
    #[serde(rename_all = "camelCase")]
    HasFeature { feature: String },
    #[serde(rename_all = "camelCase")]
    ActivateLicense { key: String },
    DeactivateLicense,
    GetLicenseStatus,
    CanCreateSession,
    GetSessionStatus,
    GetAutoRestorePreference,
    #[serde(rename_all = "camelCase")]
    SetAutoRestorePreference { enabled: bool },
    CheckForUpdates,
    GetInitializationState,
}

pub struct MessageRouter {
    engine: Arc<Engine>,
}

impl MessageRouter {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Entry point for raw JSON messages from the host's message
    /// channel. The response channel stays open until this future
    /// resolves; callers reply with the returned value.
    pub async fn dispatch_value(&self, raw: Value) -> Value {
        match serde_json::from_value::<Request>(raw) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => failure(&Error::InvalidInput(format!(
                "unknown or malformed action: {e}"
            ))),
        }
    }

    pub async fn dispatch(&self, request: Request) -> Value {
        debug!(?request, "dispatching message");
        respond(self.handle(request).await)
    }

    async fn handle(&self, request: Request) -> Result<Value> {
        let engine = &self.engine;
        match request {
            Request::CreateNewSession { name } => {
                let session_id = engine.sessions().create_session(name).await?;
                Ok(json!({ "sessionId": session_id }))
            }
            Request::GetActiveSessions => {
                let sessions: Vec<_> = engine
                    .store()
                    .read()
                    .sessions()
                    .filter(|s| s.state == SessionState::Active)
                    .cloned()
                    .collect();
                Ok(json!({ "sessions": sessions }))
            }
            Request::GetSessionId { tab_id } => {
                let session_id = engine
                    .store()
                    .read()
                    .session_for_tab(TabId(tab_id))
                    .map(str::to_owned);
                Ok(json!({ "sessionId": session_id }))
            }
            Request::SwitchToTab { tab_id } => {
                engine.tabs().switch_to(TabId(tab_id)).await?;
                Ok(json!({}))
            }
            Request::SetSessionName { session_id, name } => {
                engine.sessions().set_name(&session_id, name).await?;
                Ok(json!({}))
            }
            Request::ExportSession { session_id, password } => {
                let document = engine
                    .sessions()
                    .export(session_id.as_deref(), password.as_deref())
                    .await?;
                Ok(json!({ "document": document }))
            }
            Request::ImportSessions { document, password } => {
                let report = engine
                    .sessions()
                    .import(&document, password.as_deref())
                    .await?;
                Ok(serde_json::to_value(report)?)
            }
            Request::DeleteDormantSession { session_id } => {
                let state = engine
                    .store()
                    .read()
                    .session(&session_id)
                    .map(|s| s.state)
                    .ok_or_else(|| Error::UnknownSession(session_id.clone()))?;
                if state == SessionState::Active {
                    return Err(Error::InvalidInput(format!(
                        "session {session_id} is open, not dormant"
                    )));
                }
                engine.sessions().delete_session(&session_id).await?;
                Ok(json!({}))
            }
            Request::DeleteAllDormantSessions => {
                let report = engine.sessions().delete_all_dormant().await;
                Ok(serde_json::to_value(report)?)
            }
            Request::GetTier => Ok(json!({ "tier": engine.license().tier(now_millis()) })),
            Request::GetFeatures => {
                Ok(json!({ "features": engine.license().features(now_millis()) }))
            }
            Request::HasFeature { feature } => {
                let enabled = engine.license().features(now_millis()).has(&feature);
                Ok(json!({ "feature": feature, "enabled": enabled }))
            }
            Request::ActivateLicense { key } => {
                let tier = engine.license().activate(&key, now_millis()).await?;
                Ok(json!({ "tier": tier }))
            }
            Request::DeactivateLicense => {
                engine.license().deactivate().await?;
                Ok(json!({}))
            }
            Request::GetLicenseStatus => Ok(serde_json::to_value(
                engine.license().status_view(now_millis()),
            )?),
            Request::CanCreateSession => Ok(serde_json::to_value(engine.sessions().can_create())?),
            Request::GetSessionStatus => Ok(json!({ "sessions": engine.session_status() })),
            Request::GetAutoRestorePreference => {
                Ok(json!({ "enabled": engine.sessions().auto_restore_enabled().await }))
            }
            Request::SetAutoRestorePreference { enabled } => {
                engine.sessions().set_auto_restore(enabled).await?;
                Ok(json!({}))
            }
            Request::CheckForUpdates => {
                let version = env!("CARGO_PKG_VERSION");
                let update = engine.license().check_for_updates(version).await?;
                Ok(json!({ "update": update }))
            }
            Request::GetInitializationState => Ok(json!({ "state": engine.phase() })),
        }
    }
}

fn respond(result: Result<Value>) -> Value {
    match result {
        Ok(fields) => {
            let mut map = match fields {
                Value::Object(map) => map,
                other => {
                    let mut map = Map::new();
                    if !other.is_null() {
                        map.insert("result".into(), other);
                    }
                    map
                }
            };
            map.insert("success".into(), Value::Bool(true));
            Value::Object(map)
        }
        Err(e) => failure(&e),
    }
}

fn failure(e: &Error) -> Value {
    let mut map = Map::new();
    map.insert("success".into(), Value::Bool(false));
    map.insert("error".into(), Value::String(e.to_string()));
    if let Some(code) = e.code() {
        map.insert("errorCode".into(), json!(code));
    }
    if e.requires_upgrade() {
        map.insert("requiresUpgrade".into(), Value::Bool(true));
        if let Error::LimitExceeded { tier, .. } | Error::TierRestricted { tier, .. } = e {
            map.insert("tier".into(), json!(tier));
        }
    }
    Value::Object(map)
}
