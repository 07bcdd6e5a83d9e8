//! Wire client for the license server.
//!
//! All endpoints are GET. Calls carry a 10 second timeout and retry up to
//! three times with 1 s / 3 s / 10 s backoff on transport errors; an
//! application-level rejection is never retried.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use serde_with::{serde_as, PickFirst};
use tracing::{debug, warn};
use url::Url;

use crate::{config::LicenseConfig, Error, Result};

pub const PRODUCT_NAME: &str = "Sessner";

const BACKOFF_SECS: [u64; 3] = [1, 3, 10];

/// Acknowledgement body shared by register/unregister.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiAck {
    pub result: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<i64>,
}

/// Full license record returned by `verify`.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyPayload {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub item_reference: String,
    #[serde_as(as = "PickFirst<(_, serde_with::DisplayFromStr)>")]
    #[serde(default)]
    pub max_allowed_domains: i64,
    #[serde_as(as = "PickFirst<(_, serde_with::DisplayFromStr)>")]
    #[serde(default)]
    pub max_allowed_devices: i64,
    #[serde(default)]
    pub email: Option<String>,
}

/// Outcome of the periodic liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateVerdict {
    Valid,
    Invalid,
}

/// Update metadata from the changelog endpoint, post-validation.
#[derive(Debug, Clone, Deserialize, serde::Serialize, PartialEq)]
pub struct UpdateInfo {
    pub version: String,
    pub url: String,
    #[serde(default)]
    pub changelog: String,
}

/// Seam for the license API so the controller is testable with a stub.
#[async_trait]
pub trait LicenseApi: Send + Sync {
    async fn register_device(&self, device_id: &str, key: &str) -> Result<ApiAck>;

    async fn unregister_device(&self, device_id: &str, key: &str) -> Result<ApiAck>;

    async fn verify(&self, key: &str) -> Result<VerifyPayload>;

    async fn validate(&self, key: &str) -> Result<ValidateVerdict>;

    async fn changelog(&self) -> Result<UpdateInfo>;
}

pub struct LicenseClient {
    base: Url,
    cfg: LicenseConfig,
    http: reqwest::Client,
}

impl LicenseClient {
    pub fn new(cfg: LicenseConfig) -> Result<Self> {
        let base = Url::parse(&cfg.base_url)
            .map_err(|e| Error::InvalidInput(format!("license base url: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self { base, cfg, http })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| Error::InvalidInput("license base url cannot be a base".into()))?;
            for s in segments {
                path.push(s);
            }
        }
        Ok(url)
    }

    /// GET with transport-level retry. Application rejections pass
    /// through untouched.
    async fn get_with_retry(&self, url: Url) -> Result<String> {
        let mut last = None;
        for (attempt, backoff) in BACKOFF_SECS.iter().enumerate() {
            match self.try_get(url.clone()).await {
                Ok(body) => return Ok(body),
                Err(e @ Error::NetworkTimeout(_)) => {
                    warn!(attempt, error = %e, "license call failed, backing off");
                    last = Some(e);
                    if attempt + 1 < BACKOFF_SECS.len() {
                        tokio::time::sleep(Duration::from_secs(*backoff)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| Error::NetworkTimeout("license call".into())))
    }

    async fn try_get(&self, url: Url) -> Result<String> {
        let resp = self.http.get(url).send().await?;
        Ok(resp.text().await?)
    }

    fn parse_ack(body: &str) -> Result<ApiAck> {
        let ack: ApiAck = serde_json::from_str(body)
            .map_err(|e| Error::ValidationFailure(format!("malformed ack: {e}")))?;
        if ack.result == "success" {
            Ok(ack)
        } else {
            Err(Error::RemoteRejection {
                message: ack.message,
                code: ack.code,
            })
        }
    }
}

#[async_trait]
impl LicenseApi for LicenseClient {
    async fn register_device(&self, device_id: &str, key: &str) -> Result<ApiAck> {
        let url = self.endpoint(&[
            "api",
            "license",
            "register",
            "device",
            device_id,
            &self.cfg.register_secret,
            key,
        ])?;
        debug!(device = device_id, "registering device");
        Self::parse_ack(&self.get_with_retry(url).await?)
    }

    async fn unregister_device(&self, device_id: &str, key: &str) -> Result<ApiAck> {
        let url = self.endpoint(&[
            "api",
            "license",
            "unregister",
            "device",
            device_id,
            &self.cfg.register_secret,
            key,
        ])?;
        debug!(device = device_id, "unregistering device");
        Self::parse_ack(&self.get_with_retry(url).await?)
    }

    async fn verify(&self, key: &str) -> Result<VerifyPayload> {
        let url = self.endpoint(&["api", "license", "verify", &self.cfg.retrieve_secret, key])?;
        let body = self.get_with_retry(url).await?;
        if let Ok(ack) = serde_json::from_str::<ApiAck>(&body) {
            if ack.result == "error" {
                return Err(Error::RemoteRejection {
                    message: ack.message,
                    code: ack.code,
                });
            }
        }
        serde_json::from_str(&body)
            .map_err(|e| Error::ValidationFailure(format!("malformed verify payload: {e}")))
    }

    /// The liveness body is a JSON-encoded scalar string, quotes
    /// included. A bare `1`/`0` is an undocumented server mode and is
    /// rejected rather than silently accepted.
    async fn validate(&self, key: &str) -> Result<ValidateVerdict> {
        let url = self.endpoint(&["api", "license", "validate", &self.cfg.validate_secret, key])?;
        let body = self.get_with_retry(url).await?;
        parse_validate_body(&body)
    }

    async fn changelog(&self) -> Result<UpdateInfo> {
        let url = self.endpoint(&[
            "api",
            "product",
            "changelog",
            PRODUCT_NAME,
            &self.cfg.retrieve_secret,
        ])?;
        let body = self.get_with_retry(url).await?;
        let info: UpdateInfo = serde_json::from_str(&body)
            .map_err(|e| Error::ValidationFailure(format!("malformed changelog: {e}")))?;
        validate_update_url(&info.url)?;
        Ok(info)
    }
}

pub(crate) fn parse_validate_body(body: &str) -> Result<ValidateVerdict> {
    let value: Value = serde_json::from_str(body.trim())
        .map_err(|_| Error::ValidationFailure(format!("unparseable validate body: {body:?}")))?;
    match value {
        Value::String(s) if s == "1" => Ok(ValidateVerdict::Valid),
        Value::String(s) if s == "0" => Ok(ValidateVerdict::Invalid),
        other => Err(Error::ValidationFailure(format!(
            "validate body must be a JSON string \"1\" or \"0\", got {other}"
        ))),
    }
}

/// Update packages must come over HTTPS, end in `.zip` and live on
/// `merafsolutions.com`.
pub(crate) fn validate_update_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw).map_err(|e| Error::ValidationFailure(format!("update url: {e}")))?;
    if url.scheme() != "https" {
        return Err(Error::ValidationFailure("update url must be https".into()));
    }
    if !url.path().ends_with(".zip") {
        return Err(Error::ValidationFailure("update url must end in .zip".into()));
    }
    let host = url.host_str().unwrap_or_default();
    if host != "merafsolutions.com" && !host.ends_with(".merafsolutions.com") {
        return Err(Error::ValidationFailure(format!(
            "update url host {host:?} is not merafsolutions.com"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_body_requires_json_string() {
        assert_eq!(parse_validate_body("\"1\"").unwrap(), ValidateVerdict::Valid);
        assert_eq!(parse_validate_body("\"0\"").unwrap(), ValidateVerdict::Invalid);
        // bare scalars are an undocumented server mode
        assert!(parse_validate_body("1").is_err());
        assert!(parse_validate_body("0").is_err());
        assert!(parse_validate_body("\"2\"").is_err());
        assert!(parse_validate_body("yes").is_err());
    }

    #[test]
    fn update_url_rules() {
        assert!(validate_update_url("https://prod.merafsolutions.com/dl/sessner-2.0.zip").is_ok());
        assert!(validate_update_url("https://merafsolutions.com/sessner.zip").is_ok());
        assert!(validate_update_url("http://merafsolutions.com/sessner.zip").is_err());
        assert!(validate_update_url("https://merafsolutions.com/sessner.tar.gz").is_err());
        assert!(validate_update_url("https://evil.com/sessner.zip").is_err());
        assert!(validate_update_url("https://notmerafsolutions.com/sessner.zip").is_err());
    }

    #[test]
    fn ack_parsing_maps_error_results() {
        let ok = LicenseClient::parse_ack(r#"{"result":"success","message":"bound"}"#).unwrap();
        assert_eq!(ok.message, "bound");
        let err = LicenseClient::parse_ack(r#"{"result":"error","message":"no seats","code":62}"#)
            .unwrap_err();
        match err {
            Error::RemoteRejection { message, code } => {
                assert_eq!(message, "no seats");
                assert_eq!(code, Some(62));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn verify_payload_accepts_string_or_number_limits() {
        let typed: VerifyPayload = serde_json::from_str(
            r#"{"status":"active","item_reference":"Sessner","max_allowed_domains":10,"max_allowed_devices":"5"}"#,
        )
        .unwrap();
        assert_eq!(typed.max_allowed_domains, 10);
        assert_eq!(typed.max_allowed_devices, 5);
    }
}
