//! Session export and import documents.
//!
//! Self-describing JSON envelope: payloads over the compression threshold
//! DEFLATE, ENTERPRISE exports may additionally encrypt under AES-256-GCM
//! with a PBKDF2-SHA-256 key (100k+ iterations, fresh salt and IV per
//! export). The decoded payload starts with a `{salt, iv, ciphertext,
//! tag}` envelope when encrypted.

use std::io::{Read as _, Write as _};

use aes_gcm::{
    aead::{Aead as _, KeyInit as _, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{SecondsFormat, Utc};
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{cookie::SessionCookieJar, store::Session, Error, Result};

pub const SCHEMA_VERSION: &str = "1.0";
pub const PBKDF2_ITERATIONS: u32 = 100_000;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// The export file, §6.6 shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub schema_version: String,
    pub exported_at: String,
    pub compressed: bool,
    pub encrypted: bool,
    pub session_count: usize,
    /// base64 of (optionally AES-GCM(compressed(JSON))).
    pub payload: String,
}

/// One exported session: metadata plus its full cookie store, byte
/// identical through a round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionExport {
    pub session: Session,
    pub cookies: SessionCookieJar,
}

#[derive(Serialize, Deserialize)]
struct ExportPayload {
    sessions: Vec<SessionExport>,
}

#[derive(Serialize, Deserialize)]
struct CryptoEnvelope {
    salt: String,
    iv: String,
    ciphertext: String,
    tag: String,
}

/// Build an export document. Payloads over `compress_threshold` bytes
/// are always compressed; a password turns on encryption.
pub fn export_sessions(
    sessions: Vec<SessionExport>,
    compress_threshold: usize,
    password: Option<&str>,
) -> Result<ExportDocument> {
    let session_count = sessions.len();
    let plain = serde_json::to_vec(&ExportPayload { sessions })?;

    let compressed = plain.len() > compress_threshold;
    let body = if compressed { deflate(&plain)? } else { plain };

    let (encrypted, body) = match password {
        Some(password) => (true, encrypt(&body, password)?),
        None => (false, body),
    };

    Ok(ExportDocument {
        schema_version: SCHEMA_VERSION.to_owned(),
        exported_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        compressed,
        encrypted,
        session_count,
        payload: BASE64.encode(body),
    })
}

/// Unpack an export document back into sessions.
pub fn import_sessions(
    doc: &ExportDocument,
    password: Option<&str>,
    max_bytes: usize,
) -> Result<Vec<SessionExport>> {
    if doc.payload.len() > max_bytes {
        return Err(Error::InvalidInput(format!(
            "import document is {} bytes, limit is {max_bytes}",
            doc.payload.len()
        )));
    }
    if doc.schema_version != SCHEMA_VERSION {
        return Err(Error::ValidationFailure(format!(
            "unsupported schema version {:?}",
            doc.schema_version
        )));
    }
    let mut body = BASE64
        .decode(&doc.payload)
        .map_err(|e| Error::ValidationFailure(format!("payload is not base64: {e}")))?;

    if doc.encrypted {
        let password =
            password.ok_or_else(|| Error::InvalidInput("import requires a password".into()))?;
        body = decrypt(&body, password)?;
    }
    if doc.compressed {
        body = inflate(&body)?;
    }
    let payload: ExportPayload = serde_json::from_str(
        std::str::from_utf8(&body)
            .map_err(|e| Error::ValidationFailure(format!("payload is not UTF-8: {e}")))?,
    )
    .map_err(|e| Error::ValidationFailure(format!("malformed payload: {e}")))?;
    Ok(payload.sessions)
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::ValidationFailure(format!("corrupt deflate stream: {e}")))?;
    Ok(out)
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

fn encrypt(plain: &[u8], password: &str) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut salt);
    rand::rng().fill_bytes(&mut nonce);

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| Error::DecryptionFailure)?;
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload::from(plain))
        .map_err(|_| Error::DecryptionFailure)?;
    // aes-gcm appends the tag; the envelope carries it separately
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    let envelope = CryptoEnvelope {
        salt: BASE64.encode(salt),
        iv: BASE64.encode(nonce),
        ciphertext: BASE64.encode(&sealed),
        tag: BASE64.encode(&tag),
    };
    Ok(serde_json::to_vec(&envelope)?)
}

fn decrypt(body: &[u8], password: &str) -> Result<Vec<u8>> {
    let envelope: CryptoEnvelope =
        serde_json::from_slice(body).map_err(|_| Error::DecryptionFailure)?;
    let salt = BASE64.decode(&envelope.salt).map_err(|_| Error::DecryptionFailure)?;
    let nonce = BASE64.decode(&envelope.iv).map_err(|_| Error::DecryptionFailure)?;
    let mut sealed = BASE64
        .decode(&envelope.ciphertext)
        .map_err(|_| Error::DecryptionFailure)?;
    let tag = BASE64.decode(&envelope.tag).map_err(|_| Error::DecryptionFailure)?;
    if nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(Error::DecryptionFailure);
    }
    sealed.extend_from_slice(&tag);

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| Error::DecryptionFailure)?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), Payload::from(sealed.as_slice()))
        .map_err(|_| Error::DecryptionFailure)
}
