use sha2::{Digest as _, Sha256};

use crate::utils::alphanumeric;

/// Length of the random per-install salt.
const SALT_LEN: usize = 10;
/// Hex characters of the user-agent hash kept in the id.
const HASH_PREFIX_LEN: usize = 12;

/// Deterministic-per-install device identity: the first 12 hex characters
/// of SHA-256 over non-invasive user-agent components, concatenated with
/// a random salt generated once at first run and persisted.
///
/// Never transmitted except to the license endpoints.
pub fn derive_device_id(user_agent_components: &str, salt: &str) -> String {
    let digest = Sha256::digest(user_agent_components.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(HASH_PREFIX_LEN);
    id.push_str(salt);
    id
}

/// Fresh salt for a first run.
pub fn new_salt() -> String {
    alphanumeric(SALT_LEN)
}
