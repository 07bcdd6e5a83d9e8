use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization as _;

use crate::host::TabId;

/// Fixed badge palette. FREE draws from the first 6 entries, PREMIUM from
/// all 12; assignment is stable by id hash and never changes once made.
pub const COLOR_PALETTE: [&str; 12] = [
    "#4285f4", "#ea4335", "#fbbc04", "#34a853", "#fa7b17", "#f538a0",
    "#a142f4", "#24c1e0", "#5f6368", "#1a73e8", "#d93025", "#188038",
];

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Active,
    Dormant,
    Imported,
}

/// The isolation unit: identity, display metadata and the live tab set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub color: String,
    pub created_at: i64,
    pub last_accessed: i64,
    pub state: SessionState,
    #[serde(default)]
    pub tabs: Vec<TabId>,
    /// URLs captured when the session last had tabs; drives reopen and
    /// auto-restore.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persisted_tabs: Option<Vec<String>>,
}

impl Session {
    pub fn new(id: String, name: Option<String>, now: i64) -> Self {
        let color = color_for_id(&id, COLOR_PALETTE.len());
        Self {
            id,
            name,
            color,
            created_at: now,
            last_accessed: now,
            state: SessionState::Active,
            tabs: Vec::new(),
            persisted_tabs: None,
        }
    }

    pub fn is_dormant(&self) -> bool {
        self.state == SessionState::Dormant
    }

    pub fn touch(&mut self, now: i64) {
        self.last_accessed = now;
    }
}

/// Stable palette color for a session id.
///
/// FNV-1a over the id bytes; the hash never changes, so neither does the
/// color.
pub fn color_for_id(id: &str, palette_size: usize) -> String {
    let size = palette_size.clamp(1, COLOR_PALETTE.len());
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in id.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    COLOR_PALETTE[(hash % size as u64) as usize].to_owned()
}

/// Canonical form used for case-insensitive name uniqueness: NFC
/// normalization, then lowercasing.
pub fn canonical_name(name: &str) -> String {
    name.nfc().collect::<String>().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_is_deterministic_and_in_palette() {
        let a = color_for_id("session_1700000000000_abcd1234", 12);
        let b = color_for_id("session_1700000000000_abcd1234", 12);
        assert_eq!(a, b);
        assert!(COLOR_PALETTE.contains(&a.as_str()));
    }

    #[test]
    fn palette_size_is_clamped() {
        let c = color_for_id("session_x", 6);
        assert!(COLOR_PALETTE[..6].contains(&c.as_str()));
        let c = color_for_id("session_x", 100);
        assert!(COLOR_PALETTE.contains(&c.as_str()));
    }

    #[test]
    fn canonical_name_folds_case_and_normalization() {
        // U+0041 U+030A (A + combining ring) vs U+00C5 (Å)
        assert_eq!(canonical_name("A\u{30a}ngstrom"), canonical_name("\u{c5}ngstrom"));
        assert_eq!(canonical_name("Work"), canonical_name("wORK"));
    }
}
