use std::fmt;

use serde::{Deserialize, Serialize};

/// License tier. FREE is the default for unlicensed installs and the
/// floor every failure mode degrades to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    #[default]
    Free,
    Premium,
    Enterprise,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Free => "FREE",
            Tier::Premium => "PREMIUM",
            Tier::Enterprise => "ENTERPRISE",
        })
    }
}

impl Tier {
    /// Tier determination from a valid license payload:
    /// `maxDevices > 1 ∧ maxDomains > 3` → ENTERPRISE;
    /// `maxDomains > 3` → PREMIUM; else FREE.
    pub fn from_limits(max_devices: i64, max_domains: i64) -> Self {
        if max_devices > 1 && max_domains > 3 {
            Tier::Enterprise
        } else if max_domains > 3 {
            Tier::Premium
        } else {
            Tier::Free
        }
    }
}

/// Export capability ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportCapability {
    None,
    Single,
    SingleAndBulk,
}

/// The authoritative tier feature matrix. `None` in a numeric field means
/// unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSet {
    pub max_concurrent_sessions: Option<usize>,
    pub persistence_window_days: Option<u32>,
    pub badge_palette_size: Option<usize>,
    pub custom_names: bool,
    pub export: ExportCapability,
    pub export_encryption: bool,
    pub auto_restore: bool,
    pub bulk_dormant_delete: bool,
    pub single_dormant_delete: bool,
}

impl FeatureSet {
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Free => Self {
                max_concurrent_sessions: Some(3),
                persistence_window_days: Some(7),
                badge_palette_size: Some(6),
                custom_names: false,
                export: ExportCapability::None,
                export_encryption: false,
                auto_restore: false,
                bulk_dormant_delete: true,
                single_dormant_delete: true,
            },
            Tier::Premium => Self {
                max_concurrent_sessions: None,
                persistence_window_days: None,
                badge_palette_size: Some(12),
                custom_names: true,
                export: ExportCapability::Single,
                export_encryption: false,
                auto_restore: false,
                bulk_dormant_delete: true,
                single_dormant_delete: true,
            },
            Tier::Enterprise => Self {
                max_concurrent_sessions: None,
                persistence_window_days: None,
                badge_palette_size: None,
                custom_names: true,
                export: ExportCapability::SingleAndBulk,
                export_encryption: true,
                auto_restore: true,
                bulk_dormant_delete: true,
                single_dormant_delete: true,
            },
        }
    }

    /// Lookup by the feature names the message surface exposes.
    pub fn has(&self, feature: &str) -> bool {
        match feature {
            "customNames" => self.custom_names,
            "export" => self.export != ExportCapability::None,
            "bulkExport" => self.export == ExportCapability::SingleAndBulk,
            "exportEncryption" => self.export_encryption,
            "autoRestore" => self.auto_restore,
            "bulkDormantDelete" => self.bulk_dormant_delete,
            "singleDormantDelete" => self.single_dormant_delete,
            "unlimitedSessions" => self.max_concurrent_sessions.is_none(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_determination() {
        assert_eq!(Tier::from_limits(5, 10), Tier::Enterprise);
        assert_eq!(Tier::from_limits(1, 10), Tier::Premium);
        assert_eq!(Tier::from_limits(5, 3), Tier::Free);
        assert_eq!(Tier::from_limits(1, 1), Tier::Free);
    }

    #[test]
    fn free_matrix_rows() {
        let f = FeatureSet::for_tier(Tier::Free);
        assert_eq!(f.max_concurrent_sessions, Some(3));
        assert_eq!(f.persistence_window_days, Some(7));
        assert_eq!(f.badge_palette_size, Some(6));
        assert!(!f.has("customNames"));
        assert!(!f.has("export"));
        assert!(f.has("bulkDormantDelete"));
        assert!(f.has("singleDormantDelete"));
    }

    #[test]
    fn premium_gets_single_export_only() {
        let f = FeatureSet::for_tier(Tier::Premium);
        assert!(f.has("export"));
        assert!(!f.has("bulkExport"));
        assert!(!f.has("exportEncryption"));
        assert!(!f.has("autoRestore"));
        assert!(f.has("unlimitedSessions"));
    }

    #[test]
    fn enterprise_gets_everything() {
        let f = FeatureSet::for_tier(Tier::Enterprise);
        assert!(f.has("bulkExport"));
        assert!(f.has("exportEncryption"));
        assert!(f.has("autoRestore"));
    }

    #[test]
    fn unknown_feature_is_false() {
        assert!(!FeatureSet::for_tier(Tier::Enterprise).has("teleport"));
    }
}
