use serde::{Deserialize, Serialize};

use crate::hive::KeyPath;
use crate::obfuscation::obfuscated_key_name;
use crate::record::FeaturePriority;

/// Where each part of the boot store lives inside the hive.
///
/// Defaults are the paths the OS reads at boot. Any field missing from a
/// JSON override keeps its default.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct StoreLayout {
    pub overrides: KeyPath,
    pub user_policy_overrides: KeyPath,
    pub usage_subscriptions: KeyPath,
    pub last_known_good: KeyPath,
    pub lkg_value_name: String,
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self {
            overrides: KeyPath::parse(
                "SYSTEM\\CurrentControlSet\\Control\\FeatureManagement\\Overrides",
            ),
            user_policy_overrides: KeyPath::parse(
                "SYSTEM\\CurrentControlSet\\Policies\\Microsoft\\FeatureManagement\\Overrides",
            ),
            usage_subscriptions: KeyPath::parse(
                "SYSTEM\\CurrentControlSet\\Control\\FeatureManagement\\UsageSubscriptions",
            ),
            last_known_good: KeyPath::parse(
                "SYSTEM\\CurrentControlSet\\Control\\FeatureManagement\\LastKnownGood",
            ),
            lkg_value_name: "LKGConfiguration".to_string(),
        }
    }
}

impl StoreLayout {
    /// # Errors
    /// Returns the parse error when `json` is not a layout object.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// `Overrides\<priority>\<obfuscated id>`
    #[must_use]
    pub fn override_key(&self, priority: FeaturePriority, feature_id: u32) -> KeyPath {
        self.overrides
            .join(priority.value().to_string())
            .join(obfuscated_key_name(feature_id))
    }

    /// `UsageSubscriptions\<obfuscated id>`
    #[must_use]
    pub fn subscription_key(&self, feature_id: u32) -> KeyPath {
        self.usage_subscriptions.join(obfuscated_key_name(feature_id))
    }
}
