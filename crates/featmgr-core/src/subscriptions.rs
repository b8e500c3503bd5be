//! Usage-notification subscriptions and their persisted mirror.
//!
//! Live subscriptions go through [`crate::runtime::FeatureSyscalls`]; the
//! persisted copy lives under `UsageSubscriptions\<obfuscated id>\{GUID}`,
//! one leaf key per subscription.

use serde::{Deserialize, Serialize};

use crate::error::HiveError;
use crate::hive::{Hive, HiveValue, KeyPath};
use crate::layout::StoreLayout;
use crate::obfuscation::deobfuscate_feature_id;

const REPORTING_KIND: &str = "ReportingKind";
const REPORTING_OPTIONS: &str = "ReportingOptions";
const REPORTING_TARGET: &str = "ReportingTarget";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct FeatureUsageSubscription {
    pub feature_id: u32,
    pub reporting_kind: u16,
    pub reporting_options: u16,
    pub reporting_target: u64,
}

impl FeatureUsageSubscription {
    /// Identity the kernel uses when unsubscribing.
    #[must_use]
    pub fn matches_live(&self, other: &Self) -> bool {
        self.feature_id == other.feature_id
            && self.reporting_kind == other.reporting_kind
            && self.reporting_target == other.reporting_target
    }

    /// Identity used when removing persisted leaves; options take part here
    /// but not on the live path.
    #[must_use]
    pub fn matches_persisted(&self, kind: u16, options: u16, target: u64) -> bool {
        self.reporting_kind == kind
            && self.reporting_options == options
            && self.reporting_target == target
    }
}

/// Fire-and-forget usage event. Never persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct FeatureUsageReport {
    pub feature_id: u32,
    pub reporting_kind: u16,
    pub reporting_options: u16,
}

/// Write one leaf per subscription, each under a fresh braced v4 GUID name.
///
/// # Errors
/// Stops at the first hive failure; earlier leaves stay written.
pub fn persist_subscriptions<H: Hive + ?Sized>(
    hive: &mut H,
    layout: &StoreLayout,
    subscriptions: &[FeatureUsageSubscription],
) -> Result<(), HiveError> {
    for subscription in subscriptions {
        let leaf = layout
            .subscription_key(subscription.feature_id)
            .join(uuid::Uuid::new_v4().braced().to_string());
        let mut key = hive.create_and_open(&leaf)?;
        key.set_dword(REPORTING_KIND, u32::from(subscription.reporting_kind))?;
        key.set_dword(REPORTING_OPTIONS, u32::from(subscription.reporting_options))?;
        key.set_value(
            REPORTING_TARGET,
            HiveValue::Binary(subscription.reporting_target.to_le_bytes().to_vec()),
        )?;
        tracing::debug!(
            feature_id = subscription.feature_id,
            leaf = %leaf,
            "persisted usage subscription"
        );
    }
    Ok(())
}

/// Delete every persisted leaf matching each subscription, then drop the
/// feature's key once no leaves remain. Returns the number of leaves removed.
///
/// Unreadable leaves never match and are left in place.
///
/// # Errors
/// Stops at the first hive failure.
pub fn remove_persisted_subscriptions<H: Hive + ?Sized>(
    hive: &mut H,
    layout: &StoreLayout,
    subscriptions: &[FeatureUsageSubscription],
) -> Result<usize, HiveError> {
    let mut removed = 0;
    for subscription in subscriptions {
        let feature_key = layout.subscription_key(subscription.feature_id);
        if !hive.key_exists(&feature_key)? {
            continue;
        }

        for leaf_name in hive.subkey_names(&feature_key)? {
            let leaf = feature_key.join(&leaf_name);
            let Some((kind, options, target)) = read_leaf(hive, &leaf)? else {
                continue;
            };
            if subscription.matches_persisted(kind, options, target) && hive.delete_tree(&leaf)? {
                removed += 1;
            }
        }

        if hive.subkey_names(&feature_key)?.is_empty() {
            hive.delete_tree(&feature_key)?;
        }
    }
    Ok(removed)
}

/// Enumerate the persisted mirror. Malformed leaves are skipped with a
/// warning; a missing root yields an empty list.
///
/// # Errors
/// Propagates backend failures while walking the tree.
pub fn query_persisted_subscriptions<H: Hive + ?Sized>(
    hive: &H,
    layout: &StoreLayout,
) -> Result<Vec<FeatureUsageSubscription>, HiveError> {
    let root = &layout.usage_subscriptions;
    if !hive.key_exists(root)? {
        return Ok(Vec::new());
    }

    let mut subscriptions = Vec::new();
    for feature_name in hive.subkey_names(root)? {
        let Ok(obfuscated) = feature_name.parse::<u32>() else {
            tracing::warn!(key = %feature_name, "skipping non-numeric subscription key");
            continue;
        };
        let feature_id = deobfuscate_feature_id(obfuscated);
        let feature_key = root.join(&feature_name);
        for leaf_name in hive.subkey_names(&feature_key)? {
            match read_leaf(hive, &feature_key.join(&leaf_name))? {
                Some((reporting_kind, reporting_options, reporting_target)) => {
                    subscriptions.push(FeatureUsageSubscription {
                        feature_id,
                        reporting_kind,
                        reporting_options,
                        reporting_target,
                    });
                }
                None => {
                    tracing::warn!(feature_id, leaf = %leaf_name, "skipping malformed subscription");
                }
            }
        }
    }
    Ok(subscriptions)
}

fn read_leaf<H: Hive + ?Sized>(
    hive: &H,
    leaf: &KeyPath,
) -> Result<Option<(u16, u16, u64)>, HiveError> {
    let kind = hive.value(leaf, REPORTING_KIND)?.as_ref().and_then(HiveValue::as_dword);
    let options = hive.value(leaf, REPORTING_OPTIONS)?.as_ref().and_then(HiveValue::as_dword);
    let target = hive.value(leaf, REPORTING_TARGET)?;
    let target = target
        .as_ref()
        .and_then(HiveValue::as_binary)
        .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
        .map(u64::from_le_bytes);

    match (kind, options, target) {
        (Some(kind), Some(options), Some(target)) => {
            match (u16::try_from(kind), u16::try_from(options)) {
                (Ok(kind), Ok(options)) => Ok(Some((kind, options, target))),
                _ => Ok(None),
            }
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::MemoryHive;

    fn subscription(kind: u16, options: u16, target: u64) -> FeatureUsageSubscription {
        FeatureUsageSubscription {
            feature_id: 36_354_489,
            reporting_kind: kind,
            reporting_options: options,
            reporting_target: target,
        }
    }

    #[test]
    fn persisted_leaf_layout_matches_boot_store() -> Result<(), HiveError> {
        let mut hive = MemoryHive::new();
        let layout = StoreLayout::default();
        persist_subscriptions(&mut hive, &layout, &[subscription(2, 1, 0x0102_0304_0506_0708)])?;

        let feature_key = layout.subscription_key(36_354_489);
        let leaves = hive.subkey_names(&feature_key)?;
        assert_eq!(leaves.len(), 1);
        let leaf_name = &leaves[0];
        assert!(leaf_name.starts_with('{') && leaf_name.ends_with('}'));
        let parsed = uuid::Uuid::parse_str(&leaf_name[1..leaf_name.len() - 1]);
        assert!(matches!(parsed, Ok(guid) if guid.get_version_num() == 4));
        assert_eq!(leaf_name.len(), 38);

        let leaf = feature_key.join(leaf_name);
        assert_eq!(hive.value(&leaf, "ReportingKind")?, Some(HiveValue::Dword(2)));
        assert_eq!(hive.value(&leaf, "ReportingOptions")?, Some(HiveValue::Dword(1)));
        assert_eq!(
            hive.value(&leaf, "ReportingTarget")?,
            Some(HiveValue::Binary(vec![8, 7, 6, 5, 4, 3, 2, 1]))
        );
        Ok(())
    }

    #[test]
    fn removing_last_subscription_drops_feature_key() -> Result<(), HiveError> {
        let mut hive = MemoryHive::new();
        let layout = StoreLayout::default();
        let subs = [subscription(1, 0, 10), subscription(1, 0, 11)];
        persist_subscriptions(&mut hive, &layout, &subs)?;

        assert_eq!(remove_persisted_subscriptions(&mut hive, &layout, &subs[..1])?, 1);
        assert!(hive.key_exists(&layout.subscription_key(36_354_489))?);

        assert_eq!(remove_persisted_subscriptions(&mut hive, &layout, &subs[1..])?, 1);
        assert!(!hive.key_exists(&layout.subscription_key(36_354_489))?);
        Ok(())
    }

    #[test]
    fn persisted_removal_requires_matching_options() -> Result<(), HiveError> {
        let mut hive = MemoryHive::new();
        let layout = StoreLayout::default();
        persist_subscriptions(&mut hive, &layout, &[subscription(1, 3, 10)])?;

        assert_eq!(remove_persisted_subscriptions(&mut hive, &layout, &[subscription(1, 0, 10)])?, 0);
        assert_eq!(query_persisted_subscriptions(&hive, &layout)?.len(), 1);
        Ok(())
    }

    #[test]
    fn removal_without_feature_key_is_a_no_op() -> Result<(), HiveError> {
        let mut hive = MemoryHive::new();
        let removed =
            remove_persisted_subscriptions(&mut hive, &StoreLayout::default(), &[subscription(1, 0, 1)])?;
        assert_eq!(removed, 0);
        Ok(())
    }

    #[test]
    fn query_skips_malformed_leaves() -> Result<(), HiveError> {
        let mut hive = MemoryHive::new();
        let layout = StoreLayout::default();
        persist_subscriptions(&mut hive, &layout, &[subscription(4, 0, 99)])?;
        let broken = layout.subscription_key(36_354_489).join("{broken}");
        hive.create_and_open(&broken)?.set_dword("ReportingKind", 1)?;

        let found = query_persisted_subscriptions(&hive, &layout)?;
        assert_eq!(found, vec![subscription(4, 0, 99)]);
        Ok(())
    }

    #[test]
    fn live_identity_ignores_options() {
        assert!(subscription(1, 0, 5).matches_live(&subscription(1, 7, 5)));
        assert!(!subscription(1, 0, 5).matches_live(&subscription(2, 0, 5)));
    }
}
