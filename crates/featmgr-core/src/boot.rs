//! Boot-store persistence.
//!
//! The OS offers no call for writing the boot section, so updates are written
//! straight into the hive under the keys the OS reads at boot. Writes are
//! last-writer-wins and a batch is not atomic: updates are applied in order
//! and the first failure stops the batch with earlier updates kept.

use crate::error::{FeatureError, HiveError};
use crate::hive::{Hive, HiveValue, KeyPath};
use crate::layout::StoreLayout;
use crate::lkg::{fix_lkg_store, RepairOutcome};
use crate::obfuscation::{deobfuscate_feature_id, obfuscated_key_name};
use crate::record::{
    FeatureConfiguration, FeatureEnabledState, FeaturePriority, VariantPayloadKind, MAX_VARIANT,
};
use crate::runtime::FeatureConfigurationSection;
use crate::subscriptions::{
    persist_subscriptions, query_persisted_subscriptions, remove_persisted_subscriptions,
    FeatureUsageSubscription,
};
use crate::update::{FeatureConfigurationOperation, FeatureConfigurationUpdate};
use crate::validate::validate_updates;

/// Dword values under an `Overrides\<priority>\<obfuscated id>` key.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum OverrideValueName {
    EnabledState,
    EnabledStateOptions,
    Variant,
    VariantPayload,
    VariantPayloadKind,
}

impl OverrideValueName {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EnabledState => "EnabledState",
            Self::EnabledStateOptions => "EnabledStateOptions",
            Self::Variant => "Variant",
            Self::VariantPayload => "VariantPayload",
            Self::VariantPayloadKind => "VariantPayloadKind",
        }
    }
}

#[derive(Debug)]
pub struct BootStore<H> {
    hive: H,
    layout: StoreLayout,
}

impl<H: Hive> BootStore<H> {
    #[must_use]
    pub fn new(hive: H, layout: StoreLayout) -> Self {
        Self { hive, layout }
    }

    #[must_use]
    pub fn hive(&self) -> &H {
        &self.hive
    }

    pub fn hive_mut(&mut self) -> &mut H {
        &mut self.hive
    }

    #[must_use]
    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    #[must_use]
    pub fn into_inner(self) -> H {
        self.hive
    }

    /// Validate the batch, then write each update in order.
    ///
    /// Change-stamp checks are the caller's job; see
    /// [`crate::runtime::RuntimeStore::check_change_stamp`].
    ///
    /// # Errors
    /// Validation errors before any write; otherwise the first hive failure,
    /// which carries the status a registry call would have returned.
    pub fn apply_updates(&mut self, updates: &[FeatureConfigurationUpdate]) -> Result<(), FeatureError> {
        validate_updates(updates, FeatureConfigurationSection::Boot)?;
        for (index, update) in updates.iter().enumerate() {
            if let Err(err) = self.apply_one(update) {
                tracing::warn!(
                    feature_id = update.feature_id(),
                    applied = index,
                    status = %err.status(),
                    "boot store batch stopped"
                );
                return Err(err.into());
            }
        }
        tracing::info!(updates = updates.len(), "applied boot store batch");
        Ok(())
    }

    fn apply_one(&mut self, update: &FeatureConfigurationUpdate) -> Result<(), HiveError> {
        let is_user_policy = update.priority() == FeaturePriority::USER_POLICY;
        let obfuscated = obfuscated_key_name(update.feature_id());
        let operation = update.operation();

        if operation.contains(FeatureConfigurationOperation::RESET_STATE) {
            if is_user_policy {
                self.hive.delete_value(&self.layout.user_policy_overrides, &obfuscated)?;
            } else {
                let path = self.layout.override_key(update.priority(), update.feature_id());
                self.hive.delete_tree(&path)?;
            }
            tracing::debug!(feature_id = update.feature_id(), "reset boot override");
            return Ok(());
        }

        let path = if is_user_policy {
            self.layout.user_policy_overrides.clone()
        } else {
            self.layout.override_key(update.priority(), update.feature_id())
        };
        let mut key = self.hive.create_and_open(&path)?;

        if operation.contains(FeatureConfigurationOperation::FEATURE_STATE) {
            if is_user_policy {
                key.set_dword(&obfuscated, update.enabled_state().value())?;
            } else {
                key.set_dword(
                    OverrideValueName::EnabledState.as_str(),
                    update.enabled_state().value(),
                )?;
                key.set_dword(
                    OverrideValueName::EnabledStateOptions.as_str(),
                    update.enabled_state_options().value(),
                )?;
            }
        }
        if !is_user_policy && operation.contains(FeatureConfigurationOperation::VARIANT_STATE) {
            key.set_dword(OverrideValueName::Variant.as_str(), u32::from(update.variant()))?;
            key.set_dword(OverrideValueName::VariantPayload.as_str(), update.variant_payload())?;
            key.set_dword(
                OverrideValueName::VariantPayloadKind.as_str(),
                update.variant_payload_kind().value(),
            )?;
        }
        tracing::debug!(feature_id = update.feature_id(), key = %path, "wrote boot override");
        Ok(())
    }

    /// Overrides that will take effect on next boot, read back from the hive.
    ///
    /// Keys whose names are not numbers are skipped.
    ///
    /// # Errors
    /// Propagates hive failures.
    pub fn pending_overrides(&self) -> Result<Vec<FeatureConfiguration>, FeatureError> {
        let mut records = Vec::new();

        let overrides = &self.layout.overrides;
        if self.hive.key_exists(overrides)? {
            for priority_name in self.hive.subkey_names(overrides)? {
                let Some(priority) = priority_name
                    .parse::<u32>()
                    .ok()
                    .and_then(|raw| FeaturePriority::from_raw(raw).ok())
                else {
                    tracing::warn!(key = %priority_name, "skipping unrecognised priority key");
                    continue;
                };
                let priority_key = overrides.join(&priority_name);
                for id_name in self.hive.subkey_names(&priority_key)? {
                    let Ok(obfuscated) = id_name.parse::<u32>() else {
                        tracing::warn!(key = %id_name, "skipping non-numeric override key");
                        continue;
                    };
                    let record = self.read_override(
                        &priority_key.join(&id_name),
                        deobfuscate_feature_id(obfuscated),
                        priority,
                    )?;
                    records.push(record);
                }
            }
        }

        let policy = &self.layout.user_policy_overrides;
        if self.hive.key_exists(policy)? {
            for name in self.hive.value_names(policy)? {
                let Ok(obfuscated) = name.parse::<u32>() else {
                    continue;
                };
                if let Some(state) = self.read_dword(policy, &name)? {
                    let mut record = FeatureConfiguration::new(
                        deobfuscate_feature_id(obfuscated),
                        FeaturePriority::USER_POLICY,
                    );
                    record.set_enabled_state(FeatureEnabledState::from_bits(state));
                    records.push(record);
                }
            }
        }

        records.sort_by_key(|record| (record.feature_id(), record.priority()));
        Ok(records)
    }

    fn read_override(
        &self,
        key: &KeyPath,
        feature_id: u32,
        priority: FeaturePriority,
    ) -> Result<FeatureConfiguration, FeatureError> {
        let mut record = FeatureConfiguration::new(feature_id, priority);
        if let Some(state) = self.read_dword(key, OverrideValueName::EnabledState.as_str())? {
            record.set_enabled_state(FeatureEnabledState::from_bits(state));
        }
        if let Some(options) = self.read_dword(key, OverrideValueName::EnabledStateOptions.as_str())? {
            record.set_experiment(options & 1 == 1);
        }
        if let Some(variant) = self.read_dword(key, OverrideValueName::Variant.as_str())? {
            record.set_variant(variant & MAX_VARIANT)?;
        }
        if let Some(payload) = self.read_dword(key, OverrideValueName::VariantPayload.as_str())? {
            record.set_variant_payload(payload);
        }
        if let Some(kind) = self.read_dword(key, OverrideValueName::VariantPayloadKind.as_str())? {
            record.set_variant_payload_kind(VariantPayloadKind::from_bits(kind));
        }
        Ok(record)
    }

    fn read_dword(&self, key: &KeyPath, name: &str) -> Result<Option<u32>, HiveError> {
        match self.hive.value(key, name)? {
            Some(HiveValue::Dword(value)) => Ok(Some(value)),
            Some(other) => {
                tracing::warn!(key = %key, name, kind = other.kind_name(), "ignoring non-dword value");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// # Errors
    /// Stops at the first hive failure.
    pub fn add_subscriptions(
        &mut self,
        subscriptions: &[FeatureUsageSubscription],
    ) -> Result<(), FeatureError> {
        Ok(persist_subscriptions(&mut self.hive, &self.layout, subscriptions)?)
    }

    /// Returns the number of leaves removed.
    ///
    /// # Errors
    /// Stops at the first hive failure.
    pub fn remove_subscriptions(
        &mut self,
        subscriptions: &[FeatureUsageSubscription],
    ) -> Result<usize, FeatureError> {
        Ok(remove_persisted_subscriptions(&mut self.hive, &self.layout, subscriptions)?)
    }

    /// # Errors
    /// Propagates hive failures while walking the tree.
    pub fn subscriptions(&self) -> Result<Vec<FeatureUsageSubscription>, FeatureError> {
        Ok(query_persisted_subscriptions(&self.hive, &self.layout)?)
    }

    pub fn fix_lkg_store(&mut self) -> RepairOutcome {
        fix_lkg_store(&mut self.hive, &self.layout)
    }
}
