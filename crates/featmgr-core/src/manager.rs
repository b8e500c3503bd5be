use std::collections::BTreeSet;

use serde::Serialize;

use crate::blob::ConfigurationSnapshot;
use crate::boot::BootStore;
use crate::error::{FeatureError, NtStatus};
use crate::hive::Hive;
use crate::kernel::SectionState;
use crate::layout::StoreLayout;
use crate::lkg::RepairOutcome;
use crate::record::{FeatureConfiguration, FeatureEnabledState, FeaturePriority};
use crate::runtime::{
    BootFeatureConfigurationState, FeatureConfigurationSection, FeatureSyscalls, RuntimeStore,
};
use crate::subscriptions::{FeatureUsageReport, FeatureUsageSubscription};
use crate::update::{FeatureConfigurationOperation, FeatureConfigurationUpdate};
use crate::validate::validate_updates;

/// Follow-up work after a boot-store write. Both steps are best-effort.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct BootBookkeeping {
    pub lkg_repair: RepairOutcome,
    /// State recorded in the boot status data, when the write succeeded.
    pub boot_state: Option<BootFeatureConfigurationState>,
    pub boot_state_error: Option<NtStatus>,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ApplyReport {
    pub section: FeatureConfigurationSection,
    pub applied: usize,
    pub bookkeeping: Option<BootBookkeeping>,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq, Default)]
pub struct ImportSummary {
    pub runtime_applied: usize,
    pub boot_applied: usize,
    pub dropped_protected: usize,
    /// Records whose enabled state is the reserved legacy value.
    pub dropped_reserved: usize,
    pub bookkeeping: Option<BootBookkeeping>,
}

/// Entry point tying the runtime and boot stores together.
#[derive(Debug)]
pub struct FeatureManager<K, H> {
    runtime: RuntimeStore<K>,
    boot: BootStore<H>,
}

impl<K: FeatureSyscalls, H: Hive> FeatureManager<K, H> {
    #[must_use]
    pub fn new(kernel: K, hive: H, layout: StoreLayout) -> Self {
        Self { runtime: RuntimeStore::new(kernel), boot: BootStore::new(hive, layout) }
    }

    #[must_use]
    pub fn runtime(&self) -> &RuntimeStore<K> {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut RuntimeStore<K> {
        &mut self.runtime
    }

    #[must_use]
    pub fn boot(&self) -> &BootStore<H> {
        &self.boot
    }

    pub fn boot_mut(&mut self) -> &mut BootStore<H> {
        &mut self.boot
    }

    #[must_use]
    pub fn into_parts(self) -> (K, H) {
        (self.runtime.into_inner(), self.boot.into_inner())
    }

    /// Records the kernel reports for a section, with the change stamp.
    ///
    /// # Errors
    /// Native status of the query.
    pub fn query_all(
        &self,
        section: FeatureConfigurationSection,
    ) -> Result<(Vec<FeatureConfiguration>, u64), FeatureError> {
        self.runtime.query_all(section)
    }

    /// # Errors
    /// Native status of the query; a missing feature is `Ok(None)`.
    pub fn query(
        &self,
        feature_id: u32,
        section: FeatureConfigurationSection,
    ) -> Result<Option<FeatureConfiguration>, FeatureError> {
        self.runtime.query(feature_id, section)
    }

    /// # Errors
    /// Native status of the query.
    pub fn change_stamp(&self) -> Result<u64, FeatureError> {
        self.runtime.change_stamp()
    }

    /// Overrides written to the boot store that the kernel has not loaded yet.
    ///
    /// # Errors
    /// Propagates hive failures.
    pub fn pending_boot_overrides(&self) -> Result<Vec<FeatureConfiguration>, FeatureError> {
        self.boot.pending_overrides()
    }

    /// Validate and apply a batch to one section.
    ///
    /// Both sections check `previous_change_stamp` against the runtime stamp
    /// before writing. Runtime writes advance it; boot writes leave it, as
    /// the kernel stamp does not move. A boot write is followed by
    /// [`BootBookkeeping`].
    ///
    /// # Errors
    /// Validation and stale-stamp errors before any write; otherwise the
    /// native status of the failing store call.
    pub fn apply(
        &mut self,
        updates: &[FeatureConfigurationUpdate],
        section: FeatureConfigurationSection,
        previous_change_stamp: &mut u64,
    ) -> Result<ApplyReport, FeatureError> {
        match section {
            FeatureConfigurationSection::Runtime => {
                self.runtime.set_all(updates, section, previous_change_stamp)?;
                Ok(ApplyReport { section, applied: updates.len(), bookkeeping: None })
            }
            FeatureConfigurationSection::Boot => {
                validate_updates(updates, section)?;
                self.runtime.check_change_stamp(*previous_change_stamp)?;
                self.boot.apply_updates(updates)?;
                let bookkeeping = self.boot_bookkeeping();
                Ok(ApplyReport { section, applied: updates.len(), bookkeeping: Some(bookkeeping) })
            }
        }
    }

    /// Repair the LKG store, then flag that a boot is needed to pick up the
    /// new configuration.
    pub fn boot_bookkeeping(&mut self) -> BootBookkeeping {
        let lkg_repair = self.boot.fix_lkg_store();
        let state = BootFeatureConfigurationState::BootPending;
        match self.runtime.set_boot_state(state) {
            Ok(()) => BootBookkeeping { lkg_repair, boot_state: Some(state), boot_state_error: None },
            Err(err) => {
                tracing::warn!(error = %err, "could not record pending boot configuration state");
                BootBookkeeping {
                    lkg_repair,
                    boot_state: None,
                    boot_state_error: Some(err.status().unwrap_or(NtStatus::UNSUCCESSFUL)),
                }
            }
        }
    }

    /// Live subscriptions for [`FeatureConfigurationSection::Runtime`],
    /// the persisted mirror for [`FeatureConfigurationSection::Boot`].
    ///
    /// # Errors
    /// Native status or hive failure.
    pub fn subscriptions(
        &self,
        section: FeatureConfigurationSection,
    ) -> Result<Vec<FeatureUsageSubscription>, FeatureError> {
        match section {
            FeatureConfigurationSection::Runtime => {
                Ok(self.runtime.kernel().query_usage_subscriptions()?)
            }
            FeatureConfigurationSection::Boot => self.boot.subscriptions(),
        }
    }

    /// # Errors
    /// Native status or hive failure.
    pub fn add_subscriptions(
        &mut self,
        subscriptions: &[FeatureUsageSubscription],
        section: FeatureConfigurationSection,
    ) -> Result<(), FeatureError> {
        match section {
            FeatureConfigurationSection::Runtime => {
                Ok(self.runtime.kernel_mut().subscribe_usage_notifications(subscriptions)?)
            }
            FeatureConfigurationSection::Boot => self.boot.add_subscriptions(subscriptions),
        }
    }

    /// Live removal matches `(kind, target)`; persisted removal also
    /// matches options.
    ///
    /// # Errors
    /// Native status or hive failure.
    pub fn remove_subscriptions(
        &mut self,
        subscriptions: &[FeatureUsageSubscription],
        section: FeatureConfigurationSection,
    ) -> Result<(), FeatureError> {
        match section {
            FeatureConfigurationSection::Runtime => {
                Ok(self.runtime.kernel_mut().unsubscribe_usage_notifications(subscriptions)?)
            }
            FeatureConfigurationSection::Boot => {
                let removed = self.boot.remove_subscriptions(subscriptions)?;
                tracing::debug!(removed, "removed persisted usage subscriptions");
                Ok(())
            }
        }
    }

    /// # Errors
    /// Native status of the call.
    pub fn notify_usage(&mut self, report: &FeatureUsageReport) -> Result<(), FeatureError> {
        Ok(self.runtime.kernel_mut().notify_feature_usage(report)?)
    }

    pub fn fix_lkg_store(&mut self) -> RepairOutcome {
        self.boot.fix_lkg_store()
    }

    /// # Errors
    /// Native status of the read.
    pub fn boot_state(&self) -> Result<BootFeatureConfigurationState, FeatureError> {
        self.runtime.boot_state()
    }

    /// # Errors
    /// Native status of the write.
    pub fn set_boot_state(&mut self, state: BootFeatureConfigurationState) -> Result<(), FeatureError> {
        self.runtime.set_boot_state(state)
    }

    /// Recreate the boot status data, which returns the boot state to
    /// `Uninitialized`.
    ///
    /// # Errors
    /// Native status of the call.
    pub fn initialize_boot_status_data_file(&mut self) -> Result<(), FeatureError> {
        self.runtime.initialize_boot_status_data_file()
    }

    /// Runtime records plus the boot configuration the next boot would see:
    /// the kernel's boot section overlaid with pending hive overrides.
    ///
    /// # Errors
    /// Native status or hive failure.
    pub fn snapshot(&self) -> Result<ConfigurationSnapshot, FeatureError> {
        let (runtime, _) = self.runtime.query_all(FeatureConfigurationSection::Runtime)?;
        let (loaded, _) = self.runtime.query_all(FeatureConfigurationSection::Boot)?;
        let mut boot = SectionState::from_records(loaded);
        for record in self.boot.pending_overrides()? {
            boot.insert(record);
        }
        Ok(ConfigurationSnapshot { runtime, boot: boot.records() })
    }

    /// # Errors
    /// See [`Self::snapshot`].
    pub fn export(&self) -> Result<Vec<u8>, FeatureError> {
        self.snapshot()?.to_bytes()
    }

    /// Apply an exported blob: runtime section first, then boot.
    ///
    /// Protected tiers and records in the reserved enabled state are dropped
    /// silently and counted. UserPolicy records carry only their enabled
    /// state. The whole blob is parsed and turned
    /// into updates before anything is written.
    ///
    /// # Errors
    /// [`FeatureError::MalformedBlob`] or an unwritable record before any
    /// write; store failures after.
    pub fn import(&mut self, blob: &[u8]) -> Result<ImportSummary, FeatureError> {
        let snapshot = ConfigurationSnapshot::from_bytes(blob)?;
        let mut summary = ImportSummary::default();
        let runtime_updates = import_updates(&snapshot.runtime, &mut summary)?;
        let boot_updates = import_updates(&snapshot.boot, &mut summary)?;

        if !runtime_updates.is_empty() {
            let mut previous = 0;
            self.apply(&runtime_updates, FeatureConfigurationSection::Runtime, &mut previous)?;
            summary.runtime_applied = runtime_updates.len();
        }
        if !boot_updates.is_empty() {
            let mut previous = 0;
            let report = self.apply(&boot_updates, FeatureConfigurationSection::Boot, &mut previous)?;
            summary.boot_applied = boot_updates.len();
            summary.bookkeeping = report.bookkeeping;
        }
        tracing::info!(
            runtime = summary.runtime_applied,
            boot = summary.boot_applied,
            dropped_protected = summary.dropped_protected,
            dropped_reserved = summary.dropped_reserved,
            "imported feature configurations"
        );
        Ok(summary)
    }

    /// Reset every writable tier of every feature in a section.
    ///
    /// For the boot section this covers the kernel's loaded boot records and
    /// the pending hive overrides.
    ///
    /// # Errors
    /// As [`Self::apply`].
    pub fn full_reset(&mut self, section: FeatureConfigurationSection) -> Result<ApplyReport, FeatureError> {
        let (mut records, _) = self.runtime.query_all(section)?;
        if section == FeatureConfigurationSection::Boot {
            records.extend(self.boot.pending_overrides()?);
        }

        let targets: BTreeSet<(u32, FeaturePriority)> = records
            .iter()
            .filter(|record| !record.priority().is_protected())
            .map(|record| (record.feature_id(), record.priority()))
            .collect();
        let updates: Vec<FeatureConfigurationUpdate> = targets
            .into_iter()
            .map(|(feature_id, priority)| FeatureConfigurationUpdate::reset(feature_id, priority))
            .collect();

        if updates.is_empty() {
            return Ok(ApplyReport { section, applied: 0, bookkeeping: None });
        }
        let mut previous = 0;
        self.apply(&updates, section, &mut previous)
    }
}

fn import_updates(
    records: &[FeatureConfiguration],
    summary: &mut ImportSummary,
) -> Result<Vec<FeatureConfigurationUpdate>, FeatureError> {
    let mut updates = Vec::with_capacity(records.len());
    for record in records {
        if record.priority().is_protected() {
            summary.dropped_protected += 1;
            continue;
        }
        if record.enabled_state() == FeatureEnabledState::Reserved {
            summary.dropped_reserved += 1;
            continue;
        }
        let update = if record.priority() == FeaturePriority::USER_POLICY {
            FeatureConfigurationUpdate::feature_state(
                record.feature_id(),
                record.priority(),
                record.enabled_state(),
            )?
        } else {
            FeatureConfigurationUpdate::from_record(
                record,
                FeatureConfigurationOperation::FEATURE_STATE
                    | FeatureConfigurationOperation::VARIANT_STATE,
            )?
        };
        updates.push(update);
    }
    Ok(updates)
}
