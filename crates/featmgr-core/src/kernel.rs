//! Emulation of the kernel side of [`FeatureSyscalls`].
//!
//! Used by tests, dry runs and the SQLite-backed kernel, which persists a
//! [`SectionState`] per section and reuses the write rules defined here.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use crate::error::{FeatureError, NtStatus};
use crate::record::{EnabledStateOptions, FeatureConfiguration, FeaturePriority};
use crate::runtime::{
    ChangeCallback, FeatureConfigurationSection, FeatureSyscalls, NotificationHandle,
};
use crate::subscriptions::{FeatureUsageReport, FeatureUsageSubscription};
use crate::update::{FeatureConfigurationOperation, FeatureConfigurationUpdate};

/// One section's records keyed by `(feature id, priority)`.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SectionState {
    records: BTreeMap<(u32, FeaturePriority), FeatureConfiguration>,
}

impl SectionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = FeatureConfiguration>) -> Self {
        let mut state = Self::new();
        for record in records {
            state.insert(record);
        }
        state
    }

    /// Store `record` as-is, bypassing the write rules. Used to seed tiers a
    /// caller may not write.
    pub fn insert(&mut self, record: FeatureConfiguration) {
        self.records.insert((record.feature_id(), record.priority()), record);
    }

    /// Records ordered by feature id, then priority.
    #[must_use]
    pub fn records(&self) -> Vec<FeatureConfiguration> {
        self.records.values().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Effective record for a feature: the highest-numbered tier present.
    #[must_use]
    pub fn resolve(&self, feature_id: u32) -> Option<FeatureConfiguration> {
        self.records
            .range((feature_id, FeaturePriority::IMAGE_DEFAULT)..=(feature_id, FeaturePriority::IMAGE_OVERRIDE))
            .next_back()
            .map(|(_, record)| *record)
    }

    /// Apply one update.
    ///
    /// `ResetState` removes the tier entirely; otherwise the entry is created
    /// on demand and the requested parts overwritten.
    ///
    /// # Errors
    /// Returns [`FeatureError::FieldOverflow`] if the update's variant does
    /// not fit the record.
    pub fn apply(&mut self, update: &FeatureConfigurationUpdate) -> Result<(), FeatureError> {
        let key = (update.feature_id(), update.priority());
        let operation = update.operation();
        if operation.contains(FeatureConfigurationOperation::RESET_STATE) {
            self.records.remove(&key);
            return Ok(());
        }

        let record = self
            .records
            .entry(key)
            .or_insert_with(|| FeatureConfiguration::new(update.feature_id(), update.priority()));
        if operation.contains(FeatureConfigurationOperation::FEATURE_STATE) {
            record.set_enabled_state(update.enabled_state());
            record.set_experiment(update.enabled_state_options() == EnabledStateOptions::WexpConfig);
        }
        if operation.contains(FeatureConfigurationOperation::VARIANT_STATE) {
            record.set_variant(u32::from(update.variant()))?;
            record.set_variant_payload_kind(update.variant_payload_kind());
            record.set_variant_payload(update.variant_payload());
        }
        Ok(())
    }

    /// Apply a batch all-or-nothing.
    ///
    /// # Errors
    /// Returns the first update's error; `self` is left unchanged.
    pub fn apply_all(&mut self, updates: &[FeatureConfigurationUpdate]) -> Result<(), FeatureError> {
        let mut next = self.clone();
        for update in updates {
            next.apply(update)?;
        }
        *self = next;
        Ok(())
    }
}

/// Kernel-side admission check for a write through the call surface.
///
/// The boot section has no set call, and a non-zero previous stamp must
/// still be current.
///
/// # Errors
/// [`NtStatus::INVALID_PARAMETER`] for the boot section,
/// [`NtStatus::UNSUCCESSFUL`] for a stale stamp.
pub fn admit_write(
    section: FeatureConfigurationSection,
    previous_change_stamp: u64,
    current_change_stamp: u64,
) -> Result<(), NtStatus> {
    if section == FeatureConfigurationSection::Boot {
        return Err(NtStatus::INVALID_PARAMETER);
    }
    if previous_change_stamp != 0 && previous_change_stamp != current_change_stamp {
        return Err(NtStatus::UNSUCCESSFUL);
    }
    Ok(())
}

/// Set each record's `has_subscriptions` flag from the live subscription list.
pub fn mark_subscribed(
    records: &mut [FeatureConfiguration],
    subscriptions: &[FeatureUsageSubscription],
) {
    for record in records {
        let subscribed = subscriptions
            .iter()
            .any(|subscription| subscription.feature_id == record.feature_id());
        record.set_has_subscriptions(subscribed);
    }
}

/// A usage report is accepted only when someone subscribed to it.
///
/// # Errors
/// [`NtStatus::NOT_FOUND`] when no subscription has the report's feature id
/// and reporting kind.
pub fn admit_usage_report(
    report: &FeatureUsageReport,
    subscriptions: &[FeatureUsageSubscription],
) -> Result<(), NtStatus> {
    let subscribed = subscriptions.iter().any(|subscription| {
        subscription.feature_id == report.feature_id
            && subscription.reporting_kind == report.reporting_kind
    });
    if subscribed {
        Ok(())
    } else {
        Err(NtStatus::NOT_FOUND)
    }
}

struct Notification {
    callback: ChangeCallback,
    wait_for: Option<u64>,
}

/// [`FeatureSyscalls`] over process memory.
///
/// The runtime section is writable through the call surface; the boot
/// section can only be seeded. The change stamp starts at zero and moves by
/// one per successful mutation.
#[derive(Default)]
pub struct InMemoryFeatureKernel {
    runtime: SectionState,
    boot: SectionState,
    change_stamp: u64,
    notifications: BTreeMap<u64, Notification>,
    next_handle: u64,
    subscriptions: Vec<FeatureUsageSubscription>,
    usage_reports: Vec<FeatureUsageReport>,
    boot_status: BTreeMap<u32, u32>,
}

impl Debug for InMemoryFeatureKernel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryFeatureKernel")
            .field("runtime", &self.runtime)
            .field("boot", &self.boot)
            .field("change_stamp", &self.change_stamp)
            .field("notifications", &self.notifications.len())
            .field("subscriptions", &self.subscriptions)
            .field("usage_reports", &self.usage_reports)
            .field("boot_status", &self.boot_status)
            .finish()
    }
}

impl InMemoryFeatureKernel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_runtime_configurations(
        mut self,
        records: impl IntoIterator<Item = FeatureConfiguration>,
    ) -> Self {
        for record in records {
            self.runtime.insert(record);
        }
        self
    }

    #[must_use]
    pub fn with_boot_configurations(
        mut self,
        records: impl IntoIterator<Item = FeatureConfiguration>,
    ) -> Self {
        for record in records {
            self.boot.insert(record);
        }
        self
    }

    /// Reports accepted by `notify_feature_usage`, oldest first.
    #[must_use]
    pub fn usage_reports(&self) -> &[FeatureUsageReport] {
        &self.usage_reports
    }

    fn section(&self, section: FeatureConfigurationSection) -> &SectionState {
        match section {
            FeatureConfigurationSection::Boot => &self.boot,
            FeatureConfigurationSection::Runtime => &self.runtime,
        }
    }

    fn bump_change_stamp(&mut self) {
        self.change_stamp += 1;
        let stamp = self.change_stamp;
        for notification in self.notifications.values_mut() {
            let due = match notification.wait_for {
                Some(wait_for) => stamp > wait_for,
                None => true,
            };
            if due {
                (notification.callback)(stamp);
            }
        }
    }
}

impl FeatureSyscalls for InMemoryFeatureKernel {
    fn query_feature_configurations(
        &self,
        section: FeatureConfigurationSection,
    ) -> Result<(Vec<FeatureConfiguration>, u64), NtStatus> {
        let mut records = self.section(section).records();
        mark_subscribed(&mut records, &self.subscriptions);
        Ok((records, self.change_stamp))
    }

    fn query_feature_configuration(
        &self,
        feature_id: u32,
        section: FeatureConfigurationSection,
    ) -> Result<(FeatureConfiguration, u64), NtStatus> {
        let record = self.section(section).resolve(feature_id).ok_or(NtStatus::NOT_FOUND)?;
        let mut records = [record];
        mark_subscribed(&mut records, &self.subscriptions);
        Ok((records[0], self.change_stamp))
    }

    fn query_change_stamp(&self) -> Result<u64, NtStatus> {
        Ok(self.change_stamp)
    }

    fn set_feature_configurations(
        &mut self,
        section: FeatureConfigurationSection,
        updates: &[FeatureConfigurationUpdate],
        previous_change_stamp: u64,
    ) -> Result<u64, NtStatus> {
        admit_write(section, previous_change_stamp, self.change_stamp)?;
        self.runtime.apply_all(updates).map_err(|_| NtStatus::INVALID_PARAMETER)?;
        self.bump_change_stamp();
        Ok(self.change_stamp)
    }

    fn register_change_notification(
        &mut self,
        callback: ChangeCallback,
        wait_for: Option<u64>,
    ) -> Result<NotificationHandle, NtStatus> {
        self.next_handle += 1;
        self.notifications.insert(self.next_handle, Notification { callback, wait_for });
        Ok(NotificationHandle(self.next_handle))
    }

    fn unregister_change_notification(
        &mut self,
        handle: NotificationHandle,
    ) -> Result<(), NtStatus> {
        self.notifications
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(NtStatus::INVALID_PARAMETER)
    }

    fn query_usage_subscriptions(&self) -> Result<Vec<FeatureUsageSubscription>, NtStatus> {
        Ok(self.subscriptions.clone())
    }

    fn subscribe_usage_notifications(
        &mut self,
        subscriptions: &[FeatureUsageSubscription],
    ) -> Result<(), NtStatus> {
        self.subscriptions.extend_from_slice(subscriptions);
        Ok(())
    }

    fn unsubscribe_usage_notifications(
        &mut self,
        subscriptions: &[FeatureUsageSubscription],
    ) -> Result<(), NtStatus> {
        self.subscriptions
            .retain(|live| !subscriptions.iter().any(|removed| removed.matches_live(live)));
        Ok(())
    }

    fn notify_feature_usage(&mut self, report: &FeatureUsageReport) -> Result<(), NtStatus> {
        admit_usage_report(report, &self.subscriptions)?;
        self.usage_reports.push(*report);
        Ok(())
    }

    fn get_system_boot_status(&self, item: u32) -> Result<u32, NtStatus> {
        Ok(self.boot_status.get(&item).copied().unwrap_or_default())
    }

    fn set_system_boot_status(&mut self, item: u32, value: u32) -> Result<(), NtStatus> {
        self.boot_status.insert(item, value);
        Ok(())
    }

    fn create_boot_status_data_file(&mut self) -> Result<(), NtStatus> {
        self.boot_status.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FeatureEnabledState, VariantPayloadKind};

    fn record(feature_id: u32, priority: FeaturePriority, state: FeatureEnabledState) -> FeatureConfiguration {
        let mut record = FeatureConfiguration::new(feature_id, priority);
        record.set_enabled_state(state);
        record
    }

    #[test]
    fn resolve_prefers_highest_tier() {
        let state = SectionState::from_records([
            record(7, FeaturePriority::SERVICE, FeatureEnabledState::Disabled),
            record(7, FeaturePriority::USER, FeatureEnabledState::Enabled),
            record(8, FeaturePriority::TEST, FeatureEnabledState::Disabled),
        ]);
        assert_eq!(state.resolve(7).map(|found| found.priority()), Some(FeaturePriority::USER));
        assert_eq!(state.resolve(6), None);
    }

    #[test]
    fn apply_sets_requested_parts_and_reset_removes_tier() -> Result<(), FeatureError> {
        let mut state = SectionState::new();
        let mut update = FeatureConfigurationUpdate::feature_state(
            3,
            FeaturePriority::USER,
            FeatureEnabledState::Enabled,
        )?;
        update.set_enabled_state_options(EnabledStateOptions::WexpConfig);
        update.set_variant(4)?;
        update.set_variant_payload_kind(VariantPayloadKind::External);
        update.set_variant_payload(99);
        update.set_operation(
            FeatureConfigurationOperation::FEATURE_STATE
                | FeatureConfigurationOperation::VARIANT_STATE,
        );
        state.apply(&update)?;

        let stored = state.resolve(3);
        assert_eq!(stored.map(|found| found.is_experiment()), Some(true));
        assert_eq!(stored.map(|found| found.variant()), Some(4));
        assert_eq!(stored.map(|found| found.variant_payload()), Some(99));

        let reset = FeatureConfigurationUpdate::reset(3, FeaturePriority::USER);
        state.apply(&reset)?;
        let after_first = state.clone();
        state.apply(&reset)?;
        assert!(state.is_empty());
        assert_eq!(state, after_first);
        Ok(())
    }

    #[test]
    fn kernel_rejects_boot_writes_and_stale_stamps() -> Result<(), FeatureError> {
        let mut kernel = InMemoryFeatureKernel::new();
        let update =
            FeatureConfigurationUpdate::feature_state(1, FeaturePriority::USER, FeatureEnabledState::Enabled)?;
        assert_eq!(
            kernel.set_feature_configurations(FeatureConfigurationSection::Boot, &[update], 0),
            Err(NtStatus::INVALID_PARAMETER)
        );
        assert_eq!(kernel.set_feature_configurations(FeatureConfigurationSection::Runtime, &[update], 0), Ok(1));
        assert_eq!(
            kernel.set_feature_configurations(FeatureConfigurationSection::Runtime, &[update], 7),
            Err(NtStatus::UNSUCCESSFUL)
        );
        assert_eq!(kernel.query_change_stamp(), Ok(1));
        Ok(())
    }

    #[test]
    fn live_subscriptions_flag_records_and_gate_reports() {
        let mut kernel = InMemoryFeatureKernel::new()
            .with_runtime_configurations([record(5, FeaturePriority::IMAGE_DEFAULT, FeatureEnabledState::Enabled)]);
        let subscription = FeatureUsageSubscription {
            feature_id: 5,
            reporting_kind: 2,
            reporting_options: 0,
            reporting_target: 77,
        };
        let report = FeatureUsageReport { feature_id: 5, reporting_kind: 2, reporting_options: 0 };

        assert_eq!(kernel.notify_feature_usage(&report), Err(NtStatus::NOT_FOUND));
        assert_eq!(kernel.subscribe_usage_notifications(&[subscription]), Ok(()));
        assert_eq!(
            kernel
                .query_feature_configuration(5, FeatureConfigurationSection::Runtime)
                .map(|(found, _)| found.has_subscriptions()),
            Ok(true)
        );
        assert_eq!(kernel.notify_feature_usage(&report), Ok(()));
        assert_eq!(kernel.usage_reports(), &[report]);

        let other_options = FeatureUsageSubscription { reporting_options: 9, ..subscription };
        assert_eq!(kernel.unsubscribe_usage_notifications(&[other_options]), Ok(()));
        assert_eq!(kernel.query_usage_subscriptions(), Ok(Vec::new()));
    }
}
