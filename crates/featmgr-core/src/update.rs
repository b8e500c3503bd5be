use serde::Serialize;

use crate::error::FeatureError;
use crate::record::{
    checked_variant, EnabledStateOptions, FeatureConfiguration, FeatureEnabledState,
    FeaturePriority, VariantPayloadKind,
};

/// Which parts of a feature's configuration an update intends to change.
///
/// Independent intents combined as bit flags, matching the kernel's
/// operation mask.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash, Default)]
#[serde(transparent)]
pub struct FeatureConfigurationOperation(u32);

impl FeatureConfigurationOperation {
    pub const NONE: Self = Self(0);
    pub const FEATURE_STATE: Self = Self(1);
    pub const VARIANT_STATE: Self = Self(2);
    pub const RESET_STATE: Self = Self(4);

    const ALL_BITS: u32 = 0x7;

    /// # Errors
    /// Returns [`FeatureError::FieldOverflow`] when undefined bits are set.
    pub fn from_raw(raw: u32) -> Result<Self, FeatureError> {
        if raw & !Self::ALL_BITS != 0 {
            return Err(FeatureError::FieldOverflow { field: "Operation", max: Self::ALL_BITS });
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for FeatureConfigurationOperation {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for FeatureConfigurationOperation {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A requested mutation of one feature at one priority.
///
/// Fields stay unpacked and every setter checks its bit width on assignment,
/// so a batch can be validated before any store is touched.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash)]
pub struct FeatureConfigurationUpdate {
    feature_id: u32,
    priority: FeaturePriority,
    enabled_state: FeatureEnabledState,
    enabled_state_options: EnabledStateOptions,
    variant: u8,
    variant_payload_kind: VariantPayloadKind,
    variant_payload: u32,
    operation: FeatureConfigurationOperation,
}

impl FeatureConfigurationUpdate {
    #[must_use]
    pub fn new(feature_id: u32, priority: FeaturePriority) -> Self {
        Self {
            feature_id,
            priority,
            enabled_state: FeatureEnabledState::Default,
            enabled_state_options: EnabledStateOptions::None,
            variant: 0,
            variant_payload_kind: VariantPayloadKind::None,
            variant_payload: 0,
            operation: FeatureConfigurationOperation::NONE,
        }
    }

    /// Update that only sets the enabled state.
    ///
    /// # Errors
    /// Returns [`FeatureError::FieldOverflow`] for the reserved state.
    pub fn feature_state(
        feature_id: u32,
        priority: FeaturePriority,
        enabled_state: FeatureEnabledState,
    ) -> Result<Self, FeatureError> {
        let mut update = Self::new(feature_id, priority);
        update.set_enabled_state(enabled_state)?;
        update.operation = FeatureConfigurationOperation::FEATURE_STATE;
        Ok(update)
    }

    #[must_use]
    pub fn reset(feature_id: u32, priority: FeaturePriority) -> Self {
        let mut update = Self::new(feature_id, priority);
        update.operation = FeatureConfigurationOperation::RESET_STATE;
        update
    }

    /// Update that restates `record` with the given intents.
    ///
    /// The experiment flag maps onto `WexpConfig`. A reserved enabled state is
    /// rejected because it can never be written.
    ///
    /// # Errors
    /// Returns [`FeatureError::FieldOverflow`] when the record carries the
    /// reserved enabled state and `operation` includes `FeatureState`.
    pub fn from_record(
        record: &FeatureConfiguration,
        operation: FeatureConfigurationOperation,
    ) -> Result<Self, FeatureError> {
        let mut update = Self::new(record.feature_id(), record.priority());
        if operation.contains(FeatureConfigurationOperation::FEATURE_STATE) {
            update.set_enabled_state(record.enabled_state())?;
            if record.is_experiment() {
                update.enabled_state_options = EnabledStateOptions::WexpConfig;
            }
        }
        if operation.contains(FeatureConfigurationOperation::VARIANT_STATE) {
            update.variant = record.variant();
            update.variant_payload_kind = record.variant_payload_kind();
            update.variant_payload = record.variant_payload();
        }
        update.operation = operation;
        Ok(update)
    }

    #[must_use]
    pub fn feature_id(&self) -> u32 {
        self.feature_id
    }

    #[must_use]
    pub fn priority(&self) -> FeaturePriority {
        self.priority
    }

    #[must_use]
    pub fn enabled_state(&self) -> FeatureEnabledState {
        self.enabled_state
    }

    #[must_use]
    pub fn enabled_state_options(&self) -> EnabledStateOptions {
        self.enabled_state_options
    }

    #[must_use]
    pub fn variant(&self) -> u8 {
        self.variant
    }

    #[must_use]
    pub fn variant_payload_kind(&self) -> VariantPayloadKind {
        self.variant_payload_kind
    }

    #[must_use]
    pub fn variant_payload(&self) -> u32 {
        self.variant_payload
    }

    #[must_use]
    pub fn operation(&self) -> FeatureConfigurationOperation {
        self.operation
    }

    pub fn set_priority(&mut self, priority: FeaturePriority) {
        self.priority = priority;
    }

    /// # Errors
    /// Returns [`FeatureError::FieldOverflow`] for the reserved state.
    pub fn set_enabled_state(&mut self, state: FeatureEnabledState) -> Result<(), FeatureError> {
        if state == FeatureEnabledState::Reserved {
            return Err(FeatureError::FieldOverflow { field: "EnabledState", max: 2 });
        }
        self.enabled_state = state;
        Ok(())
    }

    pub fn set_enabled_state_options(&mut self, options: EnabledStateOptions) {
        self.enabled_state_options = options;
    }

    /// # Errors
    /// Returns [`FeatureError::FieldOverflow`] when `variant` exceeds 63.
    pub fn set_variant(&mut self, variant: u32) -> Result<(), FeatureError> {
        self.variant = checked_variant(variant)?;
        Ok(())
    }

    pub fn set_variant_payload_kind(&mut self, kind: VariantPayloadKind) {
        self.variant_payload_kind = kind;
    }

    pub fn set_variant_payload(&mut self, payload: u32) {
        self.variant_payload = payload;
    }

    pub fn set_operation(&mut self, operation: FeatureConfigurationOperation) {
        self.operation = operation;
    }

    /// A UserPolicy override can only carry an enabled state.
    #[must_use]
    pub fn is_user_policy_compatible(&self) -> bool {
        self.enabled_state_options == EnabledStateOptions::None
            && self.variant == 0
            && self.variant_payload_kind == VariantPayloadKind::None
            && self.variant_payload == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_flags_combine_and_reject_unknown_bits() -> Result<(), FeatureError> {
        let both = FeatureConfigurationOperation::FEATURE_STATE
            | FeatureConfigurationOperation::VARIANT_STATE;
        assert!(both.contains(FeatureConfigurationOperation::FEATURE_STATE));
        assert!(both.contains(FeatureConfigurationOperation::VARIANT_STATE));
        assert!(!both.contains(FeatureConfigurationOperation::RESET_STATE));
        assert!(!both.contains(FeatureConfigurationOperation::NONE));
        assert_eq!(FeatureConfigurationOperation::from_raw(3)?, both);
        assert!(FeatureConfigurationOperation::from_raw(8).is_err());
        Ok(())
    }

    #[test]
    fn setters_enforce_field_widths() {
        let mut update = FeatureConfigurationUpdate::new(1, FeaturePriority::USER);
        assert!(update.set_variant(64).is_err());
        assert!(update.set_variant(63).is_ok());
        assert_eq!(
            update.set_enabled_state(FeatureEnabledState::Reserved),
            Err(FeatureError::FieldOverflow { field: "EnabledState", max: 2 })
        );
        assert_eq!(update.enabled_state(), FeatureEnabledState::Default);
    }

    #[test]
    fn user_policy_compatibility_only_allows_enabled_state() -> Result<(), FeatureError> {
        let mut update = FeatureConfigurationUpdate::feature_state(
            1,
            FeaturePriority::USER_POLICY,
            FeatureEnabledState::Enabled,
        )?;
        assert!(update.is_user_policy_compatible());

        update.set_variant_payload(1);
        assert!(!update.is_user_policy_compatible());
        update.set_variant_payload(0);

        update.set_enabled_state_options(EnabledStateOptions::WexpConfig);
        assert!(!update.is_user_policy_compatible());
        Ok(())
    }

    #[test]
    fn from_record_copies_only_requested_intents() -> Result<(), FeatureError> {
        let mut record = FeatureConfiguration::new(42, FeaturePriority::SERVICE);
        record.set_enabled_state(FeatureEnabledState::Disabled);
        record.set_experiment(true);
        record.set_variant(9)?;
        record.set_variant_payload(77);

        let state_only =
            FeatureConfigurationUpdate::from_record(&record, FeatureConfigurationOperation::FEATURE_STATE)?;
        assert_eq!(state_only.enabled_state(), FeatureEnabledState::Disabled);
        assert_eq!(state_only.enabled_state_options(), EnabledStateOptions::WexpConfig);
        assert_eq!(state_only.variant(), 0);

        let all = FeatureConfigurationUpdate::from_record(
            &record,
            FeatureConfigurationOperation::FEATURE_STATE
                | FeatureConfigurationOperation::VARIANT_STATE,
        )?;
        assert_eq!(all.variant(), 9);
        assert_eq!(all.variant_payload(), 77);
        Ok(())
    }
}
