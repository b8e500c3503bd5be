use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FeatureError;

/// Size of one packed record: feature id, compact state, variant payload.
pub const RECORD_SIZE: usize = 12;

const PRIORITY_MASK: u32 = 0xF;
const ENABLED_STATE_SHIFT: u32 = 4;
const ENABLED_STATE_MASK: u32 = 0x3;
const EXPERIMENT_SHIFT: u32 = 6;
const SUBSCRIPTIONS_SHIFT: u32 = 7;
const VARIANT_SHIFT: u32 = 8;
const VARIANT_MASK: u32 = 0x3F;
const PAYLOAD_KIND_SHIFT: u32 = 14;
const PAYLOAD_KIND_MASK: u32 = 0x3;

pub const MAX_VARIANT: u32 = 63;
pub const MAX_PRIORITY: u32 = 15;

/// Precedence tier of a configuration.
///
/// The tier is a 4-bit value. Only the named tiers are assigned by the OS,
/// but every 4-bit value is preserved so decoding stays total. Resolution
/// order between tiers is owned by the OS, not by numeric comparison.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "u32", into = "u32")]
pub struct FeaturePriority(u8);

impl FeaturePriority {
    pub const IMAGE_DEFAULT: Self = Self(0);
    pub const ENROLLMENT: Self = Self(2);
    pub const SERVICE: Self = Self(4);
    pub const USER: Self = Self(8);
    pub const SECURITY: Self = Self(9);
    pub const USER_POLICY: Self = Self(10);
    pub const TEST: Self = Self(12);
    pub const IMAGE_OVERRIDE: Self = Self(15);

    /// # Errors
    /// Returns [`FeatureError::FieldOverflow`] when `raw` does not fit in 4 bits.
    pub fn from_raw(raw: u32) -> Result<Self, FeatureError> {
        if raw > MAX_PRIORITY {
            return Err(FeatureError::FieldOverflow { field: "Priority", max: MAX_PRIORITY });
        }
        Ok(Self(low_byte(raw)))
    }

    pub(crate) fn from_bits(bits: u32) -> Self {
        Self(low_byte(bits & PRIORITY_MASK))
    }

    #[must_use]
    pub fn value(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::IMAGE_DEFAULT => Some("ImageDefault"),
            Self::ENROLLMENT => Some("Enrollment"),
            Self::SERVICE => Some("Service"),
            Self::USER => Some("User"),
            Self::SECURITY => Some("Security"),
            Self::USER_POLICY => Some("UserPolicy"),
            Self::TEST => Some("Test"),
            Self::IMAGE_OVERRIDE => Some("ImageOverride"),
            _ => None,
        }
    }

    /// Tiers a non-kernel caller may never write.
    #[must_use]
    pub fn is_protected(self) -> bool {
        matches!(self, Self::IMAGE_DEFAULT | Self::SECURITY | Self::IMAGE_OVERRIDE)
    }
}

impl Default for FeaturePriority {
    fn default() -> Self {
        Self::IMAGE_DEFAULT
    }
}

impl TryFrom<u32> for FeaturePriority {
    type Error = FeatureError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_raw(value)
    }
}

impl From<FeaturePriority> for u32 {
    fn from(value: FeaturePriority) -> Self {
        u32::from(value.0)
    }
}

impl Display for FeaturePriority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "Reserved ({})", self.0),
        }
    }
}

impl FromStr for FeaturePriority {
    type Err = FeatureError;

    /// Accepts a tier name (case-insensitive) or its numeric value.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if let Ok(raw) = trimmed.parse::<u32>() {
            return Self::from_raw(raw);
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "imagedefault" => Ok(Self::IMAGE_DEFAULT),
            "enrollment" => Ok(Self::ENROLLMENT),
            "service" => Ok(Self::SERVICE),
            "user" => Ok(Self::USER),
            "security" => Ok(Self::SECURITY),
            "userpolicy" => Ok(Self::USER_POLICY),
            "test" => Ok(Self::TEST),
            "imageoverride" => Ok(Self::IMAGE_OVERRIDE),
            _ => Err(FeatureError::FieldOverflow { field: "Priority", max: MAX_PRIORITY }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeatureEnabledState {
    #[default]
    Default,
    Disabled,
    Enabled,
    /// Legacy fourth value of the 2-bit field. Readable, never writable.
    Reserved,
}

impl FeatureEnabledState {
    /// # Errors
    /// Returns [`FeatureError::FieldOverflow`] for anything above `Enabled`.
    pub fn from_raw(raw: u32) -> Result<Self, FeatureError> {
        match raw {
            0 => Ok(Self::Default),
            1 => Ok(Self::Disabled),
            2 => Ok(Self::Enabled),
            _ => Err(FeatureError::FieldOverflow { field: "EnabledState", max: 2 }),
        }
    }

    pub(crate) fn from_bits(bits: u32) -> Self {
        match bits & ENABLED_STATE_MASK {
            0 => Self::Default,
            1 => Self::Disabled,
            2 => Self::Enabled,
            _ => Self::Reserved,
        }
    }

    #[must_use]
    pub fn value(self) -> u32 {
        match self {
            Self::Default => 0,
            Self::Disabled => 1,
            Self::Enabled => 2,
            Self::Reserved => 3,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
            Self::Reserved => "reserved",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnabledStateOptions {
    #[default]
    None,
    WexpConfig,
}

impl EnabledStateOptions {
    /// # Errors
    /// Returns [`FeatureError::FieldOverflow`] for anything above `WexpConfig`.
    pub fn from_raw(raw: u32) -> Result<Self, FeatureError> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::WexpConfig),
            _ => Err(FeatureError::FieldOverflow { field: "EnabledStateOptions", max: 1 }),
        }
    }

    #[must_use]
    pub fn value(self) -> u32 {
        match self {
            Self::None => 0,
            Self::WexpConfig => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariantPayloadKind {
    #[default]
    None,
    Resident,
    External,
    Reserved,
}

impl VariantPayloadKind {
    /// # Errors
    /// Returns [`FeatureError::FieldOverflow`] when `raw` does not fit in 2 bits.
    pub fn from_raw(raw: u32) -> Result<Self, FeatureError> {
        if raw > PAYLOAD_KIND_MASK {
            return Err(FeatureError::FieldOverflow {
                field: "VariantPayloadKind",
                max: PAYLOAD_KIND_MASK,
            });
        }
        Ok(Self::from_bits(raw))
    }

    pub(crate) fn from_bits(bits: u32) -> Self {
        match bits & PAYLOAD_KIND_MASK {
            0 => Self::None,
            1 => Self::Resident,
            2 => Self::External,
            _ => Self::Reserved,
        }
    }

    #[must_use]
    pub fn value(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Resident => 1,
            Self::External => 2,
            Self::Reserved => 3,
        }
    }
}

/// Authoritative state of one feature at one priority, as read from a store.
///
/// Fields are kept unpacked; [`FeatureConfiguration::compact_state`] packs
/// them into the kernel's 32-bit layout.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash, Default)]
pub struct FeatureConfiguration {
    feature_id: u32,
    priority: FeaturePriority,
    enabled_state: FeatureEnabledState,
    is_experiment: bool,
    has_subscriptions: bool,
    variant: u8,
    variant_payload_kind: VariantPayloadKind,
    variant_payload: u32,
}

impl FeatureConfiguration {
    #[must_use]
    pub fn new(feature_id: u32, priority: FeaturePriority) -> Self {
        Self { feature_id, priority, ..Self::default() }
    }

    /// Rebuild a record from its three wire words. Reserved bits are ignored.
    #[must_use]
    pub fn from_parts(feature_id: u32, compact_state: u32, variant_payload: u32) -> Self {
        Self {
            feature_id,
            priority: FeaturePriority::from_bits(compact_state),
            enabled_state: FeatureEnabledState::from_bits(compact_state >> ENABLED_STATE_SHIFT),
            is_experiment: (compact_state >> EXPERIMENT_SHIFT) & 1 == 1,
            has_subscriptions: (compact_state >> SUBSCRIPTIONS_SHIFT) & 1 == 1,
            variant: low_byte((compact_state >> VARIANT_SHIFT) & VARIANT_MASK),
            variant_payload_kind: VariantPayloadKind::from_bits(
                compact_state >> PAYLOAD_KIND_SHIFT,
            ),
            variant_payload,
        }
    }

    #[must_use]
    pub fn compact_state(&self) -> u32 {
        u32::from(self.priority.value())
            | (self.enabled_state.value() << ENABLED_STATE_SHIFT)
            | (u32::from(self.is_experiment) << EXPERIMENT_SHIFT)
            | (u32::from(self.has_subscriptions) << SUBSCRIPTIONS_SHIFT)
            | (u32::from(self.variant) << VARIANT_SHIFT)
            | (self.variant_payload_kind.value() << PAYLOAD_KIND_SHIFT)
    }

    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0_u8; RECORD_SIZE];
        bytes[0..4].copy_from_slice(&self.feature_id.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.compact_state().to_le_bytes());
        bytes[8..12].copy_from_slice(&self.variant_payload.to_le_bytes());
        bytes
    }

    #[must_use]
    pub fn decode(bytes: &[u8; RECORD_SIZE]) -> Self {
        Self::from_parts(
            read_u32(bytes, 0),
            read_u32(bytes, 4),
            read_u32(bytes, 8),
        )
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
    pub fn is_experiment(&self) -> bool {
        self.is_experiment
    }

    #[must_use]
    pub fn has_subscriptions(&self) -> bool {
        self.has_subscriptions
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

    pub fn set_feature_id(&mut self, feature_id: u32) {
        self.feature_id = feature_id;
    }

    pub fn set_priority(&mut self, priority: FeaturePriority) {
        self.priority = priority;
    }

    pub fn set_enabled_state(&mut self, enabled_state: FeatureEnabledState) {
        self.enabled_state = enabled_state;
    }

    pub fn set_experiment(&mut self, is_experiment: bool) {
        self.is_experiment = is_experiment;
    }

    pub fn set_has_subscriptions(&mut self, has_subscriptions: bool) {
        self.has_subscriptions = has_subscriptions;
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

    pub fn set_variant_payload(&mut self, variant_payload: u32) {
        self.variant_payload = variant_payload;
    }
}

/// Decode a packed run of records.
///
/// # Errors
/// Returns [`FeatureError::MalformedBlob`] when the length is not a whole
/// number of records.
pub fn decode_records(bytes: &[u8]) -> Result<Vec<FeatureConfiguration>, FeatureError> {
    if bytes.len() % RECORD_SIZE != 0 {
        return Err(FeatureError::MalformedBlob(format!(
            "{} bytes is not a multiple of the {RECORD_SIZE}-byte record size",
            bytes.len()
        )));
    }

    let mut records = Vec::with_capacity(bytes.len() / RECORD_SIZE);
    for chunk in bytes.chunks_exact(RECORD_SIZE) {
        let mut raw = [0_u8; RECORD_SIZE];
        raw.copy_from_slice(chunk);
        records.push(FeatureConfiguration::decode(&raw));
    }
    Ok(records)
}

#[must_use]
pub fn encode_records(records: &[FeatureConfiguration]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(records.len() * RECORD_SIZE);
    for record in records {
        bytes.extend_from_slice(&record.encode());
    }
    bytes
}

pub(crate) fn checked_variant(variant: u32) -> Result<u8, FeatureError> {
    if variant > MAX_VARIANT {
        return Err(FeatureError::FieldOverflow { field: "Variant", max: MAX_VARIANT });
    }
    Ok(low_byte(variant))
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0_u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn low_byte(value: u32) -> u8 {
    value.to_le_bytes()[0]
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn sample() -> Result<FeatureConfiguration, FeatureError> {
        let mut record = FeatureConfiguration::new(36_354_489, FeaturePriority::USER);
        record.set_enabled_state(FeatureEnabledState::Enabled);
        record.set_experiment(true);
        record.set_variant(5)?;
        record.set_variant_payload_kind(VariantPayloadKind::Resident);
        record.set_variant_payload(0xDEAD_BEEF);
        Ok(record)
    }

    #[test]
    fn compact_state_uses_kernel_bit_offsets() -> Result<(), FeatureError> {
        let record = sample()?;
        // 8 | 2<<4 | 1<<6 | 5<<8 | 1<<14
        assert_eq!(record.compact_state(), 0x4568);

        let bytes = record.encode();
        assert_eq!(&bytes[0..4], &36_354_489_u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0x4568_u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0xDEAD_BEEF_u32.to_le_bytes());
        Ok(())
    }

    #[test]
    fn decode_ignores_reserved_bits_and_encode_zeroes_them() {
        let record = FeatureConfiguration::from_parts(7, 0xFFFF_0000 | 0x80 | 0x0C, 1);
        assert_eq!(record.priority(), FeaturePriority::TEST);
        assert!(record.has_subscriptions());
        assert_eq!(record.compact_state(), 0x8C);
    }

    #[test]
    fn reserved_field_values_survive_decoding() {
        let record = FeatureConfiguration::from_parts(1, (0x3 << 4) | (0x3 << 14) | 0x5, 0);
        assert_eq!(record.enabled_state(), FeatureEnabledState::Reserved);
        assert_eq!(record.variant_payload_kind(), VariantPayloadKind::Reserved);
        assert_eq!(record.priority().value(), 5);
        assert_eq!(record.priority().name(), None);
        assert_eq!(record.compact_state(), (0x3 << 4) | (0x3 << 14) | 0x5);
    }

    #[test]
    fn variant_overflow_is_rejected_at_assignment() {
        let mut record = FeatureConfiguration::new(1, FeaturePriority::USER);
        assert_eq!(
            record.set_variant(64),
            Err(FeatureError::FieldOverflow { field: "Variant", max: 63 })
        );
        assert_eq!(record.variant(), 0);
        assert_eq!(record.set_variant(63), Ok(()));
        assert_eq!(record.variant(), 63);
    }

    #[test]
    fn raw_field_constructors_enforce_widths() {
        assert!(FeaturePriority::from_raw(15).is_ok());
        assert!(matches!(
            FeaturePriority::from_raw(16),
            Err(FeatureError::FieldOverflow { field: "Priority", max: 15 })
        ));
        assert!(FeatureEnabledState::from_raw(3).is_err());
        assert!(EnabledStateOptions::from_raw(2).is_err());
        assert_eq!(VariantPayloadKind::from_raw(3), Ok(VariantPayloadKind::Reserved));
        assert!(VariantPayloadKind::from_raw(4).is_err());
    }

    #[test]
    fn priority_parses_names_and_numbers() -> Result<(), FeatureError> {
        assert_eq!("UserPolicy".parse::<FeaturePriority>()?, FeaturePriority::USER_POLICY);
        assert_eq!("service".parse::<FeaturePriority>()?, FeaturePriority::SERVICE);
        assert_eq!("9".parse::<FeaturePriority>()?, FeaturePriority::SECURITY);
        assert!("bogus".parse::<FeaturePriority>().is_err());
        assert_eq!(FeaturePriority::SECURITY.to_string(), "Security (9)");
        Ok(())
    }

    #[test]
    fn decode_records_rejects_partial_records() -> Result<(), FeatureError> {
        let record = sample()?;
        let mut bytes = encode_records(&[record, record]);
        assert_eq!(decode_records(&bytes)?, vec![record, record]);

        bytes.pop();
        assert!(matches!(decode_records(&bytes), Err(FeatureError::MalformedBlob(_))));
        Ok(())
    }

    proptest! {
        #[test]
        fn property_encode_decode_round_trips(
            feature_id in any::<u32>(),
            priority in 0_u32..=15,
            enabled_state in 0_u32..=2,
            is_experiment in any::<bool>(),
            has_subscriptions in any::<bool>(),
            variant in 0_u32..=63,
            kind in 0_u32..=3,
            payload in any::<u32>(),
        ) {
            let mut record = FeatureConfiguration::new(
                feature_id,
                FeaturePriority::from_raw(priority).unwrap_or_default(),
            );
            record.set_enabled_state(FeatureEnabledState::from_raw(enabled_state).unwrap_or_default());
            record.set_experiment(is_experiment);
            record.set_has_subscriptions(has_subscriptions);
            prop_assert!(record.set_variant(variant).is_ok());
            record.set_variant_payload_kind(VariantPayloadKind::from_raw(kind).unwrap_or_default());
            record.set_variant_payload(payload);

            prop_assert_eq!(FeatureConfiguration::decode(&record.encode()), record);
        }

        #[test]
        fn property_decode_encode_preserves_defined_bits(
            feature_id in any::<u32>(),
            compact_state in any::<u32>(),
            payload in any::<u32>(),
        ) {
            let record = FeatureConfiguration::from_parts(feature_id, compact_state, payload);
            prop_assert_eq!(record.compact_state(), compact_state & 0xFFFF);
            prop_assert_eq!(record.feature_id(), feature_id);
            prop_assert_eq!(record.variant_payload(), payload);
        }
    }
}
