//! Feature configuration store toolkit.
//!
//! Models the OS feature configuration records, their compact 12-byte wire
//! form and the obfuscated key names used by the persisted boot store, and
//! applies updates to either the live runtime store (through the privileged
//! call surface in [`runtime::FeatureSyscalls`]) or the emulated boot store
//! (through the hierarchical [`hive::Hive`] abstraction).

pub mod blob;
pub mod boot;
pub mod error;
pub mod hive;
pub mod kernel;
pub mod layout;
pub mod lkg;
pub mod manager;
pub mod obfuscation;
pub mod record;
pub mod runtime;
pub mod subscriptions;
pub mod update;
pub mod validate;

pub use blob::ConfigurationSnapshot;
pub use boot::{BootStore, OverrideValueName};
pub use error::{FeatureError, HiveError, NtStatus};
pub use hive::{Hive, HiveValue, KeyPath, MemoryHive, OpenKey};
pub use kernel::{InMemoryFeatureKernel, SectionState};
pub use layout::StoreLayout;
pub use lkg::RepairOutcome;
pub use manager::{ApplyReport, BootBookkeeping, FeatureManager, ImportSummary};
pub use obfuscation::{deobfuscate_feature_id, obfuscate_feature_id};
pub use record::{
    EnabledStateOptions, FeatureConfiguration, FeatureEnabledState, FeaturePriority,
    VariantPayloadKind, RECORD_SIZE,
};
pub use runtime::{
    BootFeatureConfigurationState, ChangeCallback, FeatureConfigurationSection, FeatureSyscalls,
    NotificationHandle, RuntimeStore, BSD_ITEM_FEATURE_CONFIGURATION_STATE,
};
pub use subscriptions::{FeatureUsageReport, FeatureUsageSubscription};
pub use update::{FeatureConfigurationOperation, FeatureConfigurationUpdate};
pub use validate::validate_updates;
