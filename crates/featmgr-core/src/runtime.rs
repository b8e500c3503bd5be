//! The privileged call surface and the runtime-store adapter over it.

use serde::{Deserialize, Serialize};

use crate::error::{FeatureError, NtStatus};
use crate::record::FeatureConfiguration;
use crate::subscriptions::{FeatureUsageReport, FeatureUsageSubscription};
use crate::update::FeatureConfigurationUpdate;
use crate::validate::validate_updates;

/// Boot status data item holding [`BootFeatureConfigurationState`].
pub const BSD_ITEM_FEATURE_CONFIGURATION_STATE: u32 = 17;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeatureConfigurationSection {
    Boot,
    Runtime,
}

impl FeatureConfigurationSection {
    #[must_use]
    pub fn value(self) -> u32 {
        match self {
            Self::Boot => 0,
            Self::Runtime => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Runtime => "runtime",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BootFeatureConfigurationState {
    Uninitialized,
    BootPending,
    LkgPending,
    RollbackPending,
    Committed,
}

impl BootFeatureConfigurationState {
    /// # Errors
    /// Returns [`FeatureError::FieldOverflow`] for values past `Committed`.
    pub fn from_raw(raw: u32) -> Result<Self, FeatureError> {
        match raw {
            0 => Ok(Self::Uninitialized),
            1 => Ok(Self::BootPending),
            2 => Ok(Self::LkgPending),
            3 => Ok(Self::RollbackPending),
            4 => Ok(Self::Committed),
            _ => Err(FeatureError::FieldOverflow { field: "BootFeatureConfigurationState", max: 4 }),
        }
    }

    #[must_use]
    pub fn value(self) -> u32 {
        match self {
            Self::Uninitialized => 0,
            Self::BootPending => 1,
            Self::LkgPending => 2,
            Self::RollbackPending => 3,
            Self::Committed => 4,
        }
    }
}

/// Invoked with the new change stamp after a runtime mutation.
pub type ChangeCallback = Box<dyn FnMut(u64) + Send>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(transparent)]
pub struct NotificationHandle(pub u64);

/// The kernel's feature configuration entry points.
///
/// Every failure is the callee's native status, passed through untouched.
pub trait FeatureSyscalls {
    /// All records of a section with the stamp they were read at.
    ///
    /// # Errors
    /// Native status of the query.
    fn query_feature_configurations(
        &self,
        section: FeatureConfigurationSection,
    ) -> Result<(Vec<FeatureConfiguration>, u64), NtStatus>;

    /// The effective record for one feature.
    ///
    /// # Errors
    /// [`NtStatus::NOT_FOUND`] when the section has no record for the id.
    fn query_feature_configuration(
        &self,
        feature_id: u32,
        section: FeatureConfigurationSection,
    ) -> Result<(FeatureConfiguration, u64), NtStatus>;

    /// # Errors
    /// Native status of the query.
    fn query_change_stamp(&self) -> Result<u64, NtStatus>;

    /// Apply a batch; a non-zero `previous_change_stamp` must equal the
    /// current stamp. Returns the new stamp.
    ///
    /// # Errors
    /// [`NtStatus::UNSUCCESSFUL`] on a stale stamp, otherwise the native status.
    fn set_feature_configurations(
        &mut self,
        section: FeatureConfigurationSection,
        updates: &[FeatureConfigurationUpdate],
        previous_change_stamp: u64,
    ) -> Result<u64, NtStatus>;

    /// Register `callback`; with `wait_for` set it only fires once the stamp
    /// moves past that value.
    ///
    /// # Errors
    /// Native status of the registration.
    fn register_change_notification(
        &mut self,
        callback: ChangeCallback,
        wait_for: Option<u64>,
    ) -> Result<NotificationHandle, NtStatus>;

    /// # Errors
    /// Native status when the handle is unknown.
    fn unregister_change_notification(&mut self, handle: NotificationHandle)
        -> Result<(), NtStatus>;

    /// # Errors
    /// Native status of the query.
    fn query_usage_subscriptions(&self) -> Result<Vec<FeatureUsageSubscription>, NtStatus>;

    /// # Errors
    /// Native status of the call.
    fn subscribe_usage_notifications(
        &mut self,
        subscriptions: &[FeatureUsageSubscription],
    ) -> Result<(), NtStatus>;

    /// Remove by `(feature id, kind, target)`.
    ///
    /// # Errors
    /// Native status of the call.
    fn unsubscribe_usage_notifications(
        &mut self,
        subscriptions: &[FeatureUsageSubscription],
    ) -> Result<(), NtStatus>;

    /// # Errors
    /// Native status of the call.
    fn notify_feature_usage(&mut self, report: &FeatureUsageReport) -> Result<(), NtStatus>;

    /// # Errors
    /// Native status of the read.
    fn get_system_boot_status(&self, item: u32) -> Result<u32, NtStatus>;

    /// # Errors
    /// Native status of the write.
    fn set_system_boot_status(&mut self, item: u32, value: u32) -> Result<(), NtStatus>;

    /// # Errors
    /// Native status of the call.
    fn create_boot_status_data_file(&mut self) -> Result<(), NtStatus>;
}

/// Runtime-store adapter: validation and change-stamp handling over a
/// [`FeatureSyscalls`] implementation. Nothing is cached between calls.
#[derive(Debug)]
pub struct RuntimeStore<K> {
    kernel: K,
}

impl<K: FeatureSyscalls> RuntimeStore<K> {
    #[must_use]
    pub fn new(kernel: K) -> Self {
        Self { kernel }
    }

    #[must_use]
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    #[must_use]
    pub fn into_inner(self) -> K {
        self.kernel
    }

    /// # Errors
    /// Returns [`FeatureError::Status`] with the native code.
    pub fn query_all(
        &self,
        section: FeatureConfigurationSection,
    ) -> Result<(Vec<FeatureConfiguration>, u64), FeatureError> {
        Ok(self.kernel.query_feature_configurations(section)?)
    }

    /// `None` when the section holds no record for the id.
    ///
    /// # Errors
    /// Returns [`FeatureError::Status`] for any other failure.
    pub fn query(
        &self,
        feature_id: u32,
        section: FeatureConfigurationSection,
    ) -> Result<Option<FeatureConfiguration>, FeatureError> {
        match self.kernel.query_feature_configuration(feature_id, section) {
            Ok((record, _)) => Ok(Some(record)),
            Err(NtStatus::NOT_FOUND) => Ok(None),
            Err(status) => Err(status.into()),
        }
    }

    /// # Errors
    /// Returns [`FeatureError::Status`] with the native code.
    pub fn change_stamp(&self) -> Result<u64, FeatureError> {
        Ok(self.kernel.query_change_stamp()?)
    }

    /// Fail with [`FeatureError::StaleChangeStamp`] when `previous` is set
    /// and no longer current.
    ///
    /// # Errors
    /// Stale stamp or the native status of the stamp query.
    pub fn check_change_stamp(&self, previous: u64) -> Result<(), FeatureError> {
        if previous == 0 {
            return Ok(());
        }
        let current = self.change_stamp()?;
        if previous != current {
            return Err(FeatureError::StaleChangeStamp { previous, current });
        }
        Ok(())
    }

    /// Validate and apply a batch to the live store.
    ///
    /// `previous_change_stamp` of zero skips the optimistic check; on success
    /// it is advanced to the stamp the write produced.
    ///
    /// # Errors
    /// Validation errors and stale stamps are raised before the call; call
    /// failures carry the native status.
    pub fn set_all(
        &mut self,
        updates: &[FeatureConfigurationUpdate],
        section: FeatureConfigurationSection,
        previous_change_stamp: &mut u64,
    ) -> Result<(), FeatureError> {
        validate_updates(updates, section)?;
        self.check_change_stamp(*previous_change_stamp)?;

        let stamp =
            self.kernel.set_feature_configurations(section, updates, *previous_change_stamp)?;
        tracing::info!(
            section = section.as_str(),
            updates = updates.len(),
            change_stamp = stamp,
            "applied feature configuration batch"
        );
        *previous_change_stamp = stamp;
        Ok(())
    }

    /// # Errors
    /// Native status of the registration.
    pub fn register_change_notification(
        &mut self,
        callback: ChangeCallback,
        wait_for: Option<u64>,
    ) -> Result<NotificationHandle, FeatureError> {
        Ok(self.kernel.register_change_notification(callback, wait_for)?)
    }

    /// # Errors
    /// Native status of the call.
    pub fn unregister_change_notification(
        &mut self,
        handle: NotificationHandle,
    ) -> Result<(), FeatureError> {
        Ok(self.kernel.unregister_change_notification(handle)?)
    }

    /// # Errors
    /// Native status of the read; a value outside the enum is a
    /// [`FeatureError::FieldOverflow`].
    pub fn boot_state(&self) -> Result<BootFeatureConfigurationState, FeatureError> {
        let raw = self.kernel.get_system_boot_status(BSD_ITEM_FEATURE_CONFIGURATION_STATE)?;
        BootFeatureConfigurationState::from_raw(raw)
    }

    /// # Errors
    /// Native status of the write.
    pub fn set_boot_state(
        &mut self,
        state: BootFeatureConfigurationState,
    ) -> Result<(), FeatureError> {
        Ok(self
            .kernel
            .set_system_boot_status(BSD_ITEM_FEATURE_CONFIGURATION_STATE, state.value())?)
    }

    /// # Errors
    /// Native status of the call.
    pub fn initialize_boot_status_data_file(&mut self) -> Result<(), FeatureError> {
        Ok(self.kernel.create_boot_status_data_file()?)
    }
}
