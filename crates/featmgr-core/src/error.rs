use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::record::FeaturePriority;

/// Native status code returned by the privileged call surface.
///
/// Codes are passed through untouched so callers can translate them into
/// their own text. Severity follows the NT convention: the top bit set means
/// failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(transparent)]
pub struct NtStatus(pub u32);

impl NtStatus {
    pub const SUCCESS: Self = Self(0);
    pub const UNSUCCESSFUL: Self = Self(0xC000_0001);
    pub const INVALID_PARAMETER: Self = Self(0xC000_000D);
    pub const OBJECT_NAME_NOT_FOUND: Self = Self(0xC000_0034);
    pub const NOT_SUPPORTED: Self = Self(0xC000_00BB);
    pub const REGISTRY_IO_FAILED: Self = Self(0xC000_014D);
    pub const NOT_FOUND: Self = Self(0xC000_0225);

    #[must_use]
    pub fn is_success(self) -> bool {
        self.0 & 0x8000_0000 == 0
    }

    #[must_use]
    pub fn code(self) -> u32 {
        self.0
    }
}

impl Display for NtStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Failure reported by a [`crate::hive::Hive`] backend.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HiveError {
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("hive backend failure ({status}): {message}")]
    Backend { status: NtStatus, message: String },
}

impl HiveError {
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend { status: NtStatus::REGISTRY_IO_FAILED, message: message.into() }
    }

    /// Status a registry call would have reported for this failure.
    #[must_use]
    pub fn status(&self) -> NtStatus {
        match self {
            Self::KeyNotFound(_) => NtStatus::OBJECT_NAME_NOT_FOUND,
            Self::Backend { status, .. } => *status,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FeatureError {
    #[error("{field} must not be more than {max}")]
    FieldOverflow { field: &'static str, max: u32 },
    #[error(
        "feature {feature_id}: priority {priority} is protected; ImageDefault (0), Security (9), \
         and ImageOverride (15) can't be written to"
    )]
    ProtectedPriority { feature_id: u32, priority: FeaturePriority },
    #[error(
        "feature {feature_id}: UserPolicy priority overrides do not support persisting \
         properties other than EnabledState"
    )]
    UnsupportedUserPolicyFields { feature_id: u32 },
    #[error("change stamp {previous} is stale; store is at {current}")]
    StaleChangeStamp { previous: u64, current: u64 },
    #[error("malformed configuration blob: {0}")]
    MalformedBlob(String),
    #[error("store call failed with status {0}")]
    Status(NtStatus),
    #[error(transparent)]
    Hive(#[from] HiveError),
}

impl FeatureError {
    /// Native status carried by store-call failures; `None` for local errors.
    #[must_use]
    pub fn status(&self) -> Option<NtStatus> {
        match self {
            Self::Status(status) => Some(*status),
            Self::Hive(err) => Some(err.status()),
            _ => None,
        }
    }
}

impl From<NtStatus> for FeatureError {
    fn from(status: NtStatus) -> Self {
        Self::Status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_severity_follows_top_bit() {
        assert!(NtStatus::SUCCESS.is_success());
        assert!(NtStatus(0x0000_0103).is_success());
        assert!(!NtStatus::UNSUCCESSFUL.is_success());
        assert_eq!(NtStatus::NOT_FOUND.to_string(), "0xc0000225");
    }

    #[test]
    fn hive_errors_map_to_registry_statuses() {
        let missing = FeatureError::from(HiveError::KeyNotFound("a\\b".to_string()));
        assert_eq!(missing.status(), Some(NtStatus::OBJECT_NAME_NOT_FOUND));
        assert_eq!(
            FeatureError::Hive(HiveError::backend("disk gone")).status(),
            Some(NtStatus::REGISTRY_IO_FAILED)
        );
        assert_eq!(FeatureError::FieldOverflow { field: "Variant", max: 63 }.status(), None);
    }
}
