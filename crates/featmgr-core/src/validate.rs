use crate::error::FeatureError;
use crate::record::FeaturePriority;
use crate::runtime::FeatureConfigurationSection;
use crate::update::FeatureConfigurationUpdate;

/// Check a whole batch before any store is touched.
///
/// The first offending update rejects the entire batch; nothing is applied.
///
/// # Errors
/// Returns [`FeatureError::ProtectedPriority`] for writes to `ImageDefault`,
/// `Security` or `ImageOverride`, and
/// [`FeatureError::UnsupportedUserPolicyFields`] for `UserPolicy` writes that
/// carry anything besides an enabled state.
pub fn validate_updates(
    updates: &[FeatureConfigurationUpdate],
    section: FeatureConfigurationSection,
) -> Result<(), FeatureError> {
    for update in updates {
        if update.priority().is_protected() {
            tracing::debug!(
                feature_id = update.feature_id(),
                priority = update.priority().value(),
                section = section.as_str(),
                "rejecting batch with protected priority"
            );
            return Err(FeatureError::ProtectedPriority {
                feature_id: update.feature_id(),
                priority: update.priority(),
            });
        }
        if update.priority() == FeaturePriority::USER_POLICY && !update.is_user_policy_compatible()
        {
            return Err(FeatureError::UnsupportedUserPolicyFields {
                feature_id: update.feature_id(),
            });
        }
    }
    Ok(())
}
