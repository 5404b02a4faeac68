//! Conversational session state for the multi-turn tool flow.
//!
//! The flow is `list_provisioning_profiles` → `is_free_account` →
//! `build_and_sign_wda`. Transitions are permissive: `build_and_sign_wda` can be
//! called from any phase as long as its arguments (or earlier calls) supply a
//! profile and an account type. A failed pipeline leaves the session usable so
//! the client can retry the same call.

use std::path::PathBuf;

use serde::Serialize;

use crate::core::types::ProvisioningProfile;
use crate::error::ToolError;

/// Position in the conversational flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    ProfileListed,
    AccountTypeConfirmed,
    Completed,
    /// Last pipeline run failed. Selections are kept for a retry.
    Failed,
}

/// State carried between tool calls of one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub phase: SessionPhase,
    /// Profiles returned by the most recent listing.
    pub listed: Vec<ProvisioningProfile>,
    pub selected_profile: Option<ProvisioningProfile>,
    pub is_free_account: Option<bool>,
    pub project_path: Option<PathBuf>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            listed: Vec::new(),
            selected_profile: None,
            is_free_account: None,
            project_path: None,
        }
    }
}

impl SessionState {
    /// Record a fresh listing. Clears any previously selected profile.
    pub fn record_listing(&mut self, profiles: Vec<ProvisioningProfile>) {
        self.listed = profiles;
        self.selected_profile = None;
        self.phase = SessionPhase::ProfileListed;
    }

    /// Store the account type and, optionally, select a profile from the last listing.
    ///
    /// The flag is only stored when the selection (if any) is valid.
    pub fn confirm_account_type(
        &mut self,
        is_free_account: bool,
        profile_uuid: Option<&str>,
    ) -> Result<(), ToolError> {
        if let Some(uuid) = profile_uuid {
            let profile = self
                .listed
                .iter()
                .find(|p| p.uuid == uuid)
                .cloned()
                .ok_or_else(|| {
                    ToolError::validation(format!(
                        "profile {uuid} is not in the last listing; call list_provisioning_profiles first"
                    ))
                })?;
            self.selected_profile = Some(profile);
        }
        self.is_free_account = Some(is_free_account);
        self.phase = SessionPhase::AccountTypeConfirmed;
        Ok(())
    }

    pub fn record_success(&mut self, project_path: PathBuf) {
        self.project_path = Some(project_path);
        self.phase = SessionPhase::Completed;
    }

    pub fn record_failure(&mut self) {
        self.phase = SessionPhase::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::profile;

    #[test]
    fn new_session_is_idle() {
        let state = SessionState::default();
        assert_eq!(state.phase, SessionPhase::Idle);
        assert!(state.selected_profile.is_none());
        assert!(state.is_free_account.is_none());
    }

    #[test]
    fn listing_clears_previous_selection() {
        let mut state = SessionState::default();
        state.record_listing(vec![profile("1111", "XC iOS: com.a", "Acme")]);
        state
            .confirm_account_type(true, Some("1111"))
            .expect("confirm");
        assert!(state.selected_profile.is_some());

        state.record_listing(vec![profile("2222", "XC iOS: com.b", "Acme")]);
        assert_eq!(state.phase, SessionPhase::ProfileListed);
        assert!(state.selected_profile.is_none());
        assert_eq!(state.is_free_account, Some(true));
    }

    #[test]
    fn confirm_without_listing_stores_flag() {
        let mut state = SessionState::default();
        state.confirm_account_type(false, None).expect("confirm");
        assert_eq!(state.phase, SessionPhase::AccountTypeConfirmed);
        assert_eq!(state.is_free_account, Some(false));
    }

    #[test]
    fn confirm_with_unknown_uuid_is_rejected_and_leaves_state() {
        let mut state = SessionState::default();
        state.record_listing(vec![profile("1111", "XC iOS: com.a", "Acme")]);
        let err = state.confirm_account_type(true, Some("9999")).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(state.phase, SessionPhase::ProfileListed);
        assert!(state.is_free_account.is_none());
    }

    #[test]
    fn failure_keeps_selection_for_retry() {
        let mut state = SessionState::default();
        state.record_listing(vec![profile("1111", "XC iOS: com.a", "Acme")]);
        state
            .confirm_account_type(true, Some("1111"))
            .expect("confirm");
        state.record_failure();
        assert_eq!(state.phase, SessionPhase::Failed);
        assert_eq!(
            state.selected_profile.as_ref().map(|p| p.uuid.as_str()),
            Some("1111")
        );

        state.record_success(PathBuf::from("/wda"));
        assert_eq!(state.phase, SessionPhase::Completed);
        assert_eq!(state.project_path, Some(PathBuf::from("/wda")));
    }
}
