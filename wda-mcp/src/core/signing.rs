//! Signing request construction.
//!
//! Free developer accounts can only sign apps whose bundle identifier matches the
//! one the profile was issued for, so the app must be re-stamped. Paid accounts
//! keep the identifier produced by the build.

use std::path::PathBuf;

use crate::core::types::{ProvisioningProfile, SigningRequest};
use crate::error::ToolError;

impl SigningRequest {
    /// Build a request, choosing the bundle identifier override.
    ///
    /// For free accounts the override is `explicit_bundle_id` when given (even if
    /// empty), otherwise the identifier derived from the profile name. A missing,
    /// empty or wildcard identifier is a validation error.
    pub fn new(
        input_archive: PathBuf,
        profile: &ProvisioningProfile,
        output_path: PathBuf,
        is_free_account: bool,
        explicit_bundle_id: Option<&str>,
    ) -> Result<Self, ToolError> {
        let bundle_id = bundle_id_override(profile, is_free_account, explicit_bundle_id)?;
        Ok(Self {
            input_archive,
            mobileprovision: profile.file_path.clone(),
            output_path,
            bundle_id,
        })
    }
}

/// The bundle identifier to stamp, if any. Checked before the build starts.
pub fn bundle_id_override(
    profile: &ProvisioningProfile,
    is_free_account: bool,
    explicit_bundle_id: Option<&str>,
) -> Result<Option<String>, ToolError> {
    if !is_free_account {
        return Ok(None);
    }
    free_account_bundle_id(profile, explicit_bundle_id).map(Some)
}

fn free_account_bundle_id(
    profile: &ProvisioningProfile,
    explicit: Option<&str>,
) -> Result<String, ToolError> {
    let candidate = match explicit {
        Some(id) => id.trim(),
        None => profile.bundle_id.as_deref().map(str::trim).unwrap_or(""),
    };
    if candidate.is_empty() {
        return Err(ToolError::validation(format!(
            "free account signing requires a bundle identifier; profile {} has none, pass bundleId",
            profile.uuid
        )));
    }
    if candidate.contains('*') {
        return Err(ToolError::validation(format!(
            "bundle identifier {candidate:?} is a wildcard; pass a concrete bundleId"
        )));
    }
    Ok(candidate.to_string())
}
