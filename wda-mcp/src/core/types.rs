//! Shared types for the build-and-sign pipeline.
//!
//! These are plain records passed between stages. Construction rules that
//! encode invariants live next to the logic that needs them (see
//! [`crate::core::signing`]).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A parsed `.mobileprovision` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningProfile {
    /// Profile UUID as stored in the property list.
    pub uuid: String,
    /// Human-facing label: `"<name-part> (Team: <team>) (<uuid>)"`.
    pub name: String,
    /// Raw `Name` value from the property list.
    pub profile_name: String,
    pub team_name: String,
    /// Bundle identifier fragment derived from `Name` (text after the first `:`).
    pub bundle_id: Option<String>,
    pub file_path: PathBuf,
    /// `ExpirationDate` lies in the past.
    #[serde(default)]
    pub expired: bool,
}

/// Output of a successful `xcodebuild build-for-testing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifact {
    /// The `.app` bundle. Invalid once the packager has moved it.
    pub bundle_path: PathBuf,
    /// `Build/Products/Debug-iphoneos` under the derived data directory.
    pub products_dir: PathBuf,
    pub log_path: PathBuf,
}

/// Inputs for one signing engine invocation.
///
/// Build through [`SigningRequest::new`] so the free-account rule is enforced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    /// Unsigned `.ipa` produced by the packager.
    pub input_archive: PathBuf,
    pub mobileprovision: PathBuf,
    pub output_path: PathBuf,
    /// Bundle identifier to stamp into the app; only set for free accounts.
    pub bundle_id: Option<String>,
}

/// Notification emitted by the signing engine while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerEvent {
    Warning(String),
    Message(String),
}
