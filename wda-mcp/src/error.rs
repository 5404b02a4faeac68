//! Error taxonomy for tool invocations.
//!
//! Every stage of the build-and-sign pipeline reports failures as a
//! [`ToolError`]. The tool server converts these into error payloads; they never
//! terminate the server process.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A stage-level failure surfaced to the tool caller.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unable to determine Xcode version: {0}")]
    VersionDetection(String),

    #[error("{what} does not exist: {}", path.display())]
    NotFound { what: &'static str, path: PathBuf },

    #[error("no mobileprovision file found in {}", dir.display())]
    EmptyResult { dir: PathBuf },

    #[error("failed to parse provisioning profile {}: {reason}", path.display())]
    ProfileParse { path: PathBuf, reason: String },

    #[error("invalid WebDriverAgent project path {}: {reason}", path.display())]
    InvalidProjectPath { path: PathBuf, reason: String },

    #[error("unable to find {name} under {}", root.display())]
    ProjectNotFound { root: PathBuf, name: String },

    #[error("error building WebDriverAgent: {0}")]
    Build(String),

    #[error("build finished but no app bundle at {}", path.display())]
    BuildArtifactMissing { path: PathBuf },

    #[error("error packaging ipa: {0}")]
    Packaging(String),

    #[error("error signing ipa: {0}")]
    Signing(String),

    #[error("{0}")]
    Validation(String),

    #[error("unknown tool: {0}")]
    MethodNotFound(String),

    #[error("{stage} timed out after {}s", after.as_secs())]
    Timeout { stage: &'static str, after: Duration },

    #[error("{stage} was cancelled")]
    Cancelled { stage: &'static str },

    #[error("a build is already in progress; retry when it finishes")]
    Busy,
}

impl ToolError {
    /// Stable machine-readable identifier for the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::VersionDetection(_) => "version_detection_error",
            ToolError::NotFound { .. } => "not_found_error",
            ToolError::EmptyResult { .. } => "empty_result_error",
            ToolError::ProfileParse { .. } => "profile_parse_error",
            ToolError::InvalidProjectPath { .. } => "invalid_project_path_error",
            ToolError::ProjectNotFound { .. } => "project_not_found_error",
            ToolError::Build(_) => "build_error",
            ToolError::BuildArtifactMissing { .. } => "build_artifact_missing_error",
            ToolError::Packaging(_) => "packaging_error",
            ToolError::Signing(_) => "signing_error",
            ToolError::Validation(_) => "validation_error",
            ToolError::MethodNotFound(_) => "method_not_found_error",
            ToolError::Timeout { .. } => "timeout_error",
            ToolError::Cancelled { .. } => "cancelled_error",
            ToolError::Busy => "busy_error",
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ToolError::Validation(msg.into())
    }

    /// Wrap an I/O plumbing error as a packaging failure, keeping the context chain.
    pub fn packaging(err: anyhow::Error) -> Self {
        ToolError::Packaging(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_path() {
        let err = ToolError::ProfileParse {
            path: PathBuf::from("/profiles/A.mobileprovision"),
            reason: "missing UUID".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to parse provisioning profile /profiles/A.mobileprovision: missing UUID"
        );
        assert_eq!(err.kind(), "profile_parse_error");
    }

    #[test]
    fn timeout_reports_whole_seconds() {
        let err = ToolError::Timeout {
            stage: "xcodebuild",
            after: Duration::from_millis(90_500),
        };
        assert_eq!(err.to_string(), "xcodebuild timed out after 90s");
    }

    #[test]
    fn packaging_keeps_context_chain() {
        let err = ToolError::packaging(
            anyhow::anyhow!("permission denied").context("create Payload.ipa"),
        );
        assert_eq!(
            err.to_string(),
            "error packaging ipa: create Payload.ipa: permission denied"
        );
    }
}
