//! Orchestration for one build-and-sign run.
//!
//! Stages run strictly in sequence: locate project → build → strip frameworks →
//! package → sign. Each stage is all-or-nothing; the first failure ends the run
//! and is returned unchanged. Argument validation happens before the build so a
//! bad request never touches the toolchain.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::signing::bundle_id_override;
use crate::core::types::{ProvisioningProfile, SignerEvent, SigningRequest};
use crate::error::ToolError;
use crate::io::builder::{BuildRequest, BuildRunner, XcodebuildRunner, build_agent};
use crate::io::config::ServerConfig;
use crate::io::package::{ARCHIVE_NAME, package, strip_frameworks};
use crate::io::process::CancelToken;
use crate::io::project::resolve_project;
use crate::io::signer::{ApplesignEngine, SigningEngine, remove_stale_output};
use crate::io::xcode::{XcodeToolchain, Xcodebuild};

/// Default name of the signed archive, next to the unsigned one.
pub const RESIGNED_ARCHIVE_NAME: &str = "Payload-resigned.ipa";

/// External collaborators used by the pipeline and the profile locator.
pub struct Backends {
    pub xcode: Box<dyn XcodeToolchain>,
    pub builder: Box<dyn BuildRunner>,
    pub signer: Box<dyn SigningEngine>,
}

impl Backends {
    /// Real toolchain: `xcodebuild` and the configured signing engine.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            xcode: Box::new(Xcodebuild {
                program: config.xcodebuild.clone(),
                timeout: config.version_timeout(),
            }),
            builder: Box::new(XcodebuildRunner {
                program: config.xcodebuild.clone(),
            }),
            signer: Box::new(ApplesignEngine::from_config(config)),
        }
    }
}

/// Resolved inputs for one run.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub profile: ProvisioningProfile,
    pub project_path: Option<PathBuf>,
    pub is_free_account: bool,
    pub bundle_id: Option<String>,
    /// Signed archive destination; defaults to `Payload-resigned.ipa` beside the unsigned one.
    pub output_path: Option<PathBuf>,
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutcome {
    pub project_path: PathBuf,
    /// Unsigned archive handed to the signing engine.
    pub archive_path: PathBuf,
    pub resigned_ipa_path: PathBuf,
    pub bundle_id: Option<String>,
    pub profile_uuid: String,
    pub build_log_path: PathBuf,
    /// Warnings reported by the signing engine.
    pub warnings: Vec<String>,
}

/// Execute the full pipeline.
#[instrument(skip_all, fields(profile = %request.profile.uuid, free_account = request.is_free_account))]
pub fn run_pipeline<B, S>(
    config: &ServerConfig,
    builder: &B,
    signer: &S,
    request: &PipelineRequest,
    cancel: &CancelToken,
) -> Result<PipelineOutcome, ToolError>
where
    B: BuildRunner + ?Sized,
    S: SigningEngine + ?Sized,
{
    let bundle_id = bundle_id_override(
        &request.profile,
        request.is_free_account,
        request.bundle_id.as_deref(),
    )?;

    let search_root = config
        .resolved_search_root()
        .map_err(|err| ToolError::validation(format!("{err:#}")))?;
    let project_dir = resolve_project(
        request.project_path.as_deref(),
        &search_root,
        &config.project_file,
    )?;
    info!(project = %project_dir.display(), "resolved WebDriverAgent project");

    let build_request = BuildRequest::from_config(config, &project_dir);
    let products_dir = build_request.products_dir();
    let signing = SigningRequest::new(
        products_dir.join(ARCHIVE_NAME),
        &request.profile,
        request
            .output_path
            .clone()
            .unwrap_or_else(|| products_dir.join(RESIGNED_ARCHIVE_NAME)),
        request.is_free_account,
        bundle_id.as_deref(),
    )?;

    ensure_not_cancelled(cancel, "build")?;
    let artifact = build_agent(builder, &build_request, cancel)?;
    info!(bundle = %artifact.bundle_path.display(), "build finished");

    ensure_not_cancelled(cancel, "packaging")?;
    strip_frameworks(&artifact.bundle_path)?;
    let archive_path = package(&artifact.bundle_path, &artifact.products_dir)?;
    info!(archive = %archive_path.display(), "packaged ipa");

    ensure_not_cancelled(cancel, "signing")?;
    prepare_output_dir(&signing.output_path)?;
    let warnings = Mutex::new(Vec::new());
    let sink = |event: SignerEvent| match event {
        SignerEvent::Warning(msg) => {
            warn!(target: "wda_mcp::signer", "{msg}");
            if let Ok(mut w) = warnings.lock() {
                w.push(msg);
            }
        }
        SignerEvent::Message(msg) => info!(target: "wda_mcp::signer", "{msg}"),
    };
    signer.sign(&signing, &sink, cancel)?;
    info!(output = %signing.output_path.display(), "signed ipa");

    Ok(PipelineOutcome {
        project_path: project_dir,
        archive_path,
        resigned_ipa_path: signing.output_path,
        bundle_id: signing.bundle_id,
        profile_uuid: request.profile.uuid.clone(),
        build_log_path: artifact.log_path,
        warnings: warnings.into_inner().unwrap_or_default(),
    })
}

fn ensure_not_cancelled(cancel: &CancelToken, stage: &'static str) -> Result<(), ToolError> {
    if cancel.is_cancelled() {
        return Err(ToolError::Cancelled { stage });
    }
    Ok(())
}

fn prepare_output_dir(output: &Path) -> Result<(), ToolError> {
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|err| {
            ToolError::Signing(format!("create output directory {}: {err}", parent.display()))
        })?;
    }
    remove_stale_output(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        ScriptedBuild, ScriptedBuildRunner, ScriptedSign, ScriptedSigner, profile_at,
    };

    fn config_for(project_root: &Path) -> ServerConfig {
        ServerConfig {
            project_search_root: Some(project_root.to_path_buf()),
            ..ServerConfig::default()
        }
    }

    fn request(project: &Path, free: bool, bundle_id: Option<&str>) -> PipelineRequest {
        PipelineRequest {
            profile: profile_at(project, "1111", "XC iOS: com.acme.wda", "Acme"),
            project_path: Some(project.to_path_buf()),
            is_free_account: free,
            bundle_id: bundle_id.map(str::to_string),
            output_path: None,
        }
    }

    #[test]
    fn runs_all_stages_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let builder = ScriptedBuildRunner::new(vec![ScriptedBuild::Bundle]);
        let signer = ScriptedSigner::new(vec![ScriptedSign::Succeed {
            warnings: vec!["plugin removed".to_string()],
        }]);

        let outcome = run_pipeline(
            &config_for(temp.path()),
            &builder,
            &signer,
            &request(temp.path(), true, None),
            &CancelToken::new(),
        )
        .expect("pipeline");

        let products = temp
            .path()
            .join("appium_wda_ios/Build/Products/Debug-iphoneos");
        assert_eq!(outcome.archive_path, products.join("Payload.ipa"));
        assert_eq!(outcome.resigned_ipa_path, products.join("Payload-resigned.ipa"));
        assert_eq!(outcome.bundle_id.as_deref(), Some("com.acme.wda"));
        assert_eq!(outcome.warnings, vec!["plugin removed"]);
        assert!(outcome.resigned_ipa_path.is_file());
        assert!(!products.join("WebDriverAgentRunner-Runner.app").exists());

        let signed = signer.requests();
        assert_eq!(signed.len(), 1);
        assert_eq!(signed[0].input_archive, products.join("Payload.ipa"));
        assert_eq!(signed[0].bundle_id.as_deref(), Some("com.acme.wda"));
    }

    #[test]
    fn free_account_without_bundle_id_never_builds() {
        let temp = tempfile::tempdir().expect("tempdir");
        let builder = ScriptedBuildRunner::new(vec![ScriptedBuild::Bundle]);
        let signer = ScriptedSigner::new(Vec::new());

        let err = run_pipeline(
            &config_for(temp.path()),
            &builder,
            &signer,
            &request(temp.path(), true, Some("")),
            &CancelToken::new(),
        )
        .unwrap_err();

        assert_eq!(err.kind(), "validation_error");
        assert_eq!(builder.calls(), 0);
        assert!(signer.requests().is_empty());
    }

    #[test]
    fn build_failure_stops_before_packaging() {
        let temp = tempfile::tempdir().expect("tempdir");
        let builder = ScriptedBuildRunner::new(vec![ScriptedBuild::Fail(
            "** TEST BUILD FAILED **".to_string(),
        )]);
        let signer = ScriptedSigner::new(Vec::new());

        let err = run_pipeline(
            &config_for(temp.path()),
            &builder,
            &signer,
            &request(temp.path(), false, None),
            &CancelToken::new(),
        )
        .unwrap_err();

        assert_eq!(err.kind(), "build_error");
        assert!(err.to_string().contains("TEST BUILD FAILED"));
        assert!(signer.requests().is_empty());
        assert!(
            !temp
                .path()
                .join("appium_wda_ios/Build/Products/Debug-iphoneos/Payload.ipa")
                .exists()
        );
    }

    #[test]
    fn paid_account_signs_without_override_to_custom_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let builder = ScriptedBuildRunner::new(vec![ScriptedBuild::Bundle]);
        let signer = ScriptedSigner::new(vec![ScriptedSign::Succeed {
            warnings: Vec::new(),
        }]);
        let mut req = request(temp.path(), false, Some("ignored.for.paid"));
        req.output_path = Some(temp.path().join("out/wda.ipa"));

        let outcome = run_pipeline(
            &config_for(temp.path()),
            &builder,
            &signer,
            &req,
            &CancelToken::new(),
        )
        .expect("pipeline");

        assert_eq!(outcome.bundle_id, None);
        assert_eq!(outcome.resigned_ipa_path, temp.path().join("out/wda.ipa"));
        assert!(outcome.resigned_ipa_path.is_file());
    }

    #[test]
    fn cancelled_run_does_not_start() {
        let temp = tempfile::tempdir().expect("tempdir");
        let builder = ScriptedBuildRunner::new(vec![ScriptedBuild::Bundle]);
        let signer = ScriptedSigner::new(Vec::new());
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = run_pipeline(
            &config_for(temp.path()),
            &builder,
            &signer,
            &request(temp.path(), false, None),
            &cancel,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "cancelled_error");
        assert_eq!(builder.calls(), 0);
    }

    #[test]
    fn earlier_signed_archive_is_cleared_before_signing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let products = temp
            .path()
            .join("appium_wda_ios/Build/Products/Debug-iphoneos");
        fs::create_dir_all(&products).expect("products");
        fs::write(products.join(RESIGNED_ARCHIVE_NAME), "old profile").expect("stale");
        let builder = ScriptedBuildRunner::new(vec![ScriptedBuild::Bundle]);
        let signer = ScriptedSigner::new(vec![ScriptedSign::Fail("no identity".to_string())]);

        let err = run_pipeline(
            &config_for(temp.path()),
            &builder,
            &signer,
            &request(temp.path(), false, None),
            &CancelToken::new(),
        )
        .unwrap_err();

        assert_eq!(err.kind(), "signing_error");
        assert!(!products.join(RESIGNED_ARCHIVE_NAME).exists());
    }

    #[test]
    fn signing_failure_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let builder = ScriptedBuildRunner::new(vec![ScriptedBuild::Bundle]);
        let signer = ScriptedSigner::new(vec![ScriptedSign::Fail("no identity".to_string())]);

        let err = run_pipeline(
            &config_for(temp.path()),
            &builder,
            &signer,
            &request(temp.path(), false, None),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "signing_error");
    }
}
