//! Builder abstraction for `xcodebuild build-for-testing`.
//!
//! The [`BuildRunner`] trait decouples pipeline orchestration from the native
//! toolchain. Tests use scripted runners that lay out a fake bundle instead of
//! compiling anything.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, instrument, warn};

use crate::core::types::BuildArtifact;
use crate::error::ToolError;
use crate::io::config::ServerConfig;
use crate::io::process::{CancelToken, RunOptions, run_command};

/// Relative location of device build products under the derived data directory.
pub const PRODUCTS_SUBDIR: &str = "Build/Products/Debug-iphoneos";
pub const BUILD_LOG_NAME: &str = "wda-build.log";

/// Lines of native output quoted in a build error.
const ERROR_TAIL_LINES: usize = 20;

/// Parameters for one build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub project_dir: PathBuf,
    pub project_file: String,
    pub scheme: String,
    /// Relative to `project_dir`.
    pub derived_data_dir: String,
    pub destination: String,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl BuildRequest {
    pub fn from_config(config: &ServerConfig, project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            project_file: config.project_file.clone(),
            scheme: config.scheme.clone(),
            derived_data_dir: config.derived_data_dir.clone(),
            destination: config.destination.clone(),
            timeout: config.build_timeout(),
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    pub fn products_dir(&self) -> PathBuf {
        self.project_dir
            .join(&self.derived_data_dir)
            .join(PRODUCTS_SUBDIR)
    }

    /// Where the test runner bundle lands, e.g. `WebDriverAgentRunner-Runner.app`.
    pub fn bundle_path(&self) -> PathBuf {
        self.products_dir().join(format!("{}-Runner.app", self.scheme))
    }

    pub fn log_path(&self) -> PathBuf {
        self.project_dir
            .join(&self.derived_data_dir)
            .join(BUILD_LOG_NAME)
    }
}

/// Abstraction over build backends.
pub trait BuildRunner: Send + Sync {
    /// Run the build. Must leave the bundle at `request.bundle_path()` on success.
    fn run(&self, request: &BuildRequest, cancel: &CancelToken) -> Result<(), ToolError>;
}

/// Builder that spawns `xcodebuild`.
#[derive(Debug, Clone)]
pub struct XcodebuildRunner {
    pub program: String,
}

impl XcodebuildRunner {
    pub fn command(&self, request: &BuildRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("clean")
            .arg("build-for-testing")
            .arg("-project")
            .arg(&request.project_file)
            .arg("-derivedDataPath")
            .arg(&request.derived_data_dir)
            .arg("-scheme")
            .arg(&request.scheme)
            .arg("-destination")
            .arg(&request.destination)
            // Signing happens afterwards with the user's profile.
            .arg("CODE_SIGNING_ALLOWED=NO")
            .current_dir(&request.project_dir);
        cmd
    }
}

impl BuildRunner for XcodebuildRunner {
    #[instrument(skip_all, fields(project = %request.project_dir.display(), scheme = %request.scheme))]
    fn run(&self, request: &BuildRequest, cancel: &CancelToken) -> Result<(), ToolError> {
        info!("starting xcodebuild");
        let output = run_command(
            self.command(request),
            RunOptions::new(request.timeout, request.output_limit_bytes).with_cancel(cancel),
        )
        .map_err(|err| ToolError::Build(format!("{err:#}")))?;

        write_build_log(&request.log_path(), &output.render_log("xcodebuild"))
            .map_err(|err| ToolError::Build(format!("{err:#}")))?;

        if output.cancelled {
            return Err(ToolError::Cancelled {
                stage: "xcodebuild",
            });
        }
        if output.timed_out {
            return Err(ToolError::Timeout {
                stage: "xcodebuild",
                after: request.timeout,
            });
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "xcodebuild failed");
            return Err(ToolError::Build(format!(
                "xcodebuild exited with status {:?} (log: {}):\n{}",
                output.status.code(),
                request.log_path().display(),
                output.failure_tail(ERROR_TAIL_LINES)
            )));
        }
        debug!("xcodebuild completed successfully");
        Ok(())
    }
}

/// Run the build and verify the bundle it should have produced.
#[instrument(skip_all, fields(project = %request.project_dir.display()))]
pub fn build_agent<B: BuildRunner + ?Sized>(
    runner: &B,
    request: &BuildRequest,
    cancel: &CancelToken,
) -> Result<BuildArtifact, ToolError> {
    runner.run(request, cancel)?;
    let bundle_path = request.bundle_path();
    if !bundle_path.is_dir() {
        return Err(ToolError::BuildArtifactMissing { path: bundle_path });
    }
    Ok(BuildArtifact {
        bundle_path,
        products_dir: request.products_dir(),
        log_path: request.log_path(),
    })
}

fn write_build_log(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create build log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write build log {}", path.display()))
}
