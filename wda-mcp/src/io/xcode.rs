//! Xcode toolchain queries.

use std::process::Command;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::core::xcode::parse_major_version;
use crate::error::ToolError;
use crate::io::process::{RunOptions, run_command};

const VERSION_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// Source of the installed Xcode version.
pub trait XcodeToolchain: Send + Sync {
    fn major_version(&self) -> Result<u32, ToolError>;
}

/// Runs `<program> -version`.
#[derive(Debug, Clone)]
pub struct Xcodebuild {
    pub program: String,
    pub timeout: Duration,
}

impl XcodeToolchain for Xcodebuild {
    #[instrument(skip_all, fields(program = %self.program))]
    fn major_version(&self) -> Result<u32, ToolError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-version");
        let output = run_command(cmd, RunOptions::new(self.timeout, VERSION_OUTPUT_LIMIT_BYTES))
            .map_err(|err| ToolError::VersionDetection(format!("{err:#}")))?;
        if output.timed_out {
            return Err(ToolError::Timeout {
                stage: "xcodebuild -version",
                after: self.timeout,
            });
        }
        if !output.status.success() {
            return Err(ToolError::VersionDetection(format!(
                "{} -version exited with {:?}: {}",
                self.program,
                output.status.code(),
                output.failure_tail(5)
            )));
        }
        let stdout = output.stdout_lossy();
        let major = parse_major_version(&stdout).ok_or_else(|| {
            ToolError::VersionDetection(format!("unrecognized version output {:?}", stdout.trim()))
        })?;
        debug!(major, "detected Xcode version");
        Ok(major)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::write_script;

    #[test]
    fn reads_major_version_from_script() {
        let temp = tempfile::tempdir().expect("tempdir");
        let program = write_script(
            temp.path(),
            "xcodebuild",
            "echo 'Xcode 16.1'\necho 'Build version 16B40'\n",
        );
        let xcode = Xcodebuild {
            program: program.display().to_string(),
            timeout: Duration::from_secs(10),
        };
        assert_eq!(xcode.major_version().expect("version"), 16);
    }

    #[test]
    fn unparseable_output_is_version_detection_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let program = write_script(temp.path(), "xcodebuild", "echo 'Command Line Tools'\n");
        let xcode = Xcodebuild {
            program: program.display().to_string(),
            timeout: Duration::from_secs(10),
        };
        let err = xcode.major_version().unwrap_err();
        assert_eq!(err.kind(), "version_detection_error");
    }

    #[test]
    fn missing_program_is_version_detection_error() {
        let xcode = Xcodebuild {
            program: "/no/such/xcodebuild".to_string(),
            timeout: Duration::from_secs(1),
        };
        let err = xcode.major_version().unwrap_err();
        assert_eq!(err.kind(), "version_detection_error");
    }

    #[test]
    fn failing_program_is_version_detection_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let program = write_script(
            temp.path(),
            "xcodebuild",
            "echo 'xcode-select: error: no developer tools' >&2\nexit 1\n",
        );
        let xcode = Xcodebuild {
            program: program.display().to_string(),
            timeout: Duration::from_secs(10),
        };
        let err = xcode.major_version().unwrap_err();
        assert!(err.to_string().contains("no developer tools"));
    }
}
