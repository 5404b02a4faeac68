//! Signing engine boundary.
//!
//! Re-signing is delegated to `applesign`. This module only turns a
//! [`SigningRequest`] plus the configured pass-through flags into a command line
//! and relays the engine's output as [`SignerEvent`]s to the caller's sink while
//! the engine runs.

use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::types::{SignerEvent, SigningRequest};
use crate::error::ToolError;
use crate::io::config::{ServerConfig, SignerConfig};
use crate::io::process::{CancelToken, OutputStream, RunOptions, run_command};

/// Lines of engine output quoted in a signing error.
const ERROR_TAIL_LINES: usize = 20;

/// Receives engine notifications as they happen.
pub type EventSink<'a> = &'a (dyn Fn(SignerEvent) + Sync);

/// Abstraction over signing backends.
pub trait SigningEngine: Send + Sync {
    /// Sign `request.input_archive` into `request.output_path`.
    fn sign(
        &self,
        request: &SigningRequest,
        events: EventSink<'_>,
        cancel: &CancelToken,
    ) -> Result<(), ToolError>;
}

/// Engine that spawns the `applesign` CLI.
#[derive(Debug, Clone)]
pub struct ApplesignEngine {
    pub options: SignerConfig,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ApplesignEngine {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            options: config.signer.clone(),
            timeout: config.sign_timeout(),
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    /// Arguments after the configured command prefix.
    pub fn args(&self, request: &SigningRequest) -> Vec<OsString> {
        let opts = &self.options;
        let mut args: Vec<OsString> = Vec::new();
        args.push("--mobileprovision".into());
        args.push(request.mobileprovision.clone().into());
        args.push("--output".into());
        args.push(request.output_path.clone().into());
        if let Some(bundle_id) = &request.bundle_id {
            args.push("--bundleid".into());
            args.push(bundle_id.into());
        }
        if let Some(identity) = &opts.identity {
            args.push("--identity".into());
            args.push(identity.into());
        }
        if let Some(keychain) = &opts.keychain {
            args.push("--keychain".into());
            args.push(keychain.clone().into());
        }
        for (enabled, flag) in [
            (opts.with_get_task_allow, "--with-get-task-allow"),
            (opts.without_plugins, "--without-plugins"),
            (opts.without_watchapp, "--without-watchapp"),
            (opts.without_xctests, "--without-xctests"),
            (opts.clone_entitlements, "--clone-entitlements"),
            (opts.verify, "--verify"),
            (opts.parallel, "--parallel"),
        ] {
            if enabled {
                args.push(flag.into());
            }
        }
        args.extend(opts.extra_args.iter().map(OsString::from));
        args.push(request.input_archive.clone().into());
        args
    }
}

impl SigningEngine for ApplesignEngine {
    #[instrument(skip_all, fields(input = %request.input_archive.display(), bundle_id = ?request.bundle_id))]
    fn sign(
        &self,
        request: &SigningRequest,
        events: EventSink<'_>,
        cancel: &CancelToken,
    ) -> Result<(), ToolError> {
        let (program, prefix) = self
            .options
            .command
            .split_first()
            .ok_or_else(|| ToolError::Signing("signer command is empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(prefix).args(self.args(request));

        remove_stale_output(&request.output_path)?;
        info!("starting signing engine");
        let sink = |stream: OutputStream, line: &str| events(classify_line(stream, line));
        let output = run_command(
            cmd,
            RunOptions::new(self.timeout, self.output_limit_bytes)
                .with_cancel(cancel)
                .with_line_sink(&sink),
        )
        .map_err(|err| ToolError::Signing(format!("{err:#}")))?;

        let failure = if output.cancelled {
            Some(ToolError::Cancelled { stage: "signing" })
        } else if output.timed_out {
            Some(ToolError::Timeout {
                stage: "signing",
                after: self.timeout,
            })
        } else if !output.status.success() {
            Some(ToolError::Signing(format!(
                "{program} exited with status {:?}:\n{}",
                output.status.code(),
                output.failure_tail(ERROR_TAIL_LINES)
            )))
        } else if !request.output_path.is_file() {
            Some(ToolError::Signing(format!(
                "{program} reported success but wrote no archive at {}",
                request.output_path.display()
            )))
        } else {
            None
        };

        if let Some(err) = failure {
            warn!(err = %err, "signing failed");
            discard_partial_output(request);
            return Err(err);
        }
        debug!(output = %request.output_path.display(), "signing completed successfully");
        Ok(())
    }
}

/// applesign reports progress on stdout and problems on stderr; some warnings
/// are printed on stdout with a `warning` prefix.
fn classify_line(stream: OutputStream, line: &str) -> SignerEvent {
    let is_warning = stream == OutputStream::Stderr
        || line
            .trim_start()
            .get(..7)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("warning"));
    if is_warning {
        SignerEvent::Warning(line.to_string())
    } else {
        SignerEvent::Message(line.to_string())
    }
}

/// Delete an archive left at `output` by an earlier run, so only this run's
/// engine can satisfy the output check.
pub fn remove_stale_output(output: &Path) -> Result<(), ToolError> {
    if output.is_file() {
        debug!(path = %output.display(), "removing stale signed archive");
        fs::remove_file(output).map_err(|err| {
            ToolError::Signing(format!("remove stale {}: {err}", output.display()))
        })?;
    }
    Ok(())
}

fn discard_partial_output(request: &SigningRequest) {
    if request.output_path.exists()
        && let Err(err) = fs::remove_file(&request.output_path)
    {
        warn!(
            err = %err,
            path = %request.output_path.display(),
            "failed to remove partial signed archive"
        );
    }
}
