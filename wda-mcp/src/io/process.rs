//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ScopedJoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How often a running child is checked for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared flag that asks a running command to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Which pipe a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Callback receiving each output line while the child runs.
pub type LineSink<'a> = &'a (dyn Fn(OutputStream, &str) + Sync);

/// Limits and hooks for one command run.
#[derive(Clone, Copy)]
pub struct RunOptions<'a> {
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory; the rest is drained and counted.
    pub output_limit_bytes: usize,
    pub cancel: Option<&'a CancelToken>,
    pub on_line: Option<LineSink<'a>>,
}

impl<'a> RunOptions<'a> {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            timeout,
            output_limit_bytes,
            cancel: None,
            on_line: None,
        }
    }

    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_line_sink(mut self, sink: LineSink<'a>) -> Self {
        self.on_line = Some(sink);
        self
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Last `max_lines` non-empty lines of stderr, falling back to stdout.
    ///
    /// Native tools often report the actual failure at the end of their output.
    pub fn failure_tail(&self, max_lines: usize) -> String {
        let stderr = self.stderr_lossy();
        let source = if stderr.trim().is_empty() {
            self.stdout_lossy()
        } else {
            stderr
        };
        let lines: Vec<&str> = source.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }

    /// Render stdout and stderr as a log file body.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&self.stdout_lossy());
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&self.stderr_lossy());
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        if self.cancelled {
            buf.push_str(&format!("\n[{label} cancelled]\n"));
        }
        buf
    }
}

/// Run a command to completion, timeout or cancellation.
///
/// stdin is closed. stdout and stderr are read concurrently while the child runs so
/// a chatty tool cannot deadlock on a full pipe. Each complete line is handed to
/// `opts.on_line` as it arrives.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = opts.timeout.as_secs()))]
pub fn run_command(mut cmd: Command, opts: RunOptions<'_>) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Own group so a kill also reaches grandchildren holding the pipes.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = opts.output_limit_bytes;
    let on_line = opts.on_line;

    let output = thread::scope(|scope| -> Result<CommandOutput> {
        let stdout_handle =
            scope.spawn(move || read_lines_limited(stdout, OutputStream::Stdout, limit, on_line));
        let stderr_handle =
            scope.spawn(move || read_lines_limited(stderr, OutputStream::Stderr, limit, on_line));

        let waited = wait_with_deadline(&mut child, opts.timeout, opts.cancel);
        let (status, ending) = match waited {
            Ok(result) => result,
            Err(err) => {
                // Readers only finish once the pipes close.
                let _ = kill_process_tree(&mut child);
                let _ = child.wait();
                return Err(err);
            }
        };

        let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
        let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

        Ok(CommandOutput {
            status,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            timed_out: ending == Ending::TimedOut,
            cancelled: ending == Ending::Cancelled,
        })
    })?;

    if output.stdout_truncated > 0 || output.stderr_truncated > 0 {
        warn!(
            stdout_truncated = output.stdout_truncated,
            stderr_truncated = output.stderr_truncated,
            "output truncated"
        );
    }

    debug!(
        exit_code = ?output.status.code(),
        timed_out = output.timed_out,
        cancelled = output.cancelled,
        "command finished"
    );
    Ok(output)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Exited,
    TimedOut,
    Cancelled,
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
    cancel: Option<&CancelToken>,
) -> Result<(ExitStatus, Ending)> {
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("command cancelled, killing");
            kill_process_tree(child)?;
            let status = child.wait().context("wait command after kill")?;
            return Ok((status, Ending::Cancelled));
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            kill_process_tree(child)?;
            let status = child.wait().context("wait command after kill")?;
            return Ok((status, Ending::TimedOut));
        }
        let slice = (deadline - now).min(POLL_INTERVAL);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            return Ok((status, Ending::Exited));
        }
    }
}

/// Kill the child and everything in its process group.
#[cfg(unix)]
fn kill_process_tree(child: &mut Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let group = Pid::from_raw(child.id() as i32);
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => {
            warn!(err = %errno, "cannot signal process group, killing child only");
            child.kill().context("kill command")
        }
    }
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill command")
}

fn join_output(handle: ScopedJoinHandle<'_, Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream line by line, forwarding each line and keeping at most `limit` bytes.
fn read_lines_limited<R: Read>(
    reader: R,
    stream: OutputStream,
    limit: usize,
    on_line: Option<LineSink<'_>>,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read output")?;
        if n == 0 {
            break;
        }

        if let Some(sink) = on_line {
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\n', '\r']);
            if !text.is_empty() {
                sink(stream, text);
            }
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}
