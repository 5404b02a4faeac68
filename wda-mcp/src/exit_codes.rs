//! Stable exit codes for the `wda-mcp` binary.

/// Graceful shutdown (interrupt or end of input), or a one-shot command succeeded.
pub const OK: i32 = 0;
/// Startup failed (bad configuration, schema compilation), or a one-shot command failed.
pub const FAILED: i32 = 1;
