//! Build, package and re-sign WebDriverAgent behind a stdio tool server.
//!
//! The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (version mapping, signing rules,
//!   session transitions). No I/O.
//! - **[`io`]**: Side-effecting adapters (child processes, filesystem, config).
//!   External tools sit behind traits so tests can substitute scripted fakes.
//! - **[`pipeline`]**: Runs locate → build → strip → package → sign.
//! - **[`mcp`]**: JSON-RPC dispatch, tool catalog and the stdio transport.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod mcp;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
