//! Stdio JSON-RPC tool server.

pub mod protocol;
pub mod server;
pub mod tools;
pub mod transport;
