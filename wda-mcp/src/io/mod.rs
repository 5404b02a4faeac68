//! Side-effecting adapters: child processes, filesystem, configuration.

pub mod builder;
pub mod config;
pub mod package;
pub mod process;
pub mod profiles;
pub mod project;
pub mod signer;
pub mod xcode;
