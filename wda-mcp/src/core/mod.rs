//! Deterministic core logic (no I/O).

pub mod session;
pub mod signing;
pub mod types;
pub mod xcode;
