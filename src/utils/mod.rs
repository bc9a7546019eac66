//! Shared helpers for binaries and retry loops.

pub mod bootstrap;
pub mod retry;
