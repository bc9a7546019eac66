//! Shared storage contract tests.
//!
//! Every store implementation runs the same functions through the
//! `run_*_tests!` macros so behavior stays identical across backends.

pub mod inbox_tests;
pub mod outbox_tests;
pub mod saga_tests;
pub mod scheduled_tests;
