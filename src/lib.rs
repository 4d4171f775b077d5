//! Local automation agent that queues, schedules, and runs Claude CLI tasks.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
use ctrlc as _;
#[cfg(test)]
use predicates as _;
use strum as _;
use tracing_subscriber as _;

/// Process-tree cleanup and orphan sweeping.
pub mod cleanup;

/// CLI parsing.
pub mod cli;

/// Task definitions and secrets.
pub mod config;

/// Constants.
pub mod constants;

/// Crontab managed block.
pub mod cron;

/// Queue drain loop.
pub mod engine;

/// Errors.
pub mod error;

/// Assistant subprocess execution.
pub mod executor;

/// Structured execution log.
pub mod logs;

/// Persistent task queue.
pub mod queue;

/// Runtime paths.
pub mod runtime;

/// Status and diagnostics.
pub mod status;

/// File-watch trigger service.
pub mod watcher;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;
