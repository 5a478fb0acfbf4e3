//! Agent hypervisor: binds topic tasks to remote sandboxes, dispatches and
//! interrupts agent work, and reconciles recorded status against what the
//! sandbox gateway reports.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod ids;
pub mod interrupt;
pub mod lifecycle;
pub mod notifier;
pub mod orchestrator;
pub mod reconciler;
pub mod repository;
pub mod service;
pub mod state;
pub mod sweeper;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use error::{HypervisorError, Result};
pub use state::AppState;
