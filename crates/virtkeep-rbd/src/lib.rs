//! Ceph RBD provider integration.
//!
//! `system` implements `PoolProvider` using the host `rbd` CLI. `command`
//! and `parse` isolate shell execution and output parsing so the provider
//! stays testable.

mod command;
mod parse;
mod system;

pub use system::{SystemPool, DEFAULT_RBD_PATHS};
