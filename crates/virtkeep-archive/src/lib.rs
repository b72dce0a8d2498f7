//! Archive store integration.
//!
//! `system` implements `ArchiveStore` using the host `borg` CLI. `command`
//! isolates shell execution, credential injection, and stderr diagnostics.

mod command;
mod system;

pub use system::{SystemArchiveStore, DEFAULT_BORG_PATHS};
