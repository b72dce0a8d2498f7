//! libvirt provider integration.
//!
//! `system` implements `HypervisorProvider` using the host `virsh` CLI.
//! `command` and `parse` isolate shell execution and output parsing so the
//! provider stays testable.

mod command;
mod parse;
mod system;

pub use system::{SystemHypervisor, DEFAULT_VIRSH_PATHS};
