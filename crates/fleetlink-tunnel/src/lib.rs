//! Lifecycle management for the reverse-tunnel agent binary.
//!
//! The tunnel agent is an external process that exposes the control plane's
//! listening port to a remote relay. This crate owns its readiness
//! (extraction + executable bit), start/stop/restart, output pumping, exit
//! detection, and the privileged cleanup of stray instances.

pub mod config;
pub mod privilege;
pub mod supervisor;

pub use config::parse_local_port;
pub use privilege::{detect_privileged_access, PrivilegedRunner, RunnerOutput, SuRunner};
pub use supervisor::{TunnelAgentPaths, TunnelAgentSupervisor, TunnelState};
