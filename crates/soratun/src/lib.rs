//! Command-line tools for SORACOM Arc.
//!
//! `soratun` runs one-shot `nc` and `curl` exchanges through a tunnel and
//! prints the config as a WireGuard file. `soraproxy` exposes the Unified
//! Endpoint on a local HTTP port.

pub mod commands;
pub mod logging;
pub mod proxy;
