//! zshim - workload registration shim for a shared-mode traffic proxy.
//!
//! A shared-mode proxy instruments workloads it has been told about: it
//! connects to a well-known Unix socket and expects a fixed registration
//! protocol, with each workload's network-namespace handle transferred as
//! an attached file descriptor. This crate stands in for the cluster
//! component that normally performs those registrations.
//!
//! The library surface is the protocol engine and its listener; process
//! wiring (CLI, config file, signals) lives in the binary.

pub mod config;
pub mod protocol;

pub use config::{Config, ConfigError};
pub use protocol::{ShimConfig, ShimHandle, start};
