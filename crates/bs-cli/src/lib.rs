//! bs-cli: Command-line interface for the bootstrap agent
//!
//! Provides the `bsctl` CLI for uploading bundles to an agent and driving
//! its installation queue.

pub mod client;
pub mod commands;
pub mod output;
