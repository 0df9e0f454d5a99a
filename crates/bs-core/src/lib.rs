//! bs-core: Core abstractions and configuration for the bootstrap agent
//!
//! This crate provides shared types, the error taxonomy, configuration
//! structures and the wire protocol used by the agent and the CLI.

pub mod config;
pub mod crypto;
pub mod error;
pub mod hash;
pub mod rpc;
pub mod time;
pub mod types;

pub use error::{BsError, ErrorKind};
pub use types::{ConnectionId, ItemStatus, SessionStatus, UploadState};
