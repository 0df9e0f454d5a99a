//! bs-agent: Host agent that receives encrypted bundles and installs them
//!
//! The agent admits a bounded number of client connections, hands each one
//! an encryption key, reassembles and verifies chunked uploads, extracts
//! them, and runs the requested packages' installer scripts one at a time
//! while streaming progress back to clients.

pub mod connection;
pub mod extract;
pub mod install;
pub mod keys;
pub mod reaper;
pub mod server;
pub mod state;
pub mod tasks;
pub mod upload;

pub use state::AgentState;
