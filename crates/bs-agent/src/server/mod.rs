//! Client-facing server

mod handler;
mod listener;

pub use handler::handle_request;
pub use listener::AgentServer;
