//! Connection management

mod registry;

pub use registry::ConnectionRegistry;
