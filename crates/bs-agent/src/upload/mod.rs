//! Chunked, encrypted file upload

mod manager;
pub mod naming;
mod session;
pub mod validator;

pub use manager::UploadManager;
pub use session::UploadSession;
