//! Serial sessions, polling and publishing.

pub mod buffer;
pub mod error;
pub mod message;
pub mod protocol;
pub mod publisher;
pub mod serial;
pub mod session;
pub mod supervisor;
