// src/lib.rs
pub mod auth;
pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod resource;
pub mod response;
pub mod server;
pub mod syscalls;
pub mod table;
pub mod timer;
pub mod worker;

// Re-exports for users
pub use auth::{CredentialValidator, UserStore};
pub use config::{LogConfig, ServerConfig, TriggerMode};
pub use error::{ServerError, ServerResult};
pub use http::{Method, Request};
pub use server::{Server, ShutdownHandle};
