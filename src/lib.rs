pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod router;
pub mod server;
pub mod session;
pub mod version;
