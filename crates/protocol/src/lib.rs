//! SiteSync Protocol
//!
//! Wire types for the realtime channel between the construction-management
//! API and its clients. Every frame is a JSON text message tagged by `type`.

pub mod client;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use server::{ServerMessage, UpdatesBatch};
pub use types::*;
