//! Camrelay signaling protocol
//!
//! Request and response shapes shared by the relay server and its clients.
//! All bodies are JSON.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
