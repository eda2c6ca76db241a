//! WebSocket Progress Streaming
//!
//! - `protocol`: Defines the JSON-based message format for client-server communication.
//! - `session`: Manages the WebSocket connection lifecycle, from first message to close.

pub mod protocol;
pub mod session;

pub use session::ws_handler;
