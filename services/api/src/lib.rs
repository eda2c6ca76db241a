//! LabGuide API Library Crate
//!
//! This library contains the web layer of the LabGuide service: configuration,
//! application state, REST handlers, WebSocket progress streaming, and routing.
//! The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
