//! Shareterm server: axum WebSocket endpoint over the shared registry.

mod web_server;

pub use web_server::run_web_server;
