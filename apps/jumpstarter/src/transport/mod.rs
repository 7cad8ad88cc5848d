//! Carriers for router calls other than in-process channels.

pub mod websocket;

pub use websocket::WebSocketCall;
