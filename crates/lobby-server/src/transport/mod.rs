//! Transport layer.

pub mod websocket;

pub use websocket::{start_listener, ws_close, ws_send_event, WebSocketConnection};
