//! lobby-server: authenticated presence hub.
//!
//! Admits WebSocket clients that present a bearer token from the trusted
//! issuer, keeps every client's view of who else is online up to date,
//! relays directed messages between peers, and tracks the service resources
//! each peer advertises. A small HTTP API shares the same token admission.

pub mod auth;
pub mod config;
pub mod gateway;
pub mod handshake;
pub mod http;
pub mod relay;
pub mod server;
pub mod services;
pub mod transport;

pub use server::LobbyServer;
