//! Parley Relay Library Crate
//!
//! The relay keeps upstream API keys on the server. It issues signed URLs for
//! the managed speech agent, proxies the WebRTC offer/answer exchange for the
//! live model, and serves a local text-streaming chat socket. The `relay`
//! binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod ws;
