//! WebSocket endpoints served by the relay.
//!
//! - `chat`: a local text-streaming agent that echoes user messages back as a
//!   token stream, used as the client's fallback channel.

pub mod chat;

pub use chat::chat_handler;
