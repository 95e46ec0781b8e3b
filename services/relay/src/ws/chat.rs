//! Local text-streaming agent on `/ws/chat`.
//!
//! Sends `ready` on connect. Each `user_message` is answered with
//! `You said: <text>`, streamed one token every [`TOKEN_INTERVAL`] and closed
//! with `agent_response_done`.

use anyhow::Result;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use parley_core::protocol::{InboundMessage, OutboundMessage};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, error, info, instrument, warn};

pub const TOKEN_INTERVAL: Duration = Duration::from_millis(50);

type SocketSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn chat_handler(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(handle_socket)
}

#[instrument(name = "chat_session", skip_all)]
async fn handle_socket(socket: WebSocket) {
    info!("New chat connection");
    let (socket_tx, mut socket_rx) = socket.split();
    let socket_tx: SocketSink = Arc::new(Mutex::new(socket_tx));

    if let Err(e) = send_msg(&socket_tx, &InboundMessage::Ready).await {
        error!(error = ?e, "Failed to send ready message");
        return;
    }

    let mut replies: Vec<JoinHandle<()>> = Vec::new();
    while let Some(msg_result) = socket_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if let Some(reply) = handle_text(&socket_tx, text.as_str()).await {
                    replies.retain(|handle| !handle.is_finished());
                    replies.push(reply);
                }
            }
            Ok(Message::Binary(_)) => warn!("Ignoring binary frame on chat socket"),
            Ok(Message::Close(_)) => {
                info!("Client closed chat socket");
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                warn!(error = ?e, "Error receiving from chat socket");
                break;
            }
        }
    }

    for reply in replies {
        reply.abort();
    }
    info!("Chat connection closed");
}

/// Starts a streamed reply for a `user_message`. Malformed JSON gets an error
/// frame; other well-formed messages are ignored.
async fn handle_text(socket_tx: &SocketSink, text: &str) -> Option<JoinHandle<()>> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "Malformed chat message");
            let reply = InboundMessage::Error {
                error: "Malformed message".to_string(),
            };
            if let Err(e) = send_msg(socket_tx, &reply).await {
                warn!(error = ?e, "Failed to send error message");
            }
            return None;
        }
    };

    let OutboundMessage::UserMessage { text } = serde_json::from_value(value).ok()?;
    let socket_tx = socket_tx.clone();
    Some(tokio::spawn(async move {
        if let Err(e) = stream_reply(&socket_tx, &format!("You said: {text}")).await {
            debug!(error = ?e, "Reply stream stopped");
        }
    }))
}

async fn stream_reply(socket_tx: &SocketSink, reply: &str) -> Result<()> {
    let mut ticker = tokio::time::interval(TOKEN_INTERVAL);
    // The first tick completes immediately; tokens start one interval later.
    ticker.tick().await;
    for token in split_keep_whitespace(reply) {
        ticker.tick().await;
        send_msg(
            socket_tx,
            &InboundMessage::AgentResponseDelta {
                delta: token.to_string(),
            },
        )
        .await?;
    }
    ticker.tick().await;
    send_msg(socket_tx, &InboundMessage::AgentResponseDone).await
}

/// Splits into alternating word and whitespace-run tokens, keeping every character.
pub fn split_keep_whitespace(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut in_space: Option<bool> = None;
    for (i, c) in text.char_indices() {
        let space = c.is_whitespace();
        if in_space.is_some_and(|prev| prev != space) {
            tokens.push(&text[start..i]);
            start = i;
        }
        in_space = Some(space);
    }
    if start < text.len() {
        tokens.push(&text[start..]);
    }
    tokens
}

/// A helper function to serialize and send a message to the client.
async fn send_msg(socket_tx: &SocketSink, msg: &InboundMessage) -> Result<()> {
    let serialized = serde_json::to_string(msg)?;
    socket_tx
        .lock()
        .await
        .send(Message::Text(serialized.into()))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    #[test]
    fn test_split_keep_whitespace() {
        assert_eq!(
            split_keep_whitespace("You said: hi  there"),
            vec!["You", " ", "said:", " ", "hi", "  ", "there"]
        );
        assert_eq!(split_keep_whitespace(" lead"), vec![" ", "lead"]);
        assert_eq!(split_keep_whitespace("trail\n"), vec!["trail", "\n"]);
        assert!(split_keep_whitespace("").is_empty());
        assert_eq!(split_keep_whitespace("héllo wörld").concat(), "héllo wörld");
    }

    async fn connect() -> tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    > {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = axum::Router::new().route("/ws/chat", axum::routing::get(chat_handler));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let (socket, _) = connect_async(format!("ws://{}/ws/chat", addr)).await.unwrap();
        socket
    }

    async fn next_json<S>(socket: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .unwrap();
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_ready_then_streamed_echo() {
        let mut socket = connect().await;
        assert_eq!(next_json(&mut socket).await, json!({ "type": "ready" }));

        socket
            .send(WsMessage::Text(r#"{"type":"user_message","text":"hi there"}"#.into()))
            .await
            .unwrap();

        let mut reply = String::new();
        loop {
            let frame = next_json(&mut socket).await;
            match frame["type"].as_str() {
                Some("agent_response_delta") => reply.push_str(frame["delta"].as_str().unwrap()),
                Some("agent_response_done") => break,
                other => panic!("unexpected frame type {:?}", other),
            }
        }
        assert_eq!(reply, "You said: hi there");
    }

    #[tokio::test]
    async fn test_malformed_and_ignored_messages() {
        let mut socket = connect().await;
        next_json(&mut socket).await;

        socket.send(WsMessage::Text("{bad".into())).await.unwrap();
        assert_eq!(
            next_json(&mut socket).await,
            json!({ "type": "error", "error": "Malformed message" })
        );

        // Valid JSON that is not a user message produces nothing.
        socket
            .send(WsMessage::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();
        socket
            .send(WsMessage::Text(r#"{"type":"user_message","text":"x"}"#.into()))
            .await
            .unwrap();
        let frame = next_json(&mut socket).await;
        assert_eq!(frame, json!({ "type": "agent_response_delta", "delta": "You" }));
    }
}
