//! Terminal rendering of session updates.

use parley_core::{SessionUpdate, conversation::Role};

/// Text to print for an update, written as-is. Deltas continue the current
/// line; a closed turn ends it.
pub fn render(update: &SessionUpdate) -> Option<String> {
    match update {
        SessionUpdate::MessageAppended(message) => match message.role {
            // The user already sees what they typed.
            Role::User => None,
            Role::Assistant => Some(format!("agent> {}", message.content)),
            Role::System => Some(format!("[system] {}\n", message.content)),
        },
        SessionUpdate::MessageUpdated { delta, .. } => Some(delta.clone()),
        SessionUpdate::TurnClosed { .. } => Some("\n".to_string()),
        SessionUpdate::Transcript {
            channel,
            text,
            is_final: true,
        } => Some(format!("[{channel}] heard: {text}\n")),
        SessionUpdate::Transcript { .. } => None,
        SessionUpdate::Notice { channel, reason } => Some(format!("[{channel}] error: {reason}\n")),
        SessionUpdate::Status { channel, status } => Some(format!("[{channel}] {status}\n")),
        SessionUpdate::Ready { channel } => Some(format!("[{channel}] ready\n")),
    }
}
