//! Chat line formatting.
//!
//! Outbound frames are unstructured UTF-8 text; these exact shapes are the
//! wire contract with clients.

/// Format a relayed chat line.
#[must_use]
pub fn chat(room: &str, client_id: &str, text: &str) -> String {
    format!("[{room}]{client_id}: {text}")
}

/// Format the notice published when a client joins a room.
#[must_use]
pub fn joined(room: &str, client_id: &str) -> String {
    format!("Client {client_id} joined the {room}")
}

/// Format the notice published when a client leaves a room.
#[must_use]
pub fn left(room: &str, client_id: &str) -> String {
    format!("Client [{room}]{client_id} left the chat")
}
