use axum::extract::ws::Message;
use khanasathi_proto::ServerEvent;

use super::ConnectionSender;

/// Encode a server event as a JSON text frame.
pub fn encode_event(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::error!(error = %e, event = event.kind().as_str(), "Failed to encode event");
            None
        }
    }
}

/// Push an event straight onto one connection's outbound channel.
pub fn send_event(tx: &ConnectionSender, event: &ServerEvent) {
    if let Some(msg) = encode_event(event) {
        let _ = tx.send(msg);
    }
}

/// Send an error frame, optionally echoing the request id.
pub fn send_error(tx: &ConnectionSender, request_id: Option<&str>, code: u16, message: &str) {
    send_event(tx, &ServerEvent::error(request_id, code, message));
}
