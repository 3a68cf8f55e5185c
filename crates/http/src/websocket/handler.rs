use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::WebSocketError;
use crate::websocket::{CloseReason, Message, WebSocketSender};

/// Application callbacks for one WebSocket endpoint.
///
/// One handler instance serves every connection of its endpoint, so per-connection state
/// belongs in whatever the handler keys by [`WebSocketSender::connection_id`].
#[async_trait]
pub trait WebSocketHandler: Send + Sync {
    /// Picks one of the sub-protocols the client offered, in the client's order.
    fn select_protocol(&self, offered: &[String]) -> Option<String> {
        let _ = offered;
        None
    }

    async fn on_open(&self, sender: &WebSocketSender) {
        let _ = sender;
    }

    /// A complete, reassembled message. Returning an error closes the connection with
    /// [`CloseReason::InternalError`].
    async fn on_message(&self, sender: &WebSocketSender, message: Message) -> Result<(), WebSocketError>;

    async fn on_pong(&self, sender: &WebSocketSender, payload: Bytes) {
        let _ = (sender, payload);
    }

    /// Called exactly once per connection, with the peer's close code and text when it sent any.
    async fn on_close(&self, reason: Option<CloseReason>, info: Option<String>) {
        let _ = (reason, info);
    }
}
