//! WebSocket support: frames and their codec, the opening handshake, upgraded connections
//! and the service performing the upgrade.

mod close;
mod codec;
mod connection;
mod frame;
mod handler;
mod handshake;
mod service;

pub use close::{CloseReason, close_payload, parse_close_payload};
pub use codec::FrameCodec;
pub use connection::{Message, WebSocketConnection, WebSocketSender, WebSocketState};
pub use frame::{Frame, OpCode};
pub use handler::WebSocketHandler;
pub use handshake::{WEBSOCKET_VERSION, accept_key, offered_protocols, validate_upgrade, write_accept};
pub use service::WebSocketService;
