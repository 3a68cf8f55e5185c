//! An upgraded WebSocket connection.
//!
//! After the `101` response the raw stream is split in two halves. The read half feeds a
//! receive loop that reassembles messages and answers control frames, the write half sits
//! behind a mutex shared by every sender so that one frame is written at a time. A ping
//! loop runs next to the receive loop and both are joined before the connection reports
//! itself closed.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::WebSocketConfig;
use crate::ensure;
use crate::protocol::WebSocketError;
use crate::reader::NetworkReader;
use crate::server::{BoxedReader, BoxedWriter};
use crate::websocket::{CloseReason, Frame, FrameCodec, OpCode, WebSocketHandler, close_payload, parse_close_payload};

/// How long to wait for the peer's close frame after we sent ours.
const CLOSE_GRACE: Duration = Duration::from_secs(5);
const MAX_CONTROL_PAYLOAD: usize = 125;

type FrameWriter = FramedWrite<BoxedWriter, FrameCodec>;

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketState {
    Open,
    /// The peer sent a close frame, ours is not out yet.
    CloseReceived,
    /// We sent a close frame and wait for the peer's.
    CloseSent,
    Closed,
}

struct Shared {
    connection_id: u64,
    config: WebSocketConfig,
    writer: Arc<Mutex<FrameWriter>>,
    close_sent: AtomicBool,
    close_received: AtomicBool,
    closed: AtomicBool,
    close_notified: AtomicBool,
    last_pong: ArcSwapOption<Instant>,
    opened_at: Instant,
    shutdown: CancellationToken,
    handler: Arc<dyn WebSocketHandler>,
}

impl Shared {
    /// Fires the close callback unless it already ran.
    async fn notify_close(&self, reason: Option<CloseReason>, info: Option<String>) {
        if self.close_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(connection_id = self.connection_id, reason = ?reason, "websocket connection closed");
        self.handler.on_close(reason, info).await;
    }
}

/// A cloneable handle writing frames to one connection.
#[derive(Clone)]
pub struct WebSocketSender {
    shared: Arc<Shared>,
}

impl fmt::Debug for WebSocketSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketSender")
            .field("connection_id", &self.shared.connection_id)
            .field("state", &self.state())
            .finish()
    }
}

impl WebSocketSender {
    pub fn connection_id(&self) -> u64 {
        self.shared.connection_id
    }

    pub async fn send_text(&self, text: &str) -> Result<(), WebSocketError> {
        self.send(Frame::text(text)).await
    }

    pub async fn send_binary(&self, data: impl AsRef<[u8]>) -> Result<(), WebSocketError> {
        self.send(Frame::binary(data.as_ref())).await
    }

    pub async fn ping(&self, payload: &[u8]) -> Result<(), WebSocketError> {
        ensure!(payload.len() <= MAX_CONTROL_PAYLOAD, WebSocketError::protocol("ping payload exceeds 125 bytes"));
        self.send(Frame::ping(payload)).await
    }

    async fn pong(&self, payload: BytesMut) -> Result<(), WebSocketError> {
        self.send(Frame::pong(payload)).await
    }

    /// Starts the closing handshake. A second call fails with [`WebSocketError::Closed`].
    pub async fn close(&self, reason: Option<CloseReason>, info: Option<&str>) -> Result<(), WebSocketError> {
        self.send(Frame::close(close_payload(reason, info))).await
    }

    pub fn state(&self) -> WebSocketState {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return WebSocketState::Closed;
        }
        match (shared.close_received.load(Ordering::Acquire), shared.close_sent.load(Ordering::Acquire)) {
            (false, false) => WebSocketState::Open,
            (true, false) => WebSocketState::CloseReceived,
            (false, true) => WebSocketState::CloseSent,
            (true, true) => WebSocketState::Closed,
        }
    }

    /// When the last pong arrived, if any did.
    pub fn last_pong(&self) -> Option<Instant> {
        self.shared.last_pong.load().as_deref().copied()
    }

    async fn send(&self, frame: Frame) -> Result<(), WebSocketError> {
        let shared = &self.shared;
        let mut writer = shared.writer.lock().await;

        ensure!(!shared.closed.load(Ordering::Acquire), WebSocketError::Closed);
        if frame.opcode == OpCode::Close {
            // a close frame goes out once, never retried
            ensure!(!shared.close_sent.swap(true, Ordering::AcqRel), WebSocketError::Closed);
        } else {
            ensure!(!shared.close_sent.load(Ordering::Acquire), WebSocketError::Closed);
        }

        trace!(connection_id = shared.connection_id, opcode = ?frame.opcode, length = frame.payload_len(), "send websocket frame");
        if let Err(e) = writer.send(frame).await {
            drop(writer);
            debug!(connection_id = shared.connection_id, cause = %e, "websocket send failed, treat as closed");
            shared.close_sent.store(true, Ordering::Release);
            shared.close_received.store(true, Ordering::Release);
            shared.shutdown.cancel();
            shared.notify_close(None, None).await;
            return Err(e);
        }
        Ok(())
    }
}

/// A message being reassembled from fragments.
struct Fragments {
    opcode: OpCode,
    payload: BytesMut,
}

/// How the receive loop ended.
enum ReceiveEnd {
    /// The closing handshake finished or was given up on.
    Closed { reason: Option<CloseReason>, info: Option<String> },
    /// The stream ended or failed without a close frame.
    Dropped,
}

/// Owns both halves of an upgraded stream until the connection is closed.
pub struct WebSocketConnection {
    frames: FramedRead<BoxedReader, FrameCodec>,
    sender: WebSocketSender,
    handshake_gate: Option<OwnedMutexGuard<FrameWriter>>,
}

impl fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConnection").field("sender", &self.sender).finish_non_exhaustive()
    }
}

impl WebSocketConnection {
    /// Takes over a connection right after the upgrade response.
    ///
    /// Bytes the HTTP reader already buffered are the beginning of the frame stream. No frame
    /// can be written until [`WebSocketConnection::handshake_finished`] is called.
    pub fn new(
        connection_id: u64,
        reader: NetworkReader<BoxedReader>,
        writer: BoxedWriter,
        config: WebSocketConfig,
        handler: Arc<dyn WebSocketHandler>,
    ) -> Self {
        let (reader, leftover) = reader.into_parts();
        let mut frames = FramedRead::new(reader, FrameCodec::new(config.max_payload).error_on_oversize(true));
        frames.read_buffer_mut().extend_from_slice(&leftover);

        let writer = Arc::new(Mutex::new(FramedWrite::new(writer, FrameCodec::new(config.max_payload))));
        // senders handed out before `handshake_finished` wait here; when the handoff runs after
        // the upgrade response was flushed, `run` opens the gate before anything is sent
        let handshake_gate = Arc::clone(&writer).try_lock_owned().ok();

        let shared = Arc::new(Shared {
            connection_id,
            config,
            writer,
            close_sent: AtomicBool::new(false),
            close_received: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_notified: AtomicBool::new(false),
            last_pong: ArcSwapOption::empty(),
            opened_at: Instant::now(),
            shutdown: CancellationToken::new(),
            handler,
        });

        Self { frames, sender: WebSocketSender { shared }, handshake_gate }
    }

    pub fn sender(&self) -> WebSocketSender {
        self.sender.clone()
    }

    /// Opens the send path once the upgrade response is on the wire.
    pub fn handshake_finished(&mut self) {
        self.handshake_gate.take();
    }

    /// Runs the receive and ping loops until the connection is closed.
    pub async fn run(mut self) {
        self.handshake_finished();
        let sender = self.sender.clone();
        let shared = Arc::clone(&sender.shared);
        info!(connection_id = shared.connection_id, "websocket connection opened");

        shared.handler.on_open(&sender).await;

        let receive = async {
            let end = receive_loop(&mut self.frames, &sender).await;
            shared.shutdown.cancel();
            end
        };
        let (end, ()) = tokio::join!(receive, ping_loop(&sender));

        {
            let mut writer = shared.writer.lock().await;
            if let Err(e) = writer.get_mut().shutdown().await {
                trace!(connection_id = shared.connection_id, cause = %e, "shutdown websocket stream");
            }
        }
        shared.closed.store(true, Ordering::Release);

        match end {
            ReceiveEnd::Closed { reason, info } => shared.notify_close(reason, info).await,
            ReceiveEnd::Dropped => shared.notify_close(None, None).await,
        }
    }
}

async fn receive_loop(frames: &mut FramedRead<BoxedReader, FrameCodec>, sender: &WebSocketSender) -> ReceiveEnd {
    let shared = &sender.shared;
    let max_payload = shared.config.max_payload;
    let mut fragments: Option<Fragments> = None;

    loop {
        let next = if shared.close_sent.load(Ordering::Acquire) {
            tokio::select! {
                next = tokio::time::timeout(CLOSE_GRACE, frames.next()) => match next {
                    Ok(next) => next,
                    Err(_) => {
                        debug!(connection_id = shared.connection_id, "peer did not answer the close frame");
                        return ReceiveEnd::Closed { reason: None, info: None };
                    }
                },
                () = shared.shutdown.cancelled() => return ReceiveEnd::Dropped,
            }
        } else {
            tokio::select! {
                next = frames.next() => next,
                () = shared.shutdown.cancelled() => return ReceiveEnd::Dropped,
            }
        };

        let mut frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(WebSocketError::PayloadTooLarge { length, max_size })) => {
                info!(connection_id = shared.connection_id, length, max_size, "websocket frame too large");
                return fail(sender, CloseReason::MessageTooBig, "message too big").await;
            }
            Some(Err(WebSocketError::Io { source })) => {
                debug!(connection_id = shared.connection_id, cause = %source, "websocket read failed");
                return ReceiveEnd::Dropped;
            }
            Some(Err(e)) => {
                info!(connection_id = shared.connection_id, cause = %e, "websocket protocol error");
                return fail(sender, CloseReason::ProtocolError, "protocol error").await;
            }
            None => {
                debug!(connection_id = shared.connection_id, "websocket stream ended");
                return ReceiveEnd::Dropped;
            }
        };
        frame.unapply_mask();

        if frame.opcode.is_control() && (!frame.fin || frame.payload_len() > MAX_CONTROL_PAYLOAD) {
            return fail(sender, CloseReason::ProtocolError, "invalid control frame").await;
        }

        match frame.opcode {
            OpCode::Ping => {
                if let Err(e) = sender.pong(frame.payload).await {
                    trace!(connection_id = shared.connection_id, cause = %e, "skip pong");
                }
            }
            OpCode::Pong => {
                shared.last_pong.store(Some(Arc::new(Instant::now())));
                shared.handler.on_pong(sender, frame.into_payload()).await;
            }
            OpCode::Close => {
                let (reason, info) = parse_close_payload(&frame.payload);
                shared.close_received.store(true, Ordering::Release);
                if !shared.close_sent.load(Ordering::Acquire) {
                    let reply = reason.filter(|reason| reason.is_sendable());
                    if let Err(e) = sender.close(reply, None).await {
                        trace!(connection_id = shared.connection_id, cause = %e, "skip close reply");
                    }
                }
                shared.notify_close(reason, info.clone()).await;
                return ReceiveEnd::Closed { reason, info };
            }
            OpCode::Text | OpCode::Binary => {
                if fragments.is_some() {
                    return fail(sender, CloseReason::ProtocolError, "expected a continuation frame").await;
                }
                if frame.fin {
                    if let Some(end) = dispatch(sender, frame.opcode, frame.payload).await {
                        return end;
                    }
                } else {
                    fragments = Some(Fragments { opcode: frame.opcode, payload: frame.payload });
                }
            }
            OpCode::Continuation => {
                let Some(pending) = fragments.as_mut() else {
                    return fail(sender, CloseReason::ProtocolError, "continuation without a message").await;
                };
                if pending.payload.len() + frame.payload_len() > max_payload {
                    return fail(sender, CloseReason::MessageTooBig, "message too big").await;
                }
                pending.payload.extend_from_slice(&frame.payload);

                if frame.fin
                    && let Some(Fragments { opcode, payload }) = fragments.take()
                    && let Some(end) = dispatch(sender, opcode, payload).await
                {
                    return end;
                }
            }
        }
    }
}

/// Hands a complete message to the handler. Returns how the loop ends when the message
/// forced a close.
async fn dispatch(sender: &WebSocketSender, opcode: OpCode, payload: BytesMut) -> Option<ReceiveEnd> {
    let message = if opcode == OpCode::Text {
        match simdutf8::basic::from_utf8(&payload) {
            Ok(text) => Message::Text(text.to_string()),
            Err(_) => return Some(fail(sender, CloseReason::InvalidPayload, "invalid utf-8 text").await),
        }
    } else {
        Message::Binary(payload.freeze())
    };

    let shared = &sender.shared;
    match shared.handler.on_message(sender, message).await {
        Ok(()) => None,
        Err(WebSocketError::Closed) => None,
        Err(e) => {
            warn!(connection_id = shared.connection_id, cause = %e, "websocket handler failed");
            Some(fail(sender, CloseReason::InternalError, "internal error").await)
        }
    }
}

/// Closes from our side because of `reason`.
async fn fail(sender: &WebSocketSender, reason: CloseReason, info: &str) -> ReceiveEnd {
    if let Err(e) = sender.close(Some(reason), Some(info)).await {
        trace!(connection_id = sender.connection_id(), cause = %e, "skip close frame");
    }
    ReceiveEnd::Closed { reason: Some(reason), info: Some(info.to_string()) }
}

async fn ping_loop(sender: &WebSocketSender) {
    let shared = &sender.shared;
    let period = shared.config.ping_interval;
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            () = shared.shutdown.cancelled() => return,
        }
        if shared.close_sent.load(Ordering::Acquire) {
            return;
        }

        if let Some(pong_timeout) = shared.config.pong_timeout {
            let last_seen = sender.last_pong().unwrap_or(shared.opened_at);
            if last_seen.elapsed() > pong_timeout {
                info!(connection_id = shared.connection_id, "no pong within {:?}, closing", pong_timeout);
                if let Err(e) = sender.close(Some(CloseReason::GoingAway), Some("pong timeout")).await {
                    trace!(connection_id = shared.connection_id, cause = %e, "skip close frame");
                }
                shared.shutdown.cancel();
                return;
            }
        }

        if sender.ping(&[]).await.is_err() {
            return;
        }
    }
}
