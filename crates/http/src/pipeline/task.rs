//! The per request unit of work.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use http::StatusCode;
use tracing::warn;

use crate::config::ServerConfig;
use crate::pipeline::{Document, Monitor, Stage};
use crate::protocol::{PayloadSize, RawRequestHead, RequestHeader, ResponseHead, is_keep_alive};
use crate::reader::{BodyState, ContentStream, NetworkReader};
use crate::server::{BoxedReader, BoxedWriter, Connection};

/// Takes over the raw streams of a connection after a protocol switch.
pub type SwitchProtocol = Box<dyn FnOnce(NetworkReader<BoxedReader>, BoxedWriter) -> BoxFuture<'static, ()> + Send>;

/// State of one request travelling through the stages.
///
/// The task owns the connection while the chain runs. Afterwards the connection is handed back
/// with [`into_connection`](ProgressTask::into_connection), or to another protocol when a service
/// installed a [`SwitchProtocol`] handoff.
pub struct ProgressTask {
    config: Arc<ServerConfig>,
    connection: Connection,
    raw_request: Option<RawRequestHead>,
    request: Option<RequestHeader>,
    response: ResponseHead,
    status_set: bool,
    document: Document,
    current_stage: Stage,
    next_stage: Option<Stage>,
    matched: [bool; 7],
    body: BodyState,
    payload_size: Option<PayloadSize>,
    broken: bool,
    close_connection: bool,
    switch_protocol: Option<SwitchProtocol>,
    monitor: Monitor,
}

impl ProgressTask {
    pub fn new(connection: Connection, config: Arc<ServerConfig>) -> Self {
        Self {
            config,
            connection,
            raw_request: None,
            request: None,
            response: ResponseHead::new(()),
            status_set: false,
            document: Document::new(),
            current_stage: Stage::FIRST,
            next_stage: Stage::FIRST.next(),
            matched: [false; 7],
            body: BodyState::default(),
            payload_size: None,
            broken: false,
            close_connection: false,
            switch_protocol: None,
            monitor: Monitor::default(),
        }
    }

    #[must_use]
    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn connection_id(&self) -> u64 {
        self.connection.id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_addr()
    }

    pub fn reader_mut(&mut self) -> &mut NetworkReader<BoxedReader> {
        self.connection.reader_mut()
    }

    pub fn writer_mut(&mut self) -> &mut BoxedWriter {
        self.connection.writer_mut()
    }

    pub fn raw_request(&self) -> Option<&RawRequestHead> {
        self.raw_request.as_ref()
    }

    pub fn set_raw_request(&mut self, raw_request: RawRequestHead) {
        self.raw_request = Some(raw_request);
    }

    pub fn take_raw_request(&mut self) -> Option<RawRequestHead> {
        self.raw_request.take()
    }

    pub fn request(&self) -> Option<&RequestHeader> {
        self.request.as_ref()
    }

    pub fn set_request(&mut self, request: RequestHeader) {
        *self.response.version_mut() = request.version();
        self.request = Some(request);
    }

    /// Whether the request was a `HEAD` request.
    pub fn is_head(&self) -> bool {
        self.request.as_ref().is_some_and(|request| request.method() == http::Method::HEAD)
    }

    pub fn response(&self) -> &ResponseHead {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ResponseHead {
        &mut self.response
    }

    pub fn set_status(&mut self, status: StatusCode) {
        *self.response.status_mut() = status;
        self.status_set = true;
    }

    /// Whether any service chose the response status explicitly.
    pub fn status_set(&self) -> bool {
        self.status_set
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.document
    }

    pub fn current_stage(&self) -> Stage {
        self.current_stage
    }

    pub fn next_stage(&self) -> Option<Stage> {
        self.next_stage
    }

    /// Routes the task to `stage` once the current stage finished.
    ///
    /// Moving backwards is refused, returning `false`.
    pub fn set_next_stage(&mut self, stage: Stage) -> bool {
        if stage < self.current_stage {
            warn!(current = %self.current_stage, requested = %stage, "refuse to move the task backwards");
            return false;
        }
        self.next_stage = Some(stage);
        true
    }

    /// Enters the next stage, returning it.
    pub(crate) fn advance(&mut self) -> Option<Stage> {
        let stage = self.next_stage?;
        self.current_stage = stage;
        self.next_stage = stage.next();
        Some(stage)
    }

    pub(crate) fn mark_matched(&mut self, stage: Stage) {
        self.matched[stage.index()] = true;
    }

    /// Whether any service matched in `stage`.
    pub fn stage_matched(&self, stage: Stage) -> bool {
        self.matched[stage.index()]
    }

    pub fn body_state(&self) -> BodyState {
        self.body
    }

    pub fn set_body_length(&mut self, length: u64) {
        self.body = BodyState::new(length);
    }

    /// The request content not read yet.
    pub fn content(&mut self) -> ContentStream<'_, BoxedReader> {
        ContentStream::new(self.connection.reader_mut(), &mut self.body)
    }

    pub fn payload_size(&self) -> Option<PayloadSize> {
        self.payload_size
    }

    pub fn set_payload_size(&mut self, payload_size: PayloadSize) {
        self.payload_size = Some(payload_size);
    }

    /// Whether the connection failed while the task was running.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    /// Closes the connection after this request regardless of keep-alive.
    pub fn set_close_connection(&mut self) {
        self.close_connection = true;
    }

    /// Whether the connection may serve another request once this task finished.
    pub fn keeps_alive(&self) -> bool {
        !self.broken
            && !self.close_connection
            && self.switch_protocol.is_none()
            && !self.connection.reader().is_exhausted()
            && is_keep_alive(&self.response)
    }

    pub fn set_switch_protocol<F>(&mut self, handoff: F)
    where
        F: FnOnce(NetworkReader<BoxedReader>, BoxedWriter) -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.switch_protocol = Some(Box::new(handoff));
    }

    pub fn has_switch_protocol(&self) -> bool {
        self.switch_protocol.is_some()
    }

    pub(crate) fn take_switch_protocol(&mut self) -> Option<SwitchProtocol> {
        self.switch_protocol.take()
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn monitor_mut(&mut self) -> &mut Monitor {
        &mut self.monitor
    }

    /// Releases the connection, dropping the data sources of this request.
    pub fn into_connection(self) -> Connection {
        self.connection
    }
}

impl fmt::Debug for ProgressTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTask")
            .field("connection", &self.connection)
            .field("request", &self.request)
            .field("status", &self.response.status())
            .field("current_stage", &self.current_stage)
            .field("next_stage", &self.next_stage)
            .field("document", &self.document)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    /// A task over an in-memory connection, returning the client end.
    pub(crate) fn task_with_config(config: ServerConfig) -> (ProgressTask, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);
        let connection = Connection::new(7, SocketAddr::from(([127, 0, 0, 1], 40000)), reader, writer, config.read_buffer_size);
        (ProgressTask::new(connection, Arc::new(config)), client)
    }

    pub(crate) fn task() -> (ProgressTask, DuplexStream) {
        task_with_config(ServerConfig::default())
    }

    #[test]
    fn next_stage_never_moves_backwards() {
        let (mut task, _client) = task();
        assert_eq!(task.current_stage(), Stage::ReadRequest);
        assert_eq!(task.next_stage(), Some(Stage::ParseRequest));

        assert!(task.set_next_stage(Stage::CreateResponse));
        assert_eq!(task.advance(), Some(Stage::CreateResponse));
        assert_eq!(task.next_stage(), Some(Stage::SendResponse));

        assert!(!task.set_next_stage(Stage::ParseRequest));
        assert_eq!(task.next_stage(), Some(Stage::SendResponse));
    }

    #[test]
    fn keeps_alive_follows_response_header() {
        let (mut task, _client) = task();
        assert!(!task.keeps_alive());

        task.response_mut().headers_mut().insert(http::header::CONNECTION, crate::protocol::KEEP_ALIVE);
        assert!(task.keeps_alive());

        task.set_close_connection();
        assert!(!task.keeps_alive());
    }
}
