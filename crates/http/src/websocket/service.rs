use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use http::header::SEC_WEBSOCKET_VERSION;
use http::{HeaderValue, StatusCode};
use tracing::debug;

use crate::pipeline::{Outcome, ProgressTask, Service, ServiceData, Stage};
use crate::protocol::{HttpError, WebSocketError};
use crate::websocket::{
    WEBSOCKET_VERSION, WebSocketConnection, WebSocketHandler, offered_protocols, validate_upgrade, write_accept,
};

/// Upgrades requests for registered paths to WebSocket connections.
///
/// Runs first at `CreateDocument`. On success the response becomes `101 Switching Protocols`
/// and the connection is handed to a [`WebSocketConnection`] once the response is flushed.
#[derive(Default)]
pub struct WebSocketService {
    endpoints: HashMap<String, Arc<dyn WebSocketHandler>>,
}

impl fmt::Debug for WebSocketService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketService").field("endpoints", &self.endpoints.keys().collect::<Vec<_>>()).finish()
    }
}

impl WebSocketService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `path` with `handler`, replacing an earlier handler of the same path.
    #[must_use]
    pub fn endpoint<H: WebSocketHandler + 'static>(mut self, path: impl Into<String>, handler: H) -> Self {
        self.endpoints.insert(path.into(), Arc::new(handler));
        self
    }

    #[must_use]
    pub fn shared_endpoint(mut self, path: impl Into<String>, handler: Arc<dyn WebSocketHandler>) -> Self {
        self.endpoints.insert(path.into(), handler);
        self
    }
}

#[async_trait]
impl Service for WebSocketService {
    fn stage(&self) -> Stage {
        Stage::CreateDocument
    }

    fn priority(&self) -> i32 {
        -100
    }

    fn can_handle(&self, task: &ProgressTask) -> Option<ServiceData> {
        let path = task.request()?.uri().path();
        let handler = self.endpoints.get(path)?;
        Some(ServiceData::new(Arc::clone(handler)))
    }

    async fn execute(&self, task: &mut ProgressTask, data: ServiceData) -> Result<Outcome, HttpError> {
        let Some(handler) = data.downcast::<Arc<dyn WebSocketHandler>>() else {
            return Ok(Outcome::abort(StatusCode::INTERNAL_SERVER_ERROR));
        };
        let Some(request) = task.request() else {
            return Ok(Outcome::abort(StatusCode::BAD_REQUEST));
        };

        let key = match validate_upgrade(request) {
            Ok(key) => key,
            Err(WebSocketError::UnsupportedVersion { version }) => {
                debug!(connection_id = task.connection_id(), version, "unsupported websocket version");
                task.response_mut().headers_mut().insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static(WEBSOCKET_VERSION));
                return Ok(Outcome::abort(StatusCode::UPGRADE_REQUIRED));
            }
            Err(e) => {
                debug!(connection_id = task.connection_id(), cause = %e, "reject websocket upgrade");
                return Ok(Outcome::abort(StatusCode::BAD_REQUEST));
            }
        };
        let protocol = handler.select_protocol(&offered_protocols(request));

        task.set_status(StatusCode::SWITCHING_PROTOCOLS);
        write_accept(task.response_mut(), &key, protocol.as_deref())?;

        let config = task.config().websocket;
        let connection_id = task.connection_id();
        task.set_switch_protocol(move |reader, writer| {
            WebSocketConnection::new(connection_id, reader, writer, config, handler).run().boxed()
        });

        debug!(connection_id, protocol = ?protocol, "accept websocket upgrade");
        Ok(Outcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
    use http::Request;

    use super::*;
    use crate::pipeline::task_tests::task;
    use crate::websocket::{Message, WebSocketSender};

    struct Echo;

    #[async_trait]
    impl WebSocketHandler for Echo {
        fn select_protocol(&self, offered: &[String]) -> Option<String> {
            offered.iter().find(|protocol| *protocol == "echo").cloned()
        }

        async fn on_message(&self, sender: &WebSocketSender, message: Message) -> Result<(), WebSocketError> {
            match message {
                Message::Text(text) => sender.send_text(&text).await,
                Message::Binary(data) => sender.send_binary(data).await,
            }
        }
    }

    fn upgrade(path: &str, version: &str) -> Request<()> {
        Request::get(path)
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "Upgrade")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(SEC_WEBSOCKET_VERSION, version)
            .header("Sec-WebSocket-Protocol", "chat, echo")
            .body(())
            .unwrap()
    }

    #[tokio::test]
    async fn upgrades_registered_path() {
        let service = WebSocketService::new().endpoint("/ws", Echo);
        let (mut task, _client) = task();

        task.set_request(upgrade("/other", "13").into());
        assert!(service.can_handle(&task).is_none());

        task.set_request(upgrade("/ws", "13").into());
        let data = service.can_handle(&task).unwrap();
        assert!(matches!(service.execute(&mut task, data).await.unwrap(), Outcome::Continue));

        let response = task.response();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()[SEC_WEBSOCKET_ACCEPT], "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(response.headers()["sec-websocket-protocol"], "echo");
        assert!(task.has_switch_protocol());
    }

    #[tokio::test]
    async fn wrong_version_is_upgrade_required() {
        let service = WebSocketService::new().endpoint("/ws", Echo);
        let (mut task, _client) = task();
        task.set_request(upgrade("/ws", "8").into());

        let data = service.can_handle(&task).unwrap();
        let outcome = service.execute(&mut task, data).await.unwrap();

        assert!(matches!(outcome, Outcome::Abort { status: StatusCode::UPGRADE_REQUIRED, .. }));
        assert_eq!(task.response().headers()[SEC_WEBSOCKET_VERSION], "13");
        assert!(!task.has_switch_protocol());
    }

    #[tokio::test]
    async fn plain_request_is_bad_request() {
        let service = WebSocketService::new().endpoint("/ws", Echo);
        let (mut task, _client) = task();
        task.set_request(Request::get("/ws").body(()).unwrap().into());

        let data = service.can_handle(&task).unwrap();
        let outcome = service.execute(&mut task, data).await.unwrap();
        assert!(matches!(outcome, Outcome::Abort { status: StatusCode::BAD_REQUEST, .. }));
    }
}
