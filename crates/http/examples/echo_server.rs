//! Serves `GET /` with a greeting, echoes request bodies on `POST /echo` and echoes WebSocket
//! messages on `/ws`.
//!
//! ```text
//! cargo run --example echo_server
//! curl -d 'hello' http://127.0.0.1:8080/echo
//! ```

use async_trait::async_trait;
use http::{Method, StatusCode};
use stage_http::config::ServerConfig;
use stage_http::pipeline::{Outcome, ProgressTask, Service, ServiceData, Stage};
use stage_http::protocol::{HttpError, WebSocketError};
use stage_http::server::Server;
use stage_http::source::BytesSource;
use stage_http::websocket::{CloseReason, Message, WebSocketHandler, WebSocketSender, WebSocketService};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

struct HelloWorld;

#[async_trait]
impl Service for HelloWorld {
    fn stage(&self) -> Stage {
        Stage::CreateDocument
    }

    fn can_handle(&self, task: &ProgressTask) -> Option<ServiceData> {
        let request = task.request()?;
        (request.method() == Method::GET && request.uri().path() == "/").then(ServiceData::none)
    }

    async fn execute(&self, task: &mut ProgressTask, _data: ServiceData) -> Result<Outcome, HttpError> {
        task.document_mut().push_source(BytesSource::text("Hello World!\r\n"));
        Ok(Outcome::Continue)
    }
}

struct EchoBody;

#[async_trait]
impl Service for EchoBody {
    fn stage(&self) -> Stage {
        Stage::CreateDocument
    }

    fn can_handle(&self, task: &ProgressTask) -> Option<ServiceData> {
        let request = task.request()?;
        (request.uri().path() == "/echo").then(ServiceData::none)
    }

    async fn execute(&self, task: &mut ProgressTask, _data: ServiceData) -> Result<Outcome, HttpError> {
        if task.request().is_some_and(|request| request.method() != Method::POST) {
            return Ok(Outcome::abort(StatusCode::METHOD_NOT_ALLOWED));
        }

        let body = task.content().read_to_end().await.map_err(HttpError::service)?;
        info!(length = body.len(), "echo request body");
        task.document_mut().push_source(BytesSource::new(body));
        Ok(Outcome::Continue)
    }
}

struct Echo;

#[async_trait]
impl WebSocketHandler for Echo {
    async fn on_open(&self, sender: &WebSocketSender) {
        info!(connection_id = sender.connection_id(), "websocket opened");
    }

    async fn on_message(&self, sender: &WebSocketSender, message: Message) -> Result<(), WebSocketError> {
        match message {
            Message::Text(text) => sender.send_text(&text).await,
            Message::Binary(data) => sender.send_binary(data).await,
        }
    }

    async fn on_close(&self, reason: Option<CloseReason>, info: Option<String>) {
        info!(?reason, ?info, "websocket closed");
    }
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let server = Server::builder()
        .config(ServerConfig::default())
        .with_default_services()
        .service(WebSocketService::new().endpoint("/ws", Echo))
        .service(HelloWorld)
        .service(EchoBody)
        .build();

    let bound = match server.bind().await {
        Ok(bound) => bound,
        Err(e) => {
            error!(cause = %e, "bind server error");
            return;
        }
    };
    info!(address = %bound.local_addr(), "echo server ready");

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    bound.run(shutdown).await;
}
