//! An embeddable asynchronous HTTP/1.1 server with a staged service pipeline
//!
//! Every request travels through seven fixed stages. Services register for one stage with a
//! priority, and the engine runs the matching services of each stage in priority order. The
//! protocol work (reading and parsing the request, framing and sending the response) is done by
//! built-in services, so applications only add the services producing their documents.
//!
//! # Features
//!
//! - HTTP/1.1 (and HTTP/1.0) request parsing with header size limits
//! - Keep-alive connections, polled and evicted by a periodic sweep
//! - `Expect: 100-continue`
//! - Byte range requests, including `multipart/byteranges` responses
//! - Chunked transfer encoding for bodies of unknown length
//! - WebSocket upgrade with fragment reassembly and ping/pong handling
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use stage_http::pipeline::{Outcome, ProgressTask, Service, ServiceData, Stage};
//! use stage_http::protocol::HttpError;
//! use stage_http::server::Server;
//! use stage_http::source::BytesSource;
//! use tokio_util::sync::CancellationToken;
//! use tracing::{Level, error};
//! use tracing_subscriber::FmtSubscriber;
//!
//! struct HelloWorld;
//!
//! #[async_trait]
//! impl Service for HelloWorld {
//!     fn stage(&self) -> Stage {
//!         Stage::CreateDocument
//!     }
//!
//!     fn can_handle(&self, task: &ProgressTask) -> Option<ServiceData> {
//!         let request = task.request()?;
//!         (request.uri().path() == "/").then(ServiceData::none)
//!     }
//!
//!     async fn execute(&self, task: &mut ProgressTask, _data: ServiceData) -> Result<Outcome, HttpError> {
//!         task.document_mut().push_source(BytesSource::text("Hello World!\r\n"));
//!         Ok(Outcome::Continue)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
//!     tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
//!
//!     let server = Server::builder().with_default_services().service(HelloWorld).build();
//!     let bound = match server.bind().await {
//!         Ok(bound) => bound,
//!         Err(e) => {
//!             error!(cause = %e, "bind server error");
//!             return;
//!         }
//!     };
//!
//!     bound.run(CancellationToken::new()).await;
//! }
//! ```
//!
//! # Architecture
//!
//! - [`server`]: accept loop, keep-alive sweep and the per-connection driver
//! - [`pipeline`]: stages, services, the progress task and the execution engine
//! - [`services`]: the built-in protocol services
//! - [`reader`]: the buffered byte/char reader and bounded request content
//! - [`source`]: response bodies ([`source::HttpDataSource`]) and their transfer framing
//! - [`codec`]: response head and chunk encoders
//! - [`websocket`]: frame codec, handshake and upgraded connections
//! - [`protocol`]: request/response types and errors
//! - [`config`]: server and WebSocket settings
//!
//! ## Stages
//!
//! | stage | execution | built-in services |
//! |---|---|---|
//! | ReadRequest | single | request reader |
//! | ParseRequest | multi | request parser, expect-continue |
//! | CreateDocument | single | WebSocket upgrade (when registered) |
//! | ProcessDocument | multi | range requests |
//! | CreateResponse | multi | response creator |
//! | SendResponse | single | response sender |
//! | Cleanup | multi | request body drain |
//!
//! On a single-execution stage the first matching service ends the stage. A service may route
//! the task forward by setting its next stage, never backwards, and may end its stage early by
//! returning [`pipeline::Outcome::Abort`] with a status, which continues at `CreateResponse`.
//!
//! ## Error Handling
//!
//! - [`protocol::HttpError`]: top-level error type returned by services
//! - [`protocol::ParseError`]: request reading and parsing errors, mapped to 4xx statuses
//! - [`protocol::SendError`]: response sending errors
//! - [`protocol::WebSocketError`]: handshake and frame errors
//!
//! An error returned by a service ends the connection and is logged; it never reaches the
//! accept loop.
//!
//! # Limitations
//!
//! - HTTP/1.1 only (HTTP/2 or HTTP/3 is not supported)
//! - No TLS support (use a reverse proxy for HTTPS)
//! - Request bodies with `Transfer-Encoding` are refused with `411 Length Required`

pub mod codec;
pub mod config;
pub mod pipeline;
pub mod protocol;
pub mod reader;
pub mod server;
pub mod services;
pub mod source;
pub mod websocket;

mod utils;
pub(crate) use utils::ensure;
