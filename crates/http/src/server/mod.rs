//! Listening for connections and driving them through the pipeline.

mod connection;
mod http_server;

pub use connection::{BoxedReader, BoxedWriter, Connection, Probe};
pub use http_server::{BoundServer, Server, ServerBuilder, ServerHandle};
