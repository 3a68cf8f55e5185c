use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::reader::NetworkReader;

pub type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// What a readiness probe found on an idle connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Nothing arrived yet.
    Idle,
    /// New request bytes are buffered.
    Readable,
    /// The peer closed the connection or it failed.
    Closed,
}

/// One client connection with its buffered reader and writer.
pub struct Connection {
    id: u64,
    remote_addr: SocketAddr,
    reader: NetworkReader<BoxedReader>,
    writer: BoxedWriter,
    last_activity: Instant,
}

impl Connection {
    pub fn new<R, W>(id: u64, remote_addr: SocketAddr, reader: R, writer: W, block_size: usize) -> Self
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
        W: AsyncWrite + Send + Sync + Unpin + 'static,
    {
        Self {
            id,
            remote_addr,
            reader: NetworkReader::with_capacity(Box::new(reader), block_size),
            writer: Box::new(writer),
            last_activity: Instant::now(),
        }
    }

    /// Wraps an accepted TCP stream.
    pub fn from_tcp(id: u64, stream: TcpStream, block_size: usize) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(id, remote_addr, reader, writer, block_size))
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn reader(&self) -> &NetworkReader<BoxedReader> {
        &self.reader
    }

    pub fn reader_mut(&mut self) -> &mut NetworkReader<BoxedReader> {
        &mut self.reader
    }

    pub fn writer_mut(&mut self) -> &mut BoxedWriter {
        &mut self.writer
    }

    /// Marks the connection as active now.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Checks without waiting whether the peer sent more data or went away.
    pub fn probe(&mut self) -> Probe {
        if self.reader.buffered() > 0 {
            return Probe::Readable;
        }

        match self.reader.try_fill() {
            None => Probe::Idle,
            Some(Ok(0)) => Probe::Closed,
            Some(Ok(_)) => Probe::Readable,
            Some(Err(e)) => {
                trace!(connection_id = self.id, cause = %e, "probe failed");
                Probe::Closed
            }
        }
    }

    /// Flushes and shuts down the write side.
    pub async fn shutdown(mut self) -> io::Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await
    }

    pub fn into_parts(self) -> (NetworkReader<BoxedReader>, BoxedWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("buffered", &self.reader.buffered())
            .field("idle_for", &self.idle_for())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Connection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(server);
        (Connection::new(1, SocketAddr::from(([127, 0, 0, 1], 9000)), reader, writer, 1024), client)
    }

    #[tokio::test]
    async fn probe_reports_state() {
        let (mut connection, mut client) = pair();
        assert_eq!(connection.probe(), Probe::Idle);

        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        assert_eq!(connection.probe(), Probe::Readable);
        // buffered bytes keep the connection readable
        assert_eq!(connection.probe(), Probe::Readable);

        drop(client);
        let mut reader = connection.into_parts().0;
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("GET / HTTP/1.1"));
        assert!(reader.try_fill().is_some());
    }

    #[tokio::test]
    async fn probe_detects_close() {
        let (mut connection, client) = pair();
        drop(client);
        assert_eq!(connection.probe(), Probe::Closed);
    }
}
