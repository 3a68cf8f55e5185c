//! The accept loop and the keep-alive sweep.
//!
//! Accepted connections are driven through the service pipeline on their own tokio task.
//! Between requests a keep-alive connection is parked in the server's keep-alive set, where a
//! periodic sweep either evicts it (closed by the peer, or idle for too long) or, once new
//! request bytes arrived, takes it out of the set and dispatches it again. Since only the
//! sweep takes connections out of the set, no connection is processed twice at a time.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::pipeline::{ChainOutcome, ConnectionTracker, Monitor, ProgressTask, Service, ServiceEngine, Services, Stage};
use crate::server::{Connection, Probe};
use crate::services::register_defaults;

/// Connections known to a running server.
///
/// A connection is either in `active` while a task chain runs on it, or owned by
/// `keep_alive` while it waits for its next request, never in both.
#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    active: DashMap<u64, SocketAddr>,
    keep_alive: DashMap<u64, Connection>,
}

impl Registry {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn park(&self, connection: Connection) {
        let id = connection.id();
        self.active.remove(&id);
        self.keep_alive.insert(id, connection);
    }

    fn unpark(&self, id: u64) -> Option<Connection> {
        let (_, connection) = self.keep_alive.remove(&id)?;
        self.active.insert(id, connection.remote_addr());
        Some(connection)
    }
}

impl ConnectionTracker for Registry {
    fn untrack(&self, connection_id: u64) {
        self.active.remove(&connection_id);
        self.keep_alive.remove(&connection_id);
    }
}

/// Builder of a [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    services: Services,
    monitor: bool,
}

impl ServerBuilder {
    fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn address(mut self, address: impl Into<SocketAddr>) -> Self {
        self.config.address = address.into();
        self
    }

    #[must_use]
    pub fn service<S: Service + 'static>(self, service: S) -> Self {
        self.services.add(service);
        self
    }

    /// Registers the built-in protocol services, see [`crate::services`].
    #[must_use]
    pub fn with_default_services(self) -> Self {
        register_defaults(&self.services);
        self
    }

    /// Records a [`Monitor`] tree for every request, logged at `trace` level.
    #[must_use]
    pub fn monitor(mut self, enabled: bool) -> Self {
        self.monitor = enabled;
        self
    }

    pub fn build(self) -> Server {
        Server { config: Arc::new(self.config), services: Arc::new(self.services), monitor: self.monitor }
    }
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder").field("config", &self.config).field("monitor", &self.monitor).finish_non_exhaustive()
    }
}

/// A configured server, not yet listening.
pub struct Server {
    config: Arc<ServerConfig>,
    services: Arc<Services>,
    monitor: bool,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server").field("config", &self.config).field("monitor", &self.monitor).finish_non_exhaustive()
    }
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The service registry; services may be added or removed while the server runs.
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Binds the listening socket of the configured address.
    pub async fn bind(self) -> io::Result<BoundServer> {
        let listener = match TcpListener::bind(self.config.address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(cause = %e, address = %self.config.address, "bind server error");
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(Registry::default());
        let engine = ServiceEngine::new(self.services).with_tracker(Arc::clone(&registry) as Arc<dyn ConnectionTracker>);
        let shared = Arc::new(Shared { config: self.config, engine, registry, monitor: self.monitor });

        Ok(BoundServer { listener, local_addr, shared })
    }

    /// Binds and runs the server on a new task.
    pub async fn spawn(self) -> io::Result<ServerHandle> {
        let bound = self.bind().await?;
        let local_addr = bound.local_addr();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(bound.run(shutdown.clone()));
        Ok(ServerHandle { local_addr, shutdown, task })
    }
}

/// State shared by the accept loop and every connection task.
struct Shared {
    config: Arc<ServerConfig>,
    engine: ServiceEngine,
    registry: Arc<Registry>,
    monitor: bool,
}

/// A server with a bound listening socket.
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl fmt::Debug for BoundServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundServer").field("local_addr", &self.local_addr).finish_non_exhaustive()
    }
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections currently running a task chain and parked for keep-alive.
    pub fn connection_counts(&self) -> (usize, usize) {
        (self.shared.registry.active.len(), self.shared.registry.keep_alive.len())
    }

    /// Accepts connections until `shutdown` is cancelled.
    ///
    /// Parked keep-alive connections are closed on shutdown, connections in the middle of a
    /// request finish that request first.
    pub async fn run(self, shutdown: CancellationToken) {
        let config = Arc::clone(&self.shared.config);
        let mut tick = tokio::time::interval(config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(address = %self.local_addr, "start listening");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    self.on_accept(accepted);
                    // take what is already waiting, bounded so the sweep keeps its pace
                    for _ in 1..config.max_accepts_per_tick {
                        match self.listener.accept().now_or_never() {
                            Some(accepted) => self.on_accept(accepted),
                            None => break,
                        }
                    }
                }
                _ = tick.tick() => self.sweep_keep_alive(),
            }
        }

        let parked = self.shared.registry.keep_alive.len();
        self.shared.registry.keep_alive.clear();
        info!(address = %self.local_addr, parked, "server stopped");
    }

    fn on_accept(&self, accepted: io::Result<(TcpStream, SocketAddr)>) {
        let (stream, remote_addr) = match accepted {
            Ok(stream_and_addr) => stream_and_addr,
            Err(e) => {
                warn!(cause = %e, "failed to accept");
                return;
            }
        };

        let id = self.shared.registry.next_id();
        let connection = match Connection::from_tcp(id, stream, self.shared.config.read_buffer_size) {
            Ok(connection) => connection,
            Err(e) => {
                warn!(cause = %e, %remote_addr, "failed to set up connection");
                return;
            }
        };

        debug!(connection_id = id, %remote_addr, "accept connection");
        self.shared.registry.active.insert(id, remote_addr);
        tokio::spawn(drive(Arc::clone(&self.shared), connection));
    }

    fn sweep_keep_alive(&self) {
        let registry = &self.shared.registry;
        let timeout = self.shared.config.keep_alive_timeout;
        let ids: Vec<u64> = registry.keep_alive.iter().map(|entry| *entry.key()).collect();

        for id in ids {
            let Some(mut connection) = registry.keep_alive.get_mut(&id) else {
                continue;
            };
            let probe = connection.probe();
            let idle_for = connection.idle_for();
            drop(connection);

            match probe {
                Probe::Readable => {
                    if let Some(connection) = registry.unpark(id) {
                        trace!(connection_id = id, "dispatch keep-alive connection");
                        tokio::spawn(drive(Arc::clone(&self.shared), connection));
                    }
                }
                Probe::Closed => {
                    registry.keep_alive.remove(&id);
                    debug!(connection_id = id, "keep-alive connection closed by peer");
                }
                Probe::Idle if idle_for > timeout => {
                    registry.keep_alive.remove(&id);
                    debug!(connection_id = id, idle_ms = idle_for.as_millis(), "evict idle keep-alive connection");
                }
                Probe::Idle => {}
            }
        }
    }
}

/// Runs requests on one connection until it is closed, parked or handed over.
async fn drive(shared: Arc<Shared>, mut connection: Connection) {
    loop {
        let id = connection.id();
        let mut task = ProgressTask::new(connection, Arc::clone(&shared.config));
        if shared.monitor {
            task = task.with_monitor(Monitor::enabled());
        }

        let task = match shared.engine.execute_task_chain(task, Stage::LAST).await {
            Ok(ChainOutcome::Finished(task)) => task,
            Ok(ChainOutcome::Switched) => return,
            Err(e) => {
                error!(connection_id = id, cause = %e, "service has error, connection shutdown");
                shared.registry.untrack(id);
                return;
            }
        };

        if shared.monitor {
            for watch in task.monitor().watches() {
                trace!(connection_id = id, watch = watch.name(), elapsed = ?watch.elapsed(), logs = ?watch.logs(), "monitor");
            }
        }

        let keep_alive = task.keeps_alive();
        let mut next = task.into_connection();
        if !keep_alive {
            shared.registry.untrack(id);
            if let Err(e) = next.shutdown().await {
                trace!(connection_id = id, cause = %e, "shutdown connection");
            }
            debug!(connection_id = id, "finished process, connection shutdown");
            return;
        }

        // refreshed only now, so a connection is never swept while a chain runs on it
        next.touch();
        if next.reader().buffered() > 0 {
            // a pipelined request is already here
            connection = next;
            continue;
        }
        shared.registry.park(next);
        return;
    }
}

/// A server running on its own task.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and waits for the accept loop to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!(cause = %e, "server task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Notify;

    use super::*;
    use crate::pipeline::{Outcome, ServiceData};
    use crate::protocol::HttpError;
    use crate::source::BytesSource;

    struct Hello;

    #[async_trait]
    impl Service for Hello {
        fn stage(&self) -> Stage {
            Stage::CreateDocument
        }

        fn can_handle(&self, task: &ProgressTask) -> Option<ServiceData> {
            task.request().filter(|request| request.uri().path() == "/hello").map(|_| ServiceData::none())
        }

        async fn execute(&self, task: &mut ProgressTask, _data: ServiceData) -> Result<Outcome, HttpError> {
            task.document_mut().push_source(BytesSource::text("hello"));
            Ok(Outcome::Continue)
        }
    }

    /// Holds its request until released, so the test can look at the registry mid-request.
    struct Gated {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Service for Gated {
        fn stage(&self) -> Stage {
            Stage::CreateDocument
        }

        fn can_handle(&self, task: &ProgressTask) -> Option<ServiceData> {
            task.request().filter(|request| request.uri().path() == "/gated").map(|_| ServiceData::none())
        }

        async fn execute(&self, task: &mut ProgressTask, _data: ServiceData) -> Result<Outcome, HttpError> {
            self.entered.notify_one();
            self.release.notified().await;
            task.document_mut().push_source(BytesSource::text("gated"));
            Ok(Outcome::Continue)
        }
    }

    async fn read_until_suffix(client: &mut TcpStream, suffix: &[u8]) -> Vec<u8> {
        let mut response = vec![];
        let mut buf = vec![0u8; 1024];
        while !response.ends_with(suffix) {
            let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf)).await.unwrap().unwrap();
            assert!(read > 0);
            response.extend_from_slice(&buf[..read]);
        }
        response
    }

    fn config() -> ServerConfig {
        ServerConfig::builder()
            .address(SocketAddr::from(([127, 0, 0, 1], 0)))
            .keep_alive_timeout(Duration::from_millis(200))
            .build()
    }

    #[tokio::test]
    async fn idle_keep_alive_is_evicted() {
        let server = Server::builder().config(config()).with_default_services().service(Hello).build();
        let bound = server.bind().await.unwrap();
        let addr = bound.local_addr();
        let shared = Arc::clone(&bound.shared);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(bound.run(shutdown.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /hello HTTP/1.1\r\nHost: test\r\n\r\n").await.unwrap();
        let mut response = vec![];
        let mut buf = vec![0u8; 1024];
        while !response.ends_with(b"hello") {
            let read = client.read(&mut buf).await.unwrap();
            assert!(read > 0);
            response.extend_from_slice(&buf[..read]);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(shared.registry.keep_alive.len(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(shared.registry.keep_alive.is_empty());
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn parked_connection_is_dispatched_again() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let gated = Gated { entered: Arc::clone(&entered), release: Arc::clone(&release) };
        let server = Server::builder().config(config()).with_default_services().service(Hello).service(gated).build();
        let bound = server.bind().await.unwrap();
        let addr = bound.local_addr();
        let shared = Arc::clone(&bound.shared);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(bound.run(shutdown.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /hello HTTP/1.1\r\nHost: test\r\n\r\n").await.unwrap();
        read_until_suffix(&mut client, b"hello").await;

        // several ticks pass while the connection is idle
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(shared.registry.keep_alive.len(), 1);
        assert!(shared.registry.active.is_empty());

        client.write_all(b"GET /gated HTTP/1.1\r\nHost: test\r\n\r\n").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), entered.notified()).await.unwrap();
        assert!(shared.registry.keep_alive.is_empty());
        assert_eq!(shared.registry.active.len(), 1);

        release.notify_one();
        let response = String::from_utf8(read_until_suffix(&mut client, b"gated").await).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("connection: keep-alive\r\n"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(shared.registry.keep_alive.len(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn connection_close_is_not_parked() {
        let server = Server::builder().config(config()).with_default_services().service(Hello).build();
        let bound = server.bind().await.unwrap();
        let addr = bound.local_addr();
        let shared = Arc::clone(&bound.shared);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(bound.run(shutdown.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        let mut response = vec![];
        client.read_to_end(&mut response).await.unwrap();

        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("connection: close\r\n"));
        assert!(shared.registry.keep_alive.is_empty());
        assert!(shared.registry.active.is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }
}
