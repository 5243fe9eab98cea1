//! Connection gateway: WebSocket accept loop and server lifecycle.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/<doc>
//!            ├── gateway ── validate path ──► Session ──► DocumentRegistry
//! Client B ──┘                  │                │              │
//!                               ▼                ▼              ▼
//!                           rejected:       Awareness     ReplicaHandle
//!                           close, no        tracker       (yrs replica)
//!                           handshake                           │
//!                                                   PersistenceCoordinator
//!                                                     ├── CacheTier (LRU, TTL)
//!                                                     └── DurableStore (RocksDB)
//! ```
//!
//! Requests without `Upgrade: websocket` get a plain-text 200 status page,
//! which deployments use as a health check.
//!
//! Shutdown signals every session to close (each flushes and releases its
//! document), waits for them up to a bound, then flushes whatever is still
//! resident.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use crate::config::{ConfigError, RelayConfig};
use crate::document::DocumentId;
use crate::persistence::{PersistenceCoordinator, PersistenceStats};
use crate::registry::DocumentRegistry;
use crate::replica::{merge_updates, ReplicaEngine, YrsReplica};
use crate::session::{Session, SessionConfig};
use crate::storage::{CacheTier, DurableStore, MemoryCache, MemoryStore, RocksStore, StoreConfig, StoreError};

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Connections closed for an invalid document path
    pub rejected_connections: u64,
    /// Plain HTTP requests answered with the status page
    pub status_requests: u64,
    pub frames_received: u64,
    /// Frames that failed to decode or apply
    pub frames_dropped: u64,
    pub resident_documents: usize,
}

#[derive(Debug, Default)]
pub(crate) struct RelayCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    status_requests: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
}

impl RelayCounters {
    fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn status_request(&self) {
        self.status_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// The relay server.
pub struct RelayServer<E = YrsReplica> {
    config: RelayConfig,
    registry: DocumentRegistry<E>,
    coordinator: Arc<PersistenceCoordinator>,
    counters: Arc<RelayCounters>,
}

impl RelayServer<YrsReplica> {
    /// Build the storage tiers described by `config`.
    ///
    /// A cache that fails to initialise is logged and left out; a durable
    /// store that fails to open is an error.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        Self::with_engine(config)
    }
}

impl<E: ReplicaEngine> RelayServer<E> {
    /// Like [`RelayServer::new`] for a custom replica engine.
    pub fn with_engine(config: RelayConfig) -> Result<Self, RelayError> {
        let store: Arc<dyn DurableStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    flush_size: config.flush_size,
                    ..StoreConfig::default()
                };
                Arc::new(RocksStore::open_with_merge(store_config, merge_updates::<E>)?)
            }
            None => Arc::new(MemoryStore::with_merge(merge_updates::<E>)),
        };

        let cache: Option<Arc<dyn CacheTier>> = if config.cache.enabled {
            match MemoryCache::new(config.cache.capacity) {
                Ok(cache) => Some(Arc::new(cache)),
                Err(e) => {
                    log::warn!("Cache unavailable, continuing without it: {e}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self::with_components(config, store, cache))
    }

    /// Assemble from explicit storage tiers.
    pub fn with_components(
        config: RelayConfig,
        store: Arc<dyn DurableStore>,
        cache: Option<Arc<dyn CacheTier>>,
    ) -> Self {
        let coordinator = Arc::new(PersistenceCoordinator::new(
            store,
            cache,
            config.write_back,
            config.cache.ttl,
        ));
        let registry = DocumentRegistry::new(config.eviction_cooldown, config.broadcast_capacity);
        Self {
            config,
            registry,
            coordinator,
            counters: Arc::new(RelayCounters::default()),
        }
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        log::info!("Relay listening on {}", listener.local_addr()?);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            log::debug!("New TCP connection from {addr}");
                            sessions.spawn(handle_connection(
                                stream,
                                addr,
                                self.registry.clone(),
                                self.coordinator.clone(),
                                self.config.session(),
                                self.counters.clone(),
                                stop_rx.clone(),
                            ));
                        }
                        Err(e) => log::warn!("Accept failed: {e}"),
                    }
                }

                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        log::error!("Connection task failed: {e}");
                    }
                }

                _ = &mut shutdown => break,
            }
        }

        log::info!("Shutting down, closing {} connections", sessions.len());
        let _ = stop_tx.send(true);

        let drain = async { while sessions.join_next().await.is_some() {} };
        // Each session's close-time flush is itself bounded by close_flush_timeout
        if tokio::time::timeout(self.config.close_flush_timeout * 2, drain)
            .await
            .is_err()
        {
            log::warn!("Sessions did not close in time, aborting {}", sessions.len());
            sessions.abort_all();
        }

        self.flush_all().await;
        log::info!("Relay stopped");
        Ok(())
    }

    /// Flush every resident document.
    pub async fn flush_all(&self) {
        for handle in self.registry.handles() {
            if let Err(e) = self.coordinator.flush(&handle).await {
                log::error!("Final flush of {} failed: {e}", handle.id());
            }
        }
    }

    pub fn registry(&self) -> &DocumentRegistry<E> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<PersistenceCoordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> RelayStats {
        let c = &self.counters;
        RelayStats {
            total_connections: c.total_connections.load(Ordering::Relaxed),
            active_connections: c.active_connections.load(Ordering::Relaxed),
            rejected_connections: c.rejected_connections.load(Ordering::Relaxed),
            status_requests: c.status_requests.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            frames_dropped: c.frames_dropped.load(Ordering::Relaxed),
            resident_documents: self.registry.len(),
        }
    }

    pub fn persistence_stats(&self) -> PersistenceStats {
        self.coordinator.stats()
    }
}

/// Upgrade one TCP connection, validate its document path and run its session.
async fn handle_connection<E: ReplicaEngine>(
    stream: TcpStream,
    addr: SocketAddr,
    registry: DocumentRegistry<E>,
    coordinator: Arc<PersistenceCoordinator>,
    session_config: SessionConfig,
    counters: Arc<RelayCounters>,
    shutdown: watch::Receiver<bool>,
) {
    match inspect_request(&stream).await {
        Ok(RequestKind::Upgrade) => {}
        Ok(RequestKind::Plain) => {
            counters.status_request();
            log::debug!("Status request from {addr}");
            if let Err(e) = respond_status(stream).await {
                log::debug!("Status response to {addr} failed: {e}");
            }
            return;
        }
        Ok(RequestKind::Disconnected) => return,
        Err(e) => {
            log::warn!("Reading request from {addr} failed: {e}");
            return;
        }
    }

    let mut path = String::new();
    let mut forwarded_for: Option<String> = None;
    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        path = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_default();
        forwarded_for = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(response)
    };

    let mut ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("WebSocket handshake with {addr} failed: {e}");
            return;
        }
    };

    let source = forwarded_for.unwrap_or_else(|| addr.to_string());
    let doc = match DocumentId::from_request_path(&path) {
        Ok(doc) => doc,
        Err(e) => {
            counters.rejected();
            log::info!("Rejected connection from {source} for {path:?}: {e}");
            let _ = ws.close(None).await;
            return;
        }
    };

    log::info!("Connection from {source} to document {doc}");
    counters.connection_opened();

    let (session, handshake) = Session::open(doc, registry, coordinator, session_config).await;
    session.serve(ws, handshake, shutdown, counters.clone()).await;

    counters.connection_closed();
}

/// Largest request head inspected before the upgrade.
const MAX_REQUEST_HEAD: usize = 8 * 1024;
/// How long a client may take to send its request head.
const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_BODY: &str = "Logos relay is running\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Upgrade,
    /// Plain HTTP, e.g. a load balancer health check
    Plain,
    Disconnected,
}

/// Classify the request waiting on `stream` without consuming it; the
/// WebSocket handshake reads the same bytes afterwards.
async fn inspect_request(stream: &TcpStream) -> std::io::Result<RequestKind> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let deadline = Instant::now() + REQUEST_HEAD_TIMEOUT;
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(RequestKind::Disconnected);
        }
        let head = &buf[..n];
        let complete = head.windows(4).any(|w| w == b"\r\n\r\n");
        if complete || n == buf.len() || Instant::now() >= deadline {
            return Ok(if requests_upgrade(head) {
                RequestKind::Upgrade
            } else {
                RequestKind::Plain
            });
        }
        // Head still arriving
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Whether a request head carries `Upgrade: websocket`.
fn requests_upgrade(head: &[u8]) -> bool {
    String::from_utf8_lossy(head).lines().skip(1).any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade") && value.trim().eq_ignore_ascii_case("websocket")
        })
    })
}

async fn respond_status(mut stream: TcpStream) -> std::io::Result<()> {
    // Consume the request so closing does not reset the connection
    let mut request = vec![0u8; MAX_REQUEST_HEAD];
    let _ = stream.read(&mut request).await?;

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{STATUS_BODY}",
        STATUS_BODY.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
