//! Replica session: one connection bound to one document.
//!
//! ```text
//! CONNECTING ──load──► SYNCING ──first sync frame──► ACTIVE ──► CLOSED
//!      │                  │                                      ▲
//!      └──────────────────┴──────── transport closed ────────────┘
//! ```
//!
//! Frames from the connection are handled strictly in arrival order. Every
//! applied update schedules a write-back; the update itself reaches other
//! sessions through the replica's update observer. Closing flushes pending
//! state (bounded by `close_flush_timeout`), withdraws this connection's
//! presence and releases the document.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::RelayReceiver;
use crate::document::DocumentId;
use crate::persistence::PersistenceCoordinator;
use crate::protocol::{Frame, ProtocolError, SyncMessage};
use crate::registry::{DocumentRegistry, ReplicaHandle};
use crate::replica::{ConnectionId, ReplicaEngine, YrsReplica};
use crate::server::RelayCounters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Syncing,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Upper bound on the flush performed while closing
    pub close_flush_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            close_flush_timeout: Duration::from_secs(5),
        }
    }
}

/// What a new session sends first, plus its subscription to relayed frames.
pub struct Handshake {
    /// Sync step 1, then current awareness states if any
    pub frames: Vec<Vec<u8>>,
    pub relay: RelayReceiver,
}

pub struct Session<E = YrsReplica> {
    id: ConnectionId,
    state: SessionState,
    handle: Arc<ReplicaHandle<E>>,
    registry: DocumentRegistry<E>,
    coordinator: Arc<PersistenceCoordinator>,
    config: SessionConfig,
}

impl<E: ReplicaEngine> Session<E> {
    /// Join `doc`: take a registry reference, make sure the replica is
    /// loaded and build the handshake.
    ///
    /// A failed load is logged; the session continues on the in-memory
    /// replica and the next session retries the load.
    pub async fn open(
        doc: DocumentId,
        registry: DocumentRegistry<E>,
        coordinator: Arc<PersistenceCoordinator>,
        config: SessionConfig,
    ) -> (Self, Handshake) {
        let mut session = Self {
            id: Uuid::new_v4(),
            state: SessionState::Connecting,
            handle: registry.acquire(&doc),
            registry,
            coordinator,
            config,
        };

        if let Err(e) = session.handle.ensure_loaded(&session.coordinator).await {
            log::error!("Failed to load document {doc}: {e}");
        }

        // Subscribe after loading so the load itself is not relayed back
        let relay = session.handle.broadcast().subscribe();

        let state_vector = session.handle.replica().lock().await.encode_sync_step1();
        let mut frames = vec![Frame::sync_step1(state_vector).encode()];
        if let Some(states) = session.handle.awareness().lock().await.encode_states() {
            frames.push(Frame::Awareness(states.encode()).encode());
        }

        session.state = SessionState::Syncing;
        log::debug!("Session {} syncing document {doc}", session.id);
        (session, Handshake { frames, relay })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn document(&self) -> &DocumentId {
        self.handle.id()
    }

    pub fn handle(&self) -> &Arc<ReplicaHandle<E>> {
        &self.handle
    }

    /// Handle one inbound frame. Returns the reply to send back, if any.
    ///
    /// Errors leave the session open; the caller logs and drops the frame.
    pub async fn handle_frame(&mut self, bytes: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.state == SessionState::Closed {
            return Err(ProtocolError::SessionClosed);
        }

        match Frame::decode(bytes)? {
            Frame::Sync(message) => {
                let reply = self.handle_sync(message).await?;
                if self.state == SessionState::Syncing {
                    self.state = SessionState::Active;
                    log::debug!("Session {} active on {}", self.id, self.document());
                }
                Ok(reply)
            }
            Frame::Awareness(payload) => {
                let change = self
                    .handle
                    .awareness()
                    .lock()
                    .await
                    .apply_encoded(&payload, self.id)?;
                if !change.is_empty() {
                    self.handle.broadcast().send(Some(self.id), bytes.to_vec());
                }
                Ok(None)
            }
        }
    }

    async fn handle_sync(&mut self, message: SyncMessage) -> Result<Option<Vec<u8>>, ProtocolError> {
        match message {
            SyncMessage::Step1(state_vector) => {
                let diff = self
                    .handle
                    .replica()
                    .lock()
                    .await
                    .encode_sync_step2(&state_vector)?;
                Ok(Some(Frame::sync_step2(diff).encode()))
            }
            SyncMessage::Step2(update) | SyncMessage::Update(update) => {
                self.handle
                    .replica()
                    .lock()
                    .await
                    .apply_update(&update, Some(self.id))?;
                // Persist regardless of origin
                self.coordinator.schedule(&self.handle).await;
                log::trace!(
                    "Session {} applied {} byte update to {}",
                    self.id,
                    update.len(),
                    self.document()
                );
                Ok(None)
            }
        }
    }

    /// Flush, withdraw presence, release the document. Idempotent.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let doc = self.handle.id().clone();

        // The flush keeps running past the timeout; eviction waits for it
        let coordinator = self.coordinator.clone();
        let handle = self.handle.clone();
        let flush = tokio::spawn(async move { coordinator.flush(&handle).await });
        match tokio::time::timeout(self.config.close_flush_timeout, flush).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(e))) => log::warn!("Closing session {} without persisting {doc}: {e}", self.id),
            Ok(Err(e)) => log::error!("Flush task for {doc} failed: {e}"),
            Err(_) => log::warn!(
                "Flush of {doc} exceeded {:?} while closing session {}",
                self.config.close_flush_timeout,
                self.id
            ),
        }

        let removal = self.handle.awareness().lock().await.remove_connection(self.id);
        if let Some(removal) = removal {
            self.handle
                .broadcast()
                .send(Some(self.id), Frame::Awareness(removal.encode()).encode());
        }

        self.state = SessionState::Closed;
        self.registry.release(&doc);
        log::debug!("Session {} closed on {doc}", self.id);
    }

    /// Drive the session over a WebSocket until either side closes or
    /// `shutdown` fires, then close it.
    pub(crate) async fn serve<S>(
        mut self,
        ws: WebSocketStream<S>,
        handshake: Handshake,
        mut shutdown: watch::Receiver<bool>,
        counters: Arc<RelayCounters>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();
        let Handshake { frames, mut relay } = handshake;
        let conn = self.id;

        for frame in frames {
            if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                log::error!("Handshake to {conn} failed: {e}");
                self.close().await;
                return;
            }
        }

        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            counters.frame_received();
                            match self.handle_frame(&data).await {
                                Ok(Some(reply)) => {
                                    if let Err(e) = sink.send(Message::Binary(reply.into())).await {
                                        log::error!("Send to {conn} failed: {e}");
                                        break;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    counters.frame_dropped();
                                    log::warn!("Dropping frame from {conn} on {}: {e}", self.document());
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if sink.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {conn} closed");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("Transport error on {conn}: {e}");
                            break;
                        }

                        Some(Ok(_)) => {}
                    }
                }

                relayed = relay.recv() => {
                    match relayed {
                        Ok(frame) => {
                            if !frame.is_for(conn) {
                                continue;
                            }
                            if let Err(e) = sink.send(Message::Binary(frame.bytes.clone().into())).await {
                                log::error!("Relay to {conn} failed: {e}");
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!("Session {conn} lagged by {skipped} frames, resending full state");
                            let state = self.handle.replica().lock().await.encode_state();
                            if sink.send(Message::Binary(Frame::update(state).encode().into())).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = shutdown.changed() => {
                    log::debug!("Shutting down session {conn}");
                    break;
                }
            }
        }

        self.close().await;
        let _ = sink.send(Message::Close(None)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::{AwarenessEntry, AwarenessUpdate};
    use crate::persistence::WriteBackPolicy;
    use crate::replica::test_support::{append_text, text_of};
    use crate::storage::{CacheTier, DurableStore, MemoryCache, MemoryStore, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_tungstenite::tungstenite::protocol::Role;
    use yrs::Doc;

    const TTL: Duration = Duration::from_secs(3600);

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: Arc<MemoryCache>,
        registry: DocumentRegistry,
        coordinator: Arc<PersistenceCoordinator>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new(16).unwrap());
        let coordinator = Arc::new(PersistenceCoordinator::new(
            store.clone(),
            Some(cache.clone()),
            WriteBackPolicy::default(),
            TTL,
        ));
        Fixture {
            store,
            cache,
            registry: DocumentRegistry::new(Duration::from_secs(30), 64),
            coordinator,
        }
    }

    impl Fixture {
        async fn open(&self, name: &str) -> (Session, Handshake) {
            Session::open(
                DocumentId::new(name).unwrap(),
                self.registry.clone(),
                self.coordinator.clone(),
                SessionConfig::default(),
            )
            .await
        }
    }

    fn awareness_frame(client_id: u64, clock: u32, state: &str) -> Vec<u8> {
        let update = AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id,
                clock,
                state: state.to_string(),
            }],
        };
        Frame::Awareness(update.encode()).encode()
    }

    #[tokio::test]
    async fn test_handshake_starts_with_sync_step1() {
        let f = fixture();
        let (session, handshake) = f.open("doc1").await;

        assert_eq!(session.state(), SessionState::Syncing);
        assert_eq!(handshake.frames.len(), 1);
        assert!(matches!(
            Frame::decode(&handshake.frames[0]).unwrap(),
            Frame::Sync(SyncMessage::Step1(_))
        ));
        assert_eq!(f.registry.session_count(session.document()), 1);
    }

    #[tokio::test]
    async fn test_step1_answered_with_missing_state() {
        let f = fixture();
        let (mut a, _) = f.open("doc1").await;
        a.handle_frame(&Frame::update(append_text(&Doc::new(), "hello")).encode())
            .await
            .unwrap();
        assert_eq!(a.state(), SessionState::Active);

        let (mut b, _) = f.open("doc1").await;
        let mut peer = YrsReplica::new();
        let reply = b
            .handle_frame(&Frame::sync_step1(peer.encode_sync_step1()).encode())
            .await
            .unwrap()
            .expect("step1 gets a reply");

        let Frame::Sync(SyncMessage::Step2(diff)) = Frame::decode(&reply).unwrap() else {
            panic!("expected step2");
        };
        peer.apply_update(&diff, None).unwrap();
        assert_eq!(text_of(&peer), "hello");
    }

    #[tokio::test]
    async fn test_updates_relayed_to_other_sessions_only() {
        let f = fixture();
        let (mut a, mut ha) = f.open("doc1").await;
        let (b, mut hb) = f.open("doc1").await;

        let update = append_text(&Doc::new(), "x");
        a.handle_frame(&Frame::update(update.clone()).encode()).await.unwrap();

        let relayed = hb.relay.recv().await.unwrap();
        assert!(relayed.is_for(b.id()));
        assert_eq!(Frame::decode(&relayed.bytes).unwrap(), Frame::update(update));

        // A sees its own frame on the channel but must skip it
        let own = ha.relay.recv().await.unwrap();
        assert!(!own.is_for(a.id()));
    }

    #[tokio::test]
    async fn test_bad_frames_are_dropped_session_stays_open() {
        let f = fixture();
        let (mut session, _) = f.open("doc1").await;

        assert_eq!(
            session.handle_frame(&[5, 0]).await,
            Err(ProtocolError::UnknownMessageType(5))
        );
        assert!(matches!(
            session.handle_frame(&Frame::update(vec![0xFF, 0xFF]).encode()).await,
            Err(ProtocolError::Engine(_))
        ));
        assert_eq!(session.state(), SessionState::Syncing);

        let ok = session
            .handle_frame(&Frame::update(append_text(&Doc::new(), "still here")).encode())
            .await;
        assert!(ok.is_ok());
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_update_persisted_once_within_wait() {
        let f = fixture();
        let (mut session, _) = f.open("doc1").await;
        session
            .handle_frame(&Frame::update(append_text(&Doc::new(), "persist me")).encode())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2001)).await;
        let id = session.document().clone();
        assert_eq!(f.store.write_count(&id).await, 1);

        let stored = f.store.get_document_state(&id).await.unwrap();
        assert_eq!(f.cache.get(&id.cache_key()).await.unwrap(), Some(stored.clone()));

        let mut reloaded = YrsReplica::new();
        reloaded.apply_update(&stored, None).unwrap();
        assert_eq!(text_of(&reloaded), "persist me");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.store.write_count(&id).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_before_returning() {
        let f = fixture();
        let (mut session, _) = f.open("doc1").await;
        session
            .handle_frame(&Frame::update(append_text(&Doc::new(), "x")).encode())
            .await
            .unwrap();

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(f.store.write_count(session.document()).await, 1);
        assert_eq!(f.registry.session_count(session.document()), 0);

        // Idempotent, and a closed session refuses frames
        session.close().await;
        assert_eq!(
            session.handle_frame(&Frame::update(vec![0, 0]).encode()).await,
            Err(ProtocolError::SessionClosed)
        );
    }

    #[tokio::test]
    async fn test_awareness_relayed_and_withdrawn_on_close() {
        let f = fixture();
        let (mut a, _) = f.open("doc1").await;
        let (b, mut hb) = f.open("doc1").await;

        let frame = awareness_frame(7, 1, r#"{"user":"a"}"#);
        a.handle_frame(&frame).await.unwrap();
        let relayed = hb.relay.recv().await.unwrap();
        assert_eq!(relayed.bytes, frame);

        // A stale repeat changes nothing and is not relayed
        a.handle_frame(&frame).await.unwrap();

        a.close().await;
        let removal = hb.relay.recv().await.unwrap();
        let Frame::Awareness(payload) = Frame::decode(&removal.bytes).unwrap() else {
            panic!("expected awareness frame");
        };
        let update = AwarenessUpdate::decode(&payload).unwrap();
        assert_eq!(update.entries.len(), 1);
        assert_eq!(update.entries[0].client_id, 7);
        assert_eq!(update.entries[0].clock, 2);
        assert!(update.entries[0].is_removal());

        assert!(b.handle().awareness().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_new_session_receives_present_awareness() {
        let f = fixture();
        let (mut a, _) = f.open("doc1").await;
        a.handle_frame(&awareness_frame(3, 0, "{}")).await.unwrap();

        let (_b, hb) = f.open("doc1").await;
        assert_eq!(hb.frames.len(), 2);
        assert_eq!(hb.frames[1], awareness_frame(3, 0, "{}"));
    }

    #[tokio::test]
    async fn test_reload_from_store_after_eviction() {
        let f = fixture();
        let id = DocumentId::new("doc1").unwrap();
        f.store
            .store_update(&id, &append_text(&Doc::new(), "from disk"))
            .await
            .unwrap();

        let (session, _) = f.open("doc1").await;
        assert_eq!(
            session.handle().load_source(),
            Some(crate::persistence::LoadSource::Store)
        );
        assert_eq!(text_of(&*session.handle().replica().lock().await), "from disk");
    }

    /// Store whose writes take a minute to complete.
    #[derive(Default)]
    struct SlowStore {
        completed: AtomicUsize,
    }

    #[async_trait]
    impl DurableStore for SlowStore {
        async fn store_update(&self, _doc: &DocumentId, _update: &[u8]) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn get_document_state(&self, _doc: &DocumentId) -> Result<Vec<u8>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_gives_up_on_slow_flush_after_timeout() {
        let store = Arc::new(SlowStore::default());
        let coordinator = Arc::new(PersistenceCoordinator::new(
            store.clone(),
            None,
            WriteBackPolicy::default(),
            TTL,
        ));
        let registry: DocumentRegistry = DocumentRegistry::new(Duration::from_secs(30), 64);
        let config = SessionConfig {
            close_flush_timeout: Duration::from_secs(5),
        };
        let (mut session, _) = Session::open(
            DocumentId::new("doc1").unwrap(),
            registry.clone(),
            coordinator,
            config,
        )
        .await;
        session
            .handle_frame(&Frame::update(append_text(&Doc::new(), "slow")).encode())
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        session.close().await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(60), "{waited:?}");
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(registry.session_count(session.document()), 0);
        assert_eq!(store.completed.load(Ordering::SeqCst), 0);

        // The flush itself keeps running and finishes later
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.completed.load(Ordering::SeqCst), 1);
    }

    async fn next_frame(client: &mut WebSocketStream<tokio::io::DuplexStream>) -> Frame {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("frame within timeout")
                .expect("stream open")
                .expect("no transport error");
            if let Message::Binary(data) = msg {
                return Frame::decode(&data).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_lagging_session_resent_full_state() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(PersistenceCoordinator::new(
            store,
            None,
            WriteBackPolicy::default(),
            TTL,
        ));
        let registry: DocumentRegistry = DocumentRegistry::new(Duration::from_secs(30), 1);
        let (session, handshake) = Session::open(
            DocumentId::new("doc1").unwrap(),
            registry,
            coordinator,
            SessionConfig::default(),
        )
        .await;

        // Three updates overflow the single-slot relay before the session reads
        let source = Doc::new();
        for word in ["a", "b", "c"] {
            session
                .handle()
                .replica()
                .lock()
                .await
                .apply_update(&append_text(&source, word), None)
                .unwrap();
        }

        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let (_stop_tx, stop_rx) = watch::channel(false);
        let serving = tokio::spawn(session.serve(
            server_ws,
            handshake,
            stop_rx,
            Arc::new(RelayCounters::default()),
        ));

        assert!(matches!(next_frame(&mut client).await, Frame::Sync(SyncMessage::Step1(_))));
        let Frame::Sync(SyncMessage::Update(state)) = next_frame(&mut client).await else {
            panic!("expected full-state update after lag");
        };
        let mut peer = YrsReplica::new();
        peer.apply_update(&state, None).unwrap();
        assert_eq!(text_of(&peer), "abc");

        serving.abort();
    }
}
