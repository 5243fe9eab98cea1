//! # logos-relay: Real-time document sync relay
//!
//! Hosts one authoritative CRDT replica per collaborative document, relays
//! sync and awareness frames between the WebSocket peers of that document,
//! and writes document state back to a two-tier store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ws://host/<doc>   ┌──────────────────────────────┐
//! │ Peer        │ ◄──────────────────► │ RelayServer (gateway)        │
//! │ (y-protocol)│   binary frames      │   └── Session per connection │
//! └─────────────┘                      └──────────────┬───────────────┘
//!                                                     │
//!                       ┌─────────────────────────────┼──────────────────┐
//!                       ▼                             ▼                  ▼
//!               ┌───────────────┐           ┌──────────────────┐  ┌────────────┐
//!               │DocumentRegistry│          │PersistenceCoord. │  │ Awareness  │
//!               │ (ref-counted) │           │ debounce + load  │  │ (per doc)  │
//!               └───────┬───────┘           └────────┬─────────┘  └────────────┘
//!                       ▼                   ┌────────┴────────┐
//!               ┌───────────────┐           ▼                 ▼
//!               │ ReplicaHandle │     CacheTier (LRU)   DurableStore (RocksDB)
//!               │ yrs + fan-out │
//!               └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`]: Document identifiers from request paths
//! - [`replica`]: Replica engine seam and the yrs engine
//! - [`protocol`]: Sync / awareness frame codec
//! - [`awareness`]: Ephemeral presence tracking
//! - [`broadcast`]: Per-document fan-out
//! - [`registry`]: Ref-counted replica handles with cooldown eviction
//! - [`persistence`]: Debounced write-back and read-through load
//! - [`storage`]: Durable store and cache tiers
//! - [`session`]: Per-connection state machine
//! - [`server`]: Connection gateway and lifecycle
//! - [`config`]: Environment configuration

pub mod awareness;
pub mod broadcast;
pub mod config;
pub mod document;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod replica;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use awareness::{AwarenessChange, AwarenessEntry, AwarenessError, AwarenessTracker, AwarenessUpdate, ClientId};
pub use broadcast::{BroadcastGroup, BroadcastStats, RelayFrame};
pub use config::{CacheConfig, ConfigError, RelayConfig};
pub use document::{DocumentId, InvalidDocumentId};
pub use persistence::{LoadSource, PersistenceCoordinator, PersistenceError, PersistenceStats, WriteBackPolicy};
pub use protocol::{Frame, MessageType, ProtocolError, SyncMessage};
pub use registry::{DocumentRegistry, ReplicaHandle};
pub use replica::{merge_updates, ConnectionId, EngineError, ReplicaEngine, YrsReplica};
pub use server::{RelayError, RelayServer, RelayStats};
pub use session::{Handshake, Session, SessionConfig, SessionState};
pub use storage::{
    CacheError, CacheTier, DocumentMetadata, DurableStore, MemoryCache, MemoryStore, RocksStore,
    StoreConfig, StoreError,
};
