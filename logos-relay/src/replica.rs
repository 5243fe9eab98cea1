//! Replica engine seam.
//!
//! The relay never looks inside document state. Everything it needs from
//! the CRDT (applying updates, encoding state, answering the sync handshake)
//! goes through [`ReplicaEngine`]. [`YrsReplica`] is the production engine,
//! backed by a `yrs::Doc` with v1 update encoding.
//!
//! Any engine whose merge is commutative and idempotent satisfies the
//! contract; the relay relies on that when it resends full state to lagging
//! peers and when stores fold update logs.

use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Options, ReadTxn, StateVector, Transact, Update};

/// Identity of one transport connection (one session).
pub type ConnectionId = Uuid;

/// Callback fired after every successfully applied update.
///
/// Receives the update bytes and the connection it came from (`None` for
/// updates loaded from storage).
pub type UpdateObserver = Box<dyn Fn(&[u8], Option<ConnectionId>) + Send + Sync>;

/// Errors raised by a replica engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Malformed update: {0}")]
    Decode(String),
    #[error("Failed to apply update: {0}")]
    Apply(String),
    #[error("Malformed state vector: {0}")]
    StateVector(String),
}

/// In-memory CRDT replica of one document.
pub trait ReplicaEngine: Sized + Send + 'static {
    /// Empty replica with tombstone garbage collection enabled.
    fn new() -> Self;

    /// Merge an opaque update into this replica.
    fn apply_update(&mut self, update: &[u8], origin: Option<ConnectionId>) -> Result<(), EngineError>;

    /// Full replica state as a single update.
    fn encode_state(&self) -> Vec<u8>;

    /// State vector announcing what this replica already has.
    fn encode_sync_step1(&self) -> Vec<u8>;

    /// Everything the peer with `remote_state_vector` is missing.
    fn encode_sync_step2(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, EngineError>;

    /// Register a callback for applied updates.
    fn on_update(&mut self, observer: UpdateObserver);
}

/// Fold a sequence of updates into one state blob through a fresh replica.
pub fn merge_updates<E: ReplicaEngine>(updates: &[Vec<u8>]) -> Result<Vec<u8>, EngineError> {
    let mut replica = E::new();
    for update in updates {
        replica.apply_update(update, None)?;
    }
    Ok(replica.encode_state())
}

/// `yrs`-backed replica engine.
pub struct YrsReplica {
    doc: Doc,
    observers: Vec<UpdateObserver>,
}

impl YrsReplica {
    /// Underlying document, for reading content.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl ReplicaEngine for YrsReplica {
    fn new() -> Self {
        let options = Options {
            skip_gc: false,
            ..Options::default()
        };
        Self {
            doc: Doc::with_options(options),
            observers: Vec::new(),
        }
    }

    fn apply_update(&mut self, update: &[u8], origin: Option<ConnectionId>) -> Result<(), EngineError> {
        let decoded = Update::decode_v1(update).map_err(|e| EngineError::Decode(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| EngineError::Apply(e.to_string()))?;
        }
        for observer in &self.observers {
            observer(update, origin);
        }
        Ok(())
    }

    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn encode_sync_step1(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn encode_sync_step2(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, EngineError> {
        let remote = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| EngineError::StateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    fn on_update(&mut self, observer: UpdateObserver) {
        self.observers.push(observer);
    }
}


#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::test_support::{append_text, text_of};
    use super::*;

    #[test]
    fn test_apply_and_encode_state() {
        let source = Doc::new();
        let update = append_text(&source, "hello");

        let mut replica = YrsReplica::new();
        replica.apply_update(&update, None).unwrap();
        assert_eq!(text_of(&replica), "hello");

        let mut copy = YrsReplica::new();
        copy.apply_update(&replica.encode_state(), None).unwrap();
        assert_eq!(text_of(&copy), "hello");
    }

    #[test]
    fn test_malformed_update_rejected() {
        let mut replica = YrsReplica::new();
        let err = replica.apply_update(&[0xFF, 0xFF, 0xFF], None).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_) | EngineError::Apply(_)));
        assert_eq!(text_of(&replica), "");
    }

    #[test]
    fn test_sync_step2_contains_only_missing_state() {
        let source = Doc::new();
        let first = append_text(&source, "a");
        let second = append_text(&source, "b");

        let mut server = YrsReplica::new();
        server.apply_update(&first, None).unwrap();
        server.apply_update(&second, None).unwrap();

        let mut peer = YrsReplica::new();
        peer.apply_update(&first, None).unwrap();

        let diff = server.encode_sync_step2(&peer.encode_sync_step1()).unwrap();
        peer.apply_update(&diff, None).unwrap();
        assert_eq!(text_of(&peer), "ab");
    }

    #[test]
    fn test_bad_state_vector() {
        let replica = YrsReplica::new();
        assert!(replica.encode_sync_step2(&[0xFF]).is_err());
    }

    #[test]
    fn test_observers_see_origin() {
        let seen: Arc<Mutex<Vec<Option<ConnectionId>>>> = Arc::default();
        let sink = seen.clone();

        let mut replica = YrsReplica::new();
        replica.on_update(Box::new(move |_, origin| sink.lock().unwrap().push(origin)));

        let conn = Uuid::new_v4();
        let source = Doc::new();
        replica.apply_update(&append_text(&source, "x"), Some(conn)).unwrap();
        replica.apply_update(&append_text(&source, "y"), None).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![Some(conn), None]);
    }

    #[test]
    fn test_merge_updates_is_order_independent() {
        let alice = Doc::new();
        let bob = Doc::new();
        let a = append_text(&alice, "alice ");
        let b = append_text(&bob, "bob ");
        let a2 = append_text(&alice, "again");

        let forward = merge_updates::<YrsReplica>(&[a.clone(), b.clone(), a2.clone()]).unwrap();
        let backward = merge_updates::<YrsReplica>(&[a2, b, a.clone(), a]).unwrap();

        let mut x = YrsReplica::new();
        x.apply_update(&forward, None).unwrap();
        let mut y = YrsReplica::new();
        y.apply_update(&backward, None).unwrap();
        assert_eq!(text_of(&x), text_of(&y));
        assert!(text_of(&x).contains("bob"));
        assert!(text_of(&x).contains("again"));
    }
}
