//! Ephemeral presence for the sessions of one document.
//!
//! ## Architecture
//!
//! ```text
//! Session A ── awareness frame ──► AwarenessTracker::apply()
//!                                        │  (clock check, owner = A)
//!                                        ▼
//!                                  BroadcastGroup ──► Session B, C …
//!
//! Session A closes ──► AwarenessTracker::remove_connection(A)
//!                                        │  (clock + 1, state = null)
//!                                        ▼
//!                                  BroadcastGroup ──► Session B, C …
//! ```
//!
//! Presence is never cached or persisted. Each client id is owned by the
//! connection that last announced it, and disappears with that connection.
//!
//! Update wire format (y-protocols awareness):
//! ```text
//! varuint count, then per entry: varuint client_id │ varuint clock │ varString json
//! ```
//! The JSON literal `null` marks a removed state.

use std::collections::HashMap;

use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::replica::ConnectionId;

/// Client identifier chosen by the remote replica.
pub type ClientId = u64;

const NULL_STATE: &str = "null";

/// Awareness decode errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AwarenessError {
    #[error("Malformed awareness update: {0}")]
    Decode(String),
}

// ───────────────────────────────────────────────────────────────────
// Wire codec
// ───────────────────────────────────────────────────────────────────

/// One client's entry inside an awareness update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub clock: u32,
    /// JSON-encoded state; `null` for a removal.
    pub state: String,
}

impl AwarenessEntry {
    pub fn is_removal(&self) -> bool {
        self.state == NULL_STATE
    }
}

/// A batch of awareness entries as carried by an awareness frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_var(self.entries.len() as u32);
        for entry in &self.entries {
            buf.write_var(entry.client_id);
            buf.write_var(entry.clock);
            buf.write_string(&entry.state);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AwarenessError> {
        let err = |e: yrs::encoding::read::Error| AwarenessError::Decode(e.to_string());
        let mut cursor = Cursor::new(bytes);
        let count: u32 = cursor.read_var().map_err(err)?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let client_id: ClientId = cursor.read_var().map_err(err)?;
            let clock: u32 = cursor.read_var().map_err(err)?;
            let state = cursor.read_string().map_err(err)?.to_string();
            entries.push(AwarenessEntry { client_id, clock, state });
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// What an applied update changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct ClientPresence {
    clock: u32,
    /// `None` once removed; the clock is kept so stale entries stay rejected.
    state: Option<String>,
    owner: ConnectionId,
}

/// Per-document presence map keyed by client id.
#[derive(Debug, Default)]
pub struct AwarenessTracker {
    clients: HashMap<ClientId, ClientPresence>,
}

impl AwarenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a decoded update submitted by `owner`.
    ///
    /// An entry wins when its clock is newer, or when it removes a present
    /// state at the same clock.
    pub fn apply(&mut self, update: &AwarenessUpdate, owner: ConnectionId) -> AwarenessChange {
        let mut change = AwarenessChange::default();

        for entry in &update.entries {
            let current = self.clients.get(&entry.client_id);
            let accepted = match current {
                None => true,
                Some(cur) => {
                    cur.clock < entry.clock
                        || (cur.clock == entry.clock && entry.is_removal() && cur.state.is_some())
                }
            };
            if !accepted {
                continue;
            }

            let had_state = current.is_some_and(|cur| cur.state.is_some());
            let new_state = (!entry.is_removal()).then(|| entry.state.clone());
            match (had_state, &new_state) {
                (true, None) => change.removed.push(entry.client_id),
                (false, Some(_)) => change.added.push(entry.client_id),
                (true, Some(_)) => change.updated.push(entry.client_id),
                (false, None) => {}
            }

            self.clients.insert(
                entry.client_id,
                ClientPresence {
                    clock: entry.clock,
                    state: new_state,
                    owner,
                },
            );
        }

        change
    }

    /// Decode and apply a raw awareness payload.
    pub fn apply_encoded(
        &mut self,
        payload: &[u8],
        owner: ConnectionId,
    ) -> Result<AwarenessChange, AwarenessError> {
        let update = AwarenessUpdate::decode(payload)?;
        Ok(self.apply(&update, owner))
    }

    /// Forget every client owned by `owner`.
    ///
    /// Returns the removal update for clients that still had state, to be
    /// broadcast to the remaining sessions.
    pub fn remove_connection(&mut self, owner: ConnectionId) -> Option<AwarenessUpdate> {
        let owned: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, presence)| presence.owner == owner)
            .map(|(id, _)| *id)
            .collect();

        let mut entries = Vec::new();
        for client_id in owned {
            if let Some(presence) = self.clients.remove(&client_id) {
                if presence.state.is_some() {
                    entries.push(AwarenessEntry {
                        client_id,
                        clock: presence.clock.wrapping_add(1),
                        state: NULL_STATE.to_string(),
                    });
                }
            }
        }
        entries.sort_by_key(|e| e.client_id);

        (!entries.is_empty()).then_some(AwarenessUpdate { entries })
    }

    /// All present states, for bringing a new session up to date.
    pub fn encode_states(&self) -> Option<AwarenessUpdate> {
        let mut entries: Vec<AwarenessEntry> = self
            .clients
            .iter()
            .filter_map(|(id, presence)| {
                presence.state.as_ref().map(|state| AwarenessEntry {
                    client_id: *id,
                    clock: presence.clock,
                    state: state.clone(),
                })
            })
            .collect();
        entries.sort_by_key(|e| e.client_id);

        (!entries.is_empty()).then_some(AwarenessUpdate { entries })
    }

    /// JSON state of one client, if present.
    pub fn state(&self, client_id: ClientId) -> Option<&str> {
        self.clients.get(&client_id)?.state.as_deref()
    }

    /// Number of clients with a present state.
    pub fn len(&self) -> usize {
        self.clients.values().filter(|p| p.state.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ===================================================================
// Tests
// ===================================================================
