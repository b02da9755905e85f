//! Pending-request tables.
//!
//! Whenever the conductor sends a request to a peer on behalf of someone
//! else, it allocates a fresh local id on that peer's table and remembers
//! where the request came from. When the peer answers, the entry is taken
//! out of the table (exactly once) and the response is routed back to the
//! origin under the origin's own id.

use std::fmt;
use std::time::Instant;

use fxhash::FxHashMap;
use uuid::Uuid;

use crate::history::HistoryEntry;
use crate::jsonrpc::{Id, Message};

/// Identifies one end of a link the conductor talks to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Peer {
    Editor,
    /// A chain component; the agent is the last index.
    Component(usize),
    /// An MCP bridge connection, by connection id.
    Bridge(Uuid),
    /// Requests synthesized by the conductor itself.
    Conductor,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Editor => write!(f, "editor"),
            Peer::Component(index) => write!(f, "component({index})"),
            Peer::Bridge(token) => write!(f, "bridge({token})"),
            Peer::Conductor => write!(f, "conductor"),
        }
    }
}

/// What to do with the response once it arrives.
#[derive(Debug, Clone)]
pub enum ResponseAction {
    /// Send it back to the origin unchanged.
    Relay,
    /// An `initialize` response from the given component.
    Negotiate { component_index: usize },
    /// A `session/new` response from the agent.
    SessionCreated {
        /// Bridge registrations created while rewriting this request.
        bridges: Vec<Uuid>,
        /// History to replay before the session is handed out.
        priming: Option<Vec<HistoryEntry>>,
    },
    /// The synthetic history prompt; the response is discarded and the held
    /// `session/new` response is released to `release_to`.
    Priming {
        release_to: Peer,
        held: Box<Message>,
        session_id: String,
    },
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub local_id: i64,
    pub origin: Peer,
    pub origin_id: Id,
    pub method: String,
    pub session_id: Option<String>,
    pub created_at: Instant,
    pub action: ResponseAction,
}

impl PendingEntry {
    /// Id of the editor request this entry stands for, if any.
    pub fn editor_request_id(&self) -> Option<&Id> {
        match (&self.origin, &self.action) {
            (Peer::Editor, _) => Some(&self.origin_id),
            (
                _,
                ResponseAction::Priming {
                    release_to: Peer::Editor,
                    held,
                    ..
                },
            ) => held.id.as_ref(),
            _ => None,
        }
    }
}

/// Per-peer map from locally generated ids to their origin.
///
/// Ids are drawn from a monotonic counter. If the counter ever wraps, ids
/// that are still live are skipped, so an id is never handed out twice
/// while an entry references it.
#[derive(Debug)]
pub struct PendingTable {
    peer: Peer,
    next_id: i64,
    entries: FxHashMap<i64, PendingEntry>,
}

impl PendingTable {
    pub fn new(peer: Peer) -> Self {
        PendingTable {
            peer,
            next_id: 1,
            entries: FxHashMap::default(),
        }
    }

    fn allocate(&mut self) -> i64 {
        loop {
            let id = self.next_id;
            self.next_id = if self.next_id == i64::MAX {
                1
            } else {
                self.next_id + 1
            };
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Record a request about to be sent to this table's peer and return the
    /// id it must carry on the wire.
    pub fn insert(
        &mut self,
        origin: Peer,
        origin_id: Id,
        method: impl Into<String>,
        session_id: Option<String>,
        action: ResponseAction,
    ) -> Id {
        let local_id = self.allocate();
        let method = method.into();
        tracing::trace!(peer = %self.peer, local_id, %origin, %origin_id, %method, "pending request");
        self.entries.insert(
            local_id,
            PendingEntry {
                local_id,
                origin,
                origin_id,
                method,
                session_id,
                created_at: Instant::now(),
                action,
            },
        );
        Id::Number(local_id)
    }

    /// Resolve a response id. Unknown ids (duplicates, late responses,
    /// string ids we never issued) return `None` and leave the table
    /// untouched.
    pub fn take(&mut self, id: &Id) -> Option<PendingEntry> {
        match id {
            Id::Number(local_id) => self.entries.remove(local_id),
            Id::String(_) | Id::Null => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.entries
            .values()
            .any(|entry| entry.session_id.as_deref() == Some(session_id))
    }

    pub fn entries(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.values()
    }

    /// Remove and return every entry whose origin matches `origin`.
    pub fn drain_origin(&mut self, origin: &Peer) -> Vec<PendingEntry> {
        let ids: Vec<i64> = self
            .entries
            .iter()
            .filter(|(_, entry)| &entry.origin == origin)
            .map(|(id, _)| *id)
            .collect();
        let mut drained: Vec<PendingEntry> = ids
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect();
        drained.sort_by_key(|entry| entry.local_id);
        drained
    }

    /// Remove every entry.
    pub fn drain(&mut self) -> Vec<PendingEntry> {
        let mut drained: Vec<PendingEntry> = self.entries.drain().map(|(_, entry)| entry).collect();
        drained.sort_by_key(|entry| entry.local_id);
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PendingTable {
        PendingTable::new(Peer::Component(1))
    }

    #[test]
    fn test_each_id_resolves_exactly_once() {
        let mut table = table();
        let a = table.insert(Peer::Editor, Id::Number(1), "ping", None, ResponseAction::Relay);
        let b = table.insert(Peer::Component(0), Id::from("x"), "ping", None, ResponseAction::Relay);
        assert_ne!(a, b);

        let entry = table.take(&a).unwrap();
        assert_eq!(entry.origin, Peer::Editor);
        assert_eq!(entry.origin_id, Id::Number(1));
        assert!(table.take(&a).is_none());

        let entry = table.take(&b).unwrap();
        assert_eq!(entry.origin_id, Id::from("x"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_unknown_id_leaves_other_entries_alone() {
        let mut table = table();
        let a = table.insert(Peer::Editor, Id::Number(1), "ping", None, ResponseAction::Relay);
        assert!(table.take(&Id::Number(9999)).is_none());
        assert!(table.take(&Id::from("1")).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.take(&a).is_some());
    }

    #[test]
    fn test_wrapped_counter_skips_live_ids() {
        let mut table = table();
        let live = table.insert(Peer::Editor, Id::Number(1), "ping", None, ResponseAction::Relay);
        assert_eq!(live, Id::Number(1));

        table.next_id = i64::MAX;
        let last = table.insert(Peer::Editor, Id::Number(2), "ping", None, ResponseAction::Relay);
        assert_eq!(last, Id::Number(i64::MAX));

        // Counter wrapped to 1, which is still live.
        let next = table.insert(Peer::Editor, Id::Number(3), "ping", None, ResponseAction::Relay);
        assert_eq!(next, Id::Number(2));
    }

    #[test]
    fn test_session_scoping_and_drain() {
        let mut table = table();
        table.insert(
            Peer::Editor,
            Id::Number(1),
            "session/prompt",
            Some("s1".to_string()),
            ResponseAction::Relay,
        );
        table.insert(Peer::Component(0), Id::Number(2), "fs/read", None, ResponseAction::Relay);
        assert!(table.has_session("s1"));
        assert!(!table.has_session("s2"));

        let editor = table.drain_origin(&Peer::Editor);
        assert_eq!(editor.len(), 1);
        assert_eq!(editor[0].method, "session/prompt");
        assert_eq!(table.len(), 1);
        assert_eq!(table.drain().len(), 1);
    }
}
