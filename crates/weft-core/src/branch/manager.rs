//! Session admission and duplicate suppression.
//!
//! The manager owns every admitted session in a generational slot map and
//! tracks in-flight dials so one peer is never dialed twice.  Simultaneous
//! reciprocal connects resolve deterministically: both ends keep the
//! session in which the lexicographically *lower* identity was the active
//! dialler and close the other with *duplicate-connection*.

use crate::branch::connection::BranchConnection;
use crate::registry::SlotMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Which side initiated the transport under a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOrigin {
    Dialed,
    Accepted,
}

/// The origin that survives a duplicate-connection race between `local`
/// and `remote`.  Comparison is lexicographic over the 16-byte identity.
pub fn preferred_origin(local: &Uuid, remote: &Uuid) -> ConnectOrigin {
    if local.as_bytes() < remote.as_bytes() {
        ConnectOrigin::Dialed
    } else {
        ConnectOrigin::Accepted
    }
}

struct SessionEntry {
    uuid: Uuid,
    seq: u64,
    origin: ConnectOrigin,
    conn: Arc<BranchConnection>,
}

/// Outcome of offering a new session to the manager.
pub enum Admission {
    /// The session joined the map; a displaced older session, if any, must
    /// be closed by the caller (outside the manager lock).
    Admitted { replaced: Option<Arc<BranchConnection>> },
    /// An existing session won the tie-break; close the candidate.
    Rejected,
}

#[derive(Default)]
pub struct ConnectionManager {
    sessions: SlotMap<SessionEntry>,
    by_uuid: HashMap<Uuid, crate::registry::Handle>,
    connecting: HashSet<Uuid>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a dial slot for `uuid`.  Returns false when a session or an
    /// in-flight dial already exists.
    pub fn begin_connect(&mut self, uuid: Uuid) -> bool {
        if self.by_uuid.contains_key(&uuid) || self.connecting.contains(&uuid) {
            return false;
        }
        self.connecting.insert(uuid);
        true
    }

    /// Release the dial slot reserved by [`begin_connect`].
    pub fn finish_connect(&mut self, uuid: Uuid) {
        self.connecting.remove(&uuid);
    }

    /// Offer a freshly established session.
    pub fn admit(
        &mut self,
        local_uuid: &Uuid,
        uuid: Uuid,
        seq: u64,
        conn: Arc<BranchConnection>,
        origin: ConnectOrigin,
    ) -> Admission {
        let replaced = if let Some(&handle) = self.by_uuid.get(&uuid) {
            let existing = self.sessions.get(handle).expect("by_uuid is in sync");
            let keep = preferred_origin(local_uuid, &uuid);
            if origin == keep && existing.origin != keep {
                let displaced = self.sessions.remove(handle).expect("by_uuid is in sync");
                Some(displaced.conn)
            } else {
                return Admission::Rejected;
            }
        } else {
            None
        };
        let handle = self.sessions.insert(SessionEntry { uuid, seq, origin, conn });
        self.by_uuid.insert(uuid, handle);
        Admission::Admitted { replaced }
    }

    /// Remove the entry for `uuid`, but only if it is still the session
    /// identified by `seq` — a later session under the same identity must
    /// survive its predecessor's close notification.
    pub fn remove_if_seq(&mut self, uuid: Uuid, seq: u64) -> Option<Arc<BranchConnection>> {
        let handle = *self.by_uuid.get(&uuid)?;
        let entry = self.sessions.get(handle).ok()?;
        if entry.seq != seq {
            return None;
        }
        self.by_uuid.remove(&uuid);
        self.sessions.remove(handle).ok().map(|e| e.conn)
    }

    pub fn get(&self, uuid: &Uuid) -> Option<Arc<BranchConnection>> {
        let handle = *self.by_uuid.get(uuid)?;
        self.sessions.get(handle).ok().map(|e| Arc::clone(&e.conn))
    }

    /// Every admitted session, for broadcast fan-out and snapshots.
    pub fn running(&self) -> Vec<Arc<BranchConnection>> {
        self.sessions.iter().map(|(_, e)| Arc::clone(&e.conn)).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove every session, for branch teardown.
    pub fn drain(&mut self) -> Vec<Arc<BranchConnection>> {
        self.by_uuid.clear();
        self.connecting.clear();
        self.sessions.drain().into_iter().map(|e| e.conn).collect()
    }
}
