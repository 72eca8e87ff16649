//! Connection table and housekeeping.
//!
//! The table is the single owner of every [`Connection`] of one interface.
//! Slots are reused, but each reuse bumps the slot generation so a stale
//! [`ConnectionId`] never resolves. Closed connections are released only by
//! [`ConnectionTable::housekeep`] once their grace period has elapsed, or by
//! [`ConnectionTable::drain`] at interface teardown.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::connection::{Connection, ConnectionId};
use crate::engine::EngineSocket;

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    conn: Option<Connection>,
}

/// Arena of connections keyed by [`ConnectionId`].
#[derive(Debug, Default)]
pub struct ConnectionTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Reverse index for engine callbacks, which only know engine sockets.
    by_engine: HashMap<EngineSocket, ConnectionId>,
    len: usize,
    last_housekeeping: Option<Instant>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection built from its freshly assigned id.
    pub fn insert_with<F>(&mut self, build: F) -> ConnectionId
    where
        F: FnOnce(ConnectionId) -> Connection,
    {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = ConnectionId::new(index, slot.generation);
        let conn = build(id);
        if let Some(sock) = conn.engine_socket() {
            self.by_engine.insert(sock, id);
        }
        slot.conn = Some(conn);
        self.len += 1;
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.slots
            .get(id.index() as usize)
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.conn.as_ref())
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.conn.as_mut())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.get(id).is_some()
    }

    /// Resolve an engine socket to the connection that owns it.
    pub fn lookup_engine(&self, sock: EngineSocket) -> Option<ConnectionId> {
        self.by_engine.get(&sock).copied().filter(|id| self.contains(*id))
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let slot = self
            .slots
            .get_mut(id.index() as usize)
            .filter(|s| s.generation == id.generation())?;
        let conn = slot.conn.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        if let Some(sock) = conn.engine_socket() {
            self.by_engine.remove(&sock);
        }
        self.len -= 1;
        Some(conn)
    }

    /// Release every connection whose grace period has elapsed.
    pub fn housekeep(&mut self, now: Instant, grace: Duration) -> Vec<Connection> {
        let expired: Vec<ConnectionId> = self
            .iter()
            .filter(|c| c.is_reclaimable(now, grace))
            .map(|c| c.id())
            .collect();
        self.last_housekeeping = Some(now);
        let released: Vec<Connection> = expired.into_iter().filter_map(|id| self.remove(id)).collect();
        if !released.is_empty() {
            debug!(count = released.len(), remaining = self.len, "Released closed connections");
        }
        released
    }

    /// Run [`housekeep`](Self::housekeep) if `interval` has passed since the
    /// previous pass. Returns `None` when the pass was skipped.
    pub fn housekeep_if_due(
        &mut self,
        now: Instant,
        interval: Duration,
        grace: Duration,
    ) -> Option<Vec<Connection>> {
        let due = self
            .last_housekeeping
            .is_none_or(|last| now.saturating_duration_since(last) >= interval);
        due.then(|| self.housekeep(now, grace))
    }

    /// Remove every connection. Only used at interface teardown.
    pub fn drain(&mut self) -> Vec<Connection> {
        let ids = self.ids();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.slots.iter().filter_map(|s| s.conn.as_ref())
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.iter().map(|c| c.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
