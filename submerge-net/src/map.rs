// The shard cookie -> Connection map. Lookups are optimistic:
// `get_connection` samples the map under an `InversibleLock` stamp and
// only falls back to the write side on a miss or a lost race.
// Structural changes (insert-on-miss, remove, replace) always go
// through the write side and are compare-and-swap by Arc identity, so a
// reconnect publish can never clobber a connection some other thread
// already removed or replaced.
//
// Safe Rust has no way to read shared memory outside a lock the way a
// textbook seqlock does, so the actual storage still lives behind a
// plain `Mutex`. What `InversibleLock` contributes here is the retry
// and cycle-detection *protocol*: readers never block on a writer, and
// a reader that would deadlock against a blocked writer gets
// `CycleDetected` instead of hanging.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::connection::{Connected, Connecting, Connection};
use crate::envelope::Payload;
use crate::error::CycleDetected;
use crate::ids::Cookie;
use crate::lock::InversibleLock;

pub type ConnectionHandle<P, C> = Arc<Mutex<Connection<P, C>>>;

pub struct ConnectionMap<P: Payload, C> {
    lock: InversibleLock,
    entries: Mutex<HashMap<Cookie, ConnectionHandle<P, C>>>,
}

impl<P: Payload, C> Default for ConnectionMap<P, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Payload, C> ConnectionMap<P, C> {
    pub fn new() -> Self {
        ConnectionMap {
            lock: InversibleLock::new(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up the connection for `cookie`, creating a fresh `Connecting`
    /// one under `queue_ceiling` if none exists yet. Reads are attempted
    /// optimistically first; a `CycleDetected` here means the caller
    /// already holds a read stamp on another map that would form an
    /// AB/BA cycle with this one's writer, and must release all its
    /// stamps and await resolution before retrying.
    pub fn get_connection(
        &self,
        cookie: Cookie,
        queue_ceiling: usize,
    ) -> Result<ConnectionHandle<P, C>, CycleDetected> {
        loop {
            let stamp = self.lock.optimistic_read()?;
            let existing = self.entries.lock().unwrap().get(&cookie).cloned();
            if self.lock.validate(stamp) {
                if let Some(conn) = existing {
                    return Ok(conn);
                }
                break;
            }
            // A writer raced us; retry the optimistic read.
        }

        let _guard = self.lock.write_lock();
        let mut entries = self.entries.lock().unwrap();
        let handle = entries
            .entry(cookie)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Connection::Connecting(Connecting::new(
                    cookie,
                    queue_ceiling,
                ))))
            })
            .clone();
        Ok(handle)
    }

    /// Look up the connection for `cookie` without creating one on a
    /// miss. Inbound envelope routing is "if present, deliver to it;
    /// else log and drop" — unlike `get_connection`, a miss here is not
    /// an invitation to start a fresh shard.
    pub fn lookup(&self, cookie: Cookie) -> Result<Option<ConnectionHandle<P, C>>, CycleDetected> {
        loop {
            let stamp = self.lock.optimistic_read()?;
            let existing = self.entries.lock().unwrap().get(&cookie).cloned();
            if self.lock.validate(stamp) {
                return Ok(existing);
            }
        }
    }

    /// Remove `cookie`'s entry, but only if it is still the exact
    /// connection the caller observed (by `Arc` identity). Returns
    /// `false` if it was already removed or replaced.
    pub fn remove_if(&self, cookie: Cookie, expect: &ConnectionHandle<P, C>) -> bool {
        let _guard = self.lock.write_lock();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&cookie) {
            Some(current) if Arc::ptr_eq(current, expect) => {
                entries.remove(&cookie);
                true
            }
            _ => false,
        }
    }

    /// Replace `cookie`'s entry with `new_connection`, but only if it is
    /// still the exact connection the caller observed. This is the
    /// publish step of a reconnect: if it fails, someone else already
    /// halted or reconnected the shard and the caller's freshly-built
    /// connection must be discarded.
    pub fn replace_if(
        &self,
        cookie: Cookie,
        expect: &ConnectionHandle<P, C>,
        new_connection: Connection<P, C>,
    ) -> bool {
        self.replace_handle_if(cookie, expect, Arc::new(Mutex::new(new_connection)))
    }

    /// Same as [`Self::replace_if`], but for a connection that has
    /// already been wrapped in its map-shaped handle — needed when the
    /// caller (the reconnect protocol) must hand that same `Arc` to a
    /// `ReconnectForwarder` installed on `expect` *before* knowing
    /// whether the publish itself will win its race.
    pub fn replace_handle_if(
        &self,
        cookie: Cookie,
        expect: &ConnectionHandle<P, C>,
        new_connection: ConnectionHandle<P, C>,
    ) -> bool {
        let _guard = self.lock.write_lock();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&cookie) {
            Some(current) if Arc::ptr_eq(current, expect) => {
                entries.insert(cookie, new_connection);
                true
            }
            _ => false,
        }
    }

    /// Poison every connection currently in the map with `reason`, then
    /// clear the map: retired-generation handling poisons all
    /// connections under the write lock and clears the map. A no-op, by
    /// construction, on any call after the first — there is nothing
    /// left to poison.
    pub fn poison_all(&self, reason: &str) {
        let _guard = self.lock.write_lock();
        let mut entries = self.entries.lock().unwrap();
        for handle in entries.values() {
            handle.lock().unwrap().poison(reason.to_string());
        }
        entries.clear();
    }

    /// Park until this lock's current writer (if any) finishes. Called by
    /// a reader after catching [`CycleDetected`] and releasing its own
    /// stamps.
    pub fn await_writer(&self) {
        self.lock.await_resolution();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendInfo;
    use crate::time::NodeID;

    #[test]
    fn get_connection_creates_then_reuses() {
        let map: ConnectionMap<u32, ()> = ConnectionMap::new();
        let a = map.get_connection(1, 8).unwrap();
        let b = map.get_connection(1, 8).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn different_cookies_get_different_connections() {
        let map: ConnectionMap<u32, ()> = ConnectionMap::new();
        let a = map.get_connection(1, 8).unwrap();
        let b = map.get_connection(2, 8).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn lookup_does_not_create_on_miss() {
        let map: ConnectionMap<u32, ()> = ConnectionMap::new();
        assert!(map.lookup(42).unwrap().is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn replace_fails_if_entry_already_changed() {
        let map: ConnectionMap<u32, ()> = ConnectionMap::new();
        let original = map.get_connection(1, 8).unwrap();
        let info = BackendInfo {
            backend: NodeID(9),
            session_token: 1,
            max_outstanding: 4,
        };
        // Someone else replaces the entry first.
        assert!(map.replace_if(1, &original, Connection::Connected(Connected::new(1, info, 4, ()))));

        // The caller's stale handle can no longer win a CAS.
        assert!(!map.replace_if(1, &original, Connection::Connecting(Connecting::new(1, 8))));
    }

    #[test]
    fn remove_if_respects_identity() {
        let map: ConnectionMap<u32, ()> = ConnectionMap::new();
        let handle = map.get_connection(1, 8).unwrap();
        let stale = map.get_connection(2, 8).unwrap();
        assert!(!map.remove_if(1, &stale));
        assert!(map.remove_if(1, &handle));
        assert!(map.is_empty());
    }

    #[test]
    fn poison_all_is_idempotent_and_clears_the_map() {
        let map: ConnectionMap<u32, ()> = ConnectionMap::new();
        map.get_connection(1, 8).unwrap();
        map.get_connection(2, 8).unwrap();
        map.poison_all("client halted");
        assert!(map.is_empty());
        // Second call: nothing left to poison, still a no-op.
        map.poison_all("client halted");
        assert!(map.is_empty());
    }
}
