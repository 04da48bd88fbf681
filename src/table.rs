//! Bounded connection table keyed by 4-tuple, shared by the TCP and UDP proxies.

use lru::LruCache;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::num::NonZeroUsize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub guest_ip: Ipv4Addr,
    pub guest_port: u16,
    pub outside_ip: Ipv4Addr,
    pub outside_port: u16,
}

impl FourTuple {
    pub fn new(guest_ip: Ipv4Addr, guest_port: u16, outside_ip: Ipv4Addr, outside_port: u16) -> Self {
        FourTuple { guest_ip, guest_port, outside_ip, outside_port }
    }

    pub fn guest(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.guest_ip, self.guest_port)
    }

    pub fn outside(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.outside_ip, self.outside_port)
    }
}

impl fmt::Display for FourTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.guest(), self.outside())
    }
}

/// Fixed-capacity map with least-recently-used ordering.
///
/// Lookups never reorder entries; only [`ConnectionTable::touch`] and inserts
/// do. Callers choose per insert whether a full table refuses the newcomer or
/// evicts.
pub struct ConnectionTable<V> {
    entries: LruCache<FourTuple, V>,
}

impl<V> ConnectionTable<V> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        ConnectionTable {
            entries: LruCache::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity()
    }

    pub fn contains(&self, key: &FourTuple) -> bool {
        self.entries.contains(key)
    }

    pub fn get(&self, key: &FourTuple) -> Option<&V> {
        self.entries.peek(key)
    }

    pub fn get_mut(&mut self, key: &FourTuple) -> Option<&mut V> {
        self.entries.peek_mut(key)
    }

    /// Marks `key` as the most recently used entry.
    pub fn touch(&mut self, key: &FourTuple) {
        self.entries.promote(key);
    }

    /// Inserts without evicting. Hands `value` back when the table is full or
    /// the key is already present.
    pub fn try_insert(&mut self, key: FourTuple, value: V) -> Result<(), V> {
        if self.entries.contains(&key) || self.is_full() {
            return Err(value);
        }
        self.entries.put(key, value);
        Ok(())
    }

    /// Inserts, evicting the least recently used entry if the table is full.
    /// Returns the evicted entry, or the previous value under the same key.
    pub fn insert_evicting(&mut self, key: FourTuple, value: V) -> Option<(FourTuple, V)> {
        self.entries.push(key, value)
    }

    pub fn remove(&mut self, key: &FourTuple) -> Option<V> {
        self.entries.pop(key)
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<FourTuple> {
        self.entries.iter().map(|(key, _)| *key).collect()
    }
}
