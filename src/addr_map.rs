//! Host-IP to guest-PC address map (§4.A). Populated on the emulator's
//! translation thread, read from decoder worker threads.
//!
//! The source keyed an open-addressed table (linear, and in one
//! variant quadratic, probing) by host address with a fixed starting
//! size and largely dead resize code. `DashMap` gives the same
//! contract — amortised O(1) insert/lookup, grow-before-half-full,
//! safe concurrent readers with a single logical writer — without
//! reimplementing probing by hand.

use dashmap::DashMap;

/// Sentinel returned by `lookup` when no mapping exists for a host IP.
pub const NO_MAPPING: u64 = 0;

pub struct AddrMap {
    inner: DashMap<u64, u64>,
}

impl AddrMap {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Records that guest PC `guest_pc` begins at host instruction
    /// pointer `host_ip`. Called only from the translation thread,
    /// before the block is ever executed. Re-insertion under an
    /// existing key is not expected; the existing entry is kept and
    /// the call is a silent no-op, matching the source's "treat as
    /// fatal or ignore" licence for a condition that should not arise.
    pub fn insert(&self, guest_pc: u64, host_ip: u64) {
        self.inner.entry(host_ip).or_insert(guest_pc);
    }

    /// Looks up the guest PC for a host IP observed by a decoder
    /// worker. Returns `NO_MAPPING` on a miss.
    pub fn lookup(&self, host_ip: u64) -> u64 {
        self.inner
            .get(&host_ip)
            .map(|entry| *entry)
            .unwrap_or(NO_MAPPING)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for AddrMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lookup_on_empty_table_misses() {
        let map = AddrMap::new();
        assert_eq!(map.lookup(0x1000), NO_MAPPING);
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let map = AddrMap::new();
        map.insert(0xdead_beef, 0x4000);
        assert_eq!(map.lookup(0x4000), 0xdead_beef);
    }

    #[test]
    fn reinsertion_of_existing_key_is_ignored() {
        let map = AddrMap::new();
        map.insert(1, 0x4000);
        map.insert(2, 0x4000);
        assert_eq!(map.lookup(0x4000), 1);
    }

    #[test]
    fn entry_inserted_on_one_thread_is_visible_after_join() {
        let map = Arc::new(AddrMap::new());
        let writer = {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 0..1000u64 {
                    map.insert(i, 0x1000 + i);
                }
            })
        };
        writer.join().unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..1000u64 {
                        assert_eq!(map.lookup(0x1000 + i), i);
                    }
                })
            })
            .collect();
        for r in readers {
            r.join().unwrap();
        }
    }

    #[test]
    fn grows_past_many_insertions_without_losing_entries() {
        let map = AddrMap::new();
        for i in 0..50_000u64 {
            map.insert(i, i * 8);
        }
        for i in 0..50_000u64 {
            assert_eq!(map.lookup(i * 8), i);
        }
        assert_eq!(map.len(), 50_000);
    }
}
