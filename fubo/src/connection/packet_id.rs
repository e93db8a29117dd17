// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::PacketId;
use std::collections::BTreeSet;

/// Lowest-unused packet id allocator.
///
/// Ids live in `1..=u16::MAX`; 0 is the "no id" marker and is never handed
/// out. The pool itself is synchronous; waiting for a free id is layered
/// on top by the endpoint.
#[derive(Debug, Default, Clone)]
pub struct PacketIdPool {
    used: BTreeSet<u16>,
}

impl PacketIdPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids currently handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.used.len()
    }

    /// Returns true if no id is handed out.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Check whether `packet_id` is currently handed out.
    #[must_use]
    pub fn is_used(&self, packet_id: PacketId) -> bool {
        self.used.contains(&packet_id.value())
    }

    /// Hand out the lowest free id, or `None` when all 65535 ids are
    /// in flight.
    pub fn acquire(&mut self) -> Option<PacketId> {
        let mut candidate: u16 = 1;
        for used in &self.used {
            if *used != candidate {
                break;
            }
            if candidate == u16::MAX {
                return None;
            }
            candidate += 1;
        }
        self.used.insert(candidate);
        Some(PacketId::new(candidate))
    }

    /// Reserve a specific id, e.g. one restored from persisted session
    /// state.
    ///
    /// Returns false on conflict with an id already handed out, or on 0.
    pub fn register(&mut self, packet_id: PacketId) -> bool {
        if packet_id.value() == 0 {
            return false;
        }
        self.used.insert(packet_id.value())
    }

    /// Return `packet_id` to the pool.
    ///
    /// Releasing an id that is not handed out is a no-op; returns whether
    /// the id was live.
    pub fn release(&mut self, packet_id: PacketId) -> bool {
        self.used.remove(&packet_id.value())
    }

    /// Return every id to the pool.
    pub fn clear(&mut self) {
        self.used.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_lowest_unused() {
        let mut pool = PacketIdPool::new();
        assert_eq!(pool.acquire(), Some(PacketId::new(1)));
        assert_eq!(pool.acquire(), Some(PacketId::new(2)));
        assert_eq!(pool.acquire(), Some(PacketId::new(3)));

        assert!(pool.release(PacketId::new(2)));
        assert_eq!(pool.acquire(), Some(PacketId::new(2)));
        assert_eq!(pool.acquire(), Some(PacketId::new(4)));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut pool = PacketIdPool::new();
        let id = pool.acquire().unwrap();
        assert!(pool.release(id));
        assert!(!pool.release(id));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_register_conflict() {
        let mut pool = PacketIdPool::new();
        assert!(pool.register(PacketId::new(7)));
        assert!(!pool.register(PacketId::new(7)));
        assert!(!pool.register(PacketId::new(0)));

        // The registered id is skipped by acquire.
        for _ in 0..6 {
            let id = pool.acquire().unwrap();
            assert_ne!(id.value(), 7);
        }
        assert_eq!(pool.acquire(), Some(PacketId::new(8)));
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = PacketIdPool::new();
        for _ in 1..=u16::MAX {
            assert!(pool.acquire().is_some());
        }
        assert_eq!(pool.acquire(), None);

        pool.release(PacketId::new(40_000));
        assert_eq!(pool.acquire(), Some(PacketId::new(40_000)));
    }
}
