// src/slab.rs
use std::time::{Duration, Instant};

enum Slot<C> {
    Free { next: Option<usize> },
    Idle { conn: C, last_active: Instant },
    /// Checked out to the thread pool; comes back through `check_in`.
    InFlight,
}

/// Token-indexed connection table with an O(1) free list.
///
/// Slots are allocated lazily up to `capacity` and recycled most-recent-first.
pub struct ConnectionSlab<C> {
    entries: Vec<Slot<C>>,
    head_free: Option<usize>,
    active_count: usize,
    capacity: usize,
}

impl<C> ConnectionSlab<C> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            head_free: None,
            active_count: 0,
            capacity,
        }
    }

    /// Store a new connection and return its token; hands it back when full.
    pub fn insert(&mut self, conn: C) -> Result<usize, C> {
        let idx = match self.head_free {
            Some(idx) => idx,
            None if self.entries.len() < self.capacity => {
                self.entries.push(Slot::Free { next: None });
                self.entries.len() - 1
            }
            None => return Err(conn),
        };
        if let Slot::Free { next } = self.entries[idx] {
            self.head_free = next;
        }
        self.entries[idx] = Slot::Idle {
            conn,
            last_active: Instant::now(),
        };
        self.active_count += 1;
        Ok(idx)
    }

    /// Borrow an idle connection, refreshing its activity stamp.
    pub fn get_mut(&mut self, token: usize) -> Option<&mut C> {
        match self.entries.get_mut(token) {
            Some(Slot::Idle { conn, last_active }) => {
                *last_active = Instant::now();
                Some(conn)
            }
            _ => None,
        }
    }

    /// Move a connection out for a worker. The slot stays reserved.
    pub fn check_out(&mut self, token: usize) -> Option<C> {
        let slot = self.entries.get_mut(token)?;
        if !matches!(slot, Slot::Idle { .. }) {
            return None;
        }
        match std::mem::replace(slot, Slot::InFlight) {
            Slot::Idle { conn, .. } => Some(conn),
            _ => None,
        }
    }

    /// Return a checked-out connection to its slot. Fails if the slot was
    /// not reserved for it.
    pub fn check_in(&mut self, token: usize, conn: C) -> Result<(), C> {
        let Some(slot) = self.entries.get_mut(token) else {
            return Err(conn);
        };
        if !matches!(slot, Slot::InFlight) {
            return Err(conn);
        }
        *slot = Slot::Idle {
            conn,
            last_active: Instant::now(),
        };
        Ok(())
    }

    /// Free a slot. Returns the connection if it was idle; a reserved
    /// in-flight slot is released without one.
    pub fn remove(&mut self, token: usize) -> Option<C> {
        let slot = self.entries.get_mut(token)?;
        if matches!(slot, Slot::Free { .. }) {
            return None;
        }
        let old = std::mem::replace(
            slot,
            Slot::Free {
                next: self.head_free,
            },
        );
        self.head_free = Some(token);
        self.active_count -= 1;
        match old {
            Slot::Idle { conn, .. } => Some(conn),
            _ => None,
        }
    }

    pub fn is_in_flight(&self, token: usize) -> bool {
        matches!(self.entries.get(token), Some(Slot::InFlight))
    }

    /// Tokens of idle connections untouched for longer than `timeout`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot {
                Slot::Idle { last_active, .. }
                    if now.saturating_duration_since(*last_active) > timeout =>
                {
                    Some(idx)
                }
                _ => None,
            })
            .collect()
    }

    /// Tokens of every occupied slot, idle or in flight.
    pub fn tokens(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| !matches!(slot, Slot::Free { .. }))
            .map(|(idx, _)| idx)
            .collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_operations() {
        let mut slab = ConnectionSlab::new(2);
        assert_eq!(slab.capacity(), 2);

        let a = slab.insert("a").unwrap();
        let b = slab.insert("b").unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(slab.insert("c"), Err("c"));
        assert_eq!(slab.len(), 2);

        assert_eq!(slab.remove(a), Some("a"));
        assert_eq!(slab.remove(a), None);
        assert_eq!(slab.len(), 1);

        // Freed slot is reused first.
        assert_eq!(slab.insert("d").unwrap(), 0);
        assert_eq!(slab.get_mut(0), Some(&mut "d"));
    }

    #[test]
    fn test_check_out_and_in() {
        let mut slab = ConnectionSlab::new(4);
        let t = slab.insert(7u32).unwrap();

        let conn = slab.check_out(t).unwrap();
        assert!(slab.is_in_flight(t));
        assert!(slab.get_mut(t).is_none());
        assert!(slab.check_out(t).is_none());
        assert_eq!(slab.len(), 1);
        assert_eq!(slab.tokens(), vec![t]);

        assert_eq!(slab.check_in(t + 1, 9), Err(9));
        slab.check_in(t, conn + 1).unwrap();
        assert_eq!(slab.get_mut(t), Some(&mut 8));
        assert_eq!(slab.check_in(t, 0), Err(0));
    }

    #[test]
    fn test_expired_skips_in_flight() {
        let mut slab = ConnectionSlab::new(4);
        let idle = slab.insert(1).unwrap();
        let busy = slab.insert(2).unwrap();
        let _ = slab.check_out(busy).unwrap();

        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(slab.expired(later, Duration::from_secs(15)), vec![idle]);
        assert!(slab.expired(Instant::now(), Duration::from_secs(15)).is_empty());

        assert_eq!(slab.remove(busy), None);
        assert_eq!(slab.len(), 1);
    }
}
