//! Resource references a session holds on behalf of its client
//!
//! Two kinds are tracked:
//!
//! - **held**: resources the client registered (directly or as inline
//!   attachments); released by `res.release` or on close
//! - **pinned**: resources placed in outbound performances; released by
//!   `res.ack`, when the ack deadline passes, or on close
//!
//! This type only does bookkeeping. Callers release the returned ids on the
//! resource manager.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::resource::Rid;

/// Per-session reference ledger
#[derive(Debug, Default)]
pub struct SessionRefs {
    held: HashMap<Rid, u32>,
    pinned: HashMap<Rid, VecDeque<Instant>>,
}

impl SessionRefs {
    /// Empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reference taken for the client
    pub fn hold(&mut self, rid: Rid) {
        *self.held.entry(rid).or_insert(0) += 1;
    }

    /// Give back one held reference; false if none was held
    pub fn unhold(&mut self, rid: &Rid) -> bool {
        match self.held.get_mut(rid) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.held.remove(rid);
                true
            }
            None => false,
        }
    }

    /// Record an outbound pin expiring at `deadline`
    pub fn pin(&mut self, rid: Rid, deadline: Instant) {
        self.pinned.entry(rid).or_default().push_back(deadline);
    }

    /// Acknowledge the oldest pin on `rid`; false if none was outstanding
    pub fn ack(&mut self, rid: &Rid) -> bool {
        let Some(deadlines) = self.pinned.get_mut(rid) else {
            return false;
        };
        deadlines.pop_front();
        if deadlines.is_empty() {
            self.pinned.remove(rid);
        }
        true
    }

    /// Remove and return every pin whose deadline is at or before `now`
    pub fn take_expired(&mut self, now: Instant) -> Vec<Rid> {
        let mut expired = Vec::new();
        self.pinned.retain(|rid, deadlines| {
            while deadlines.front().is_some_and(|d| *d <= now) {
                deadlines.pop_front();
                expired.push(rid.clone());
            }
            !deadlines.is_empty()
        });
        expired
    }

    /// Earliest outstanding pin deadline
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pinned
            .values()
            .filter_map(|deadlines| deadlines.iter().min().copied())
            .min()
    }

    /// Number of outstanding pins
    #[must_use]
    pub fn pinned_count(&self) -> usize {
        self.pinned.values().map(VecDeque::len).sum()
    }

    /// Number of held references
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.values().map(|c| *c as usize).sum()
    }

    /// Empty the ledger, returning one id per reference to release
    pub fn drain(&mut self) -> Vec<Rid> {
        let mut rids = Vec::with_capacity(self.held_count() + self.pinned_count());
        for (rid, count) in self.held.drain() {
            rids.extend(std::iter::repeat(rid).take(count as usize));
        }
        for (rid, deadlines) in self.pinned.drain() {
            rids.extend(std::iter::repeat(rid).take(deadlines.len()));
        }
        rids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_hold_and_unhold_count() {
        let mut refs = SessionRefs::new();
        let rid = Rid::from("res-a-1");
        refs.hold(rid.clone());
        refs.hold(rid.clone());
        assert_eq!(refs.held_count(), 2);

        assert!(refs.unhold(&rid));
        assert!(refs.unhold(&rid));
        assert!(!refs.unhold(&rid));
    }

    #[test]
    fn test_ack_releases_oldest_pin() {
        let now = Instant::now();
        let mut refs = SessionRefs::new();
        let rid = Rid::from("res-a-1");
        refs.pin(rid.clone(), now + Duration::from_secs(1));
        refs.pin(rid.clone(), now + Duration::from_secs(5));

        assert!(refs.ack(&rid));
        assert_eq!(refs.next_deadline(), Some(now + Duration::from_secs(5)));
        assert!(refs.ack(&rid));
        assert!(!refs.ack(&rid));
        assert_eq!(refs.next_deadline(), None);
    }

    #[test]
    fn test_take_expired() {
        let now = Instant::now();
        let mut refs = SessionRefs::new();
        refs.pin(Rid::from("a"), now);
        refs.pin(Rid::from("b"), now + Duration::from_secs(60));

        assert_eq!(refs.take_expired(now), vec![Rid::from("a")]);
        assert_eq!(refs.pinned_count(), 1);
    }

    #[test]
    fn test_drain_repeats_per_reference() {
        let now = Instant::now();
        let mut refs = SessionRefs::new();
        refs.hold(Rid::from("a"));
        refs.hold(Rid::from("a"));
        refs.pin(Rid::from("b"), now);

        let mut drained = refs.drain();
        drained.sort();
        assert_eq!(drained, vec![Rid::from("a"), Rid::from("a"), Rid::from("b")]);
        assert_eq!(refs.held_count() + refs.pinned_count(), 0);
    }
}
