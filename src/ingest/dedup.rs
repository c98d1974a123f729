//! Seen-set of external message identifiers.
//!
//! Grows for the lifetime of the process. Identifiers are short and bounded
//! by mailbox volume; capping or persisting the set is left to a durable
//! backend.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: Mutex<HashSet<String>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_seen(&self, external_id: &str) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(external_id)
    }

    /// Record an identifier. Returns true if it was not seen before.
    pub fn mark_seen(&self, external_id: impl Into<String>) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(external_id.into())
    }

    pub fn len(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_and_checks() {
        let dedup = Deduplicator::new();
        assert!(dedup.is_empty());
        assert!(!dedup.has_seen("E1"));

        assert!(dedup.mark_seen("E1"));
        assert!(dedup.has_seen("E1"));
        assert!(!dedup.has_seen("E2"));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn marking_twice_is_idempotent() {
        let dedup = Deduplicator::new();
        assert!(dedup.mark_seen("E1"));
        assert!(!dedup.mark_seen("E1".to_string()));
        assert_eq!(dedup.len(), 1);
    }
}
