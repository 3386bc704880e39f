use std::collections::HashMap;
use std::time::{Duration, Instant};

const MAX_ENTRIES: usize = 1024;

/// Remembers answered Probe message ids so multicast retransmissions of the
/// same Probe get a single ProbeMatch
#[derive(Debug)]
pub struct ProbeMatchCache {
    ttl: Duration,
    entries: HashMap<String, Instant>,
}

impl ProbeMatchCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Record `message_id`; false when it was already answered within the TTL
    pub fn check_and_insert(&mut self, message_id: &str, now: Instant) -> bool {
        if let Some(answered) = self.entries.get(message_id) {
            if now.saturating_duration_since(*answered) < self.ttl {
                return false;
            }
        }

        if self.entries.len() >= MAX_ENTRIES {
            self.purge(now);
        }
        if self.entries.len() >= MAX_ENTRIES {
            // Everything is fresh; forget the oldest answer
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(id, _)| id.clone())
            {
                self.entries.remove(&oldest);
            }
        }

        self.entries.insert(message_id.to_string(), now);
        true
    }

    /// Drop expired entries
    pub fn purge(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, answered| now.saturating_duration_since(*answered) < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
