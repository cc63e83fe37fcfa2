use crate::types::{Payload, SourceKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::SystemTime;

#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub payload: Payload,
    /// Time of the last successful fetch. `None` until one succeeds.
    pub fetched_at: Option<SystemTime>,
    /// Set only while no fetch has ever succeeded.
    pub last_error: Option<String>,
}

impl CacheEntry {
    pub fn has_data(&self) -> bool {
        !self.payload.is_empty()
    }
}

/// What happened to the cache when a fetch attempt was recorded.
#[derive(Clone, Debug, PartialEq)]
pub enum Recorded {
    /// The entry now holds the fresh payload.
    Fresh(CacheEntry),
    /// The fetch failed and an earlier successful payload was kept. Carries the
    /// failure, which is not stored on the entry.
    Stale(CacheEntry, String),
    /// The fetch failed and there was nothing to fall back to.
    Empty(CacheEntry),
}

impl Recorded {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Recorded::Fresh(_))
    }

    /// The failure behind a stale or empty result.
    pub fn error(&self) -> Option<&str> {
        match self {
            Recorded::Fresh(_) => None,
            Recorded::Stale(_, error) => Some(error),
            Recorded::Empty(entry) => entry.last_error.as_deref(),
        }
    }

    pub fn into_entry(self) -> CacheEntry {
        match self {
            Recorded::Fresh(entry) | Recorded::Stale(entry, _) | Recorded::Empty(entry) => entry,
        }
    }

    pub fn entry(&self) -> &CacheEntry {
        match self {
            Recorded::Fresh(entry) | Recorded::Stale(entry, _) | Recorded::Empty(entry) => entry,
        }
    }
}

/// Last-known-good payload per source name. Never persisted.
#[derive(Default)]
pub struct CacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<CacheEntry> {
        self.entries.read().get(name).cloned()
    }

    /// Replaces the entry wholesale after a successful fetch.
    pub fn put(&self, name: &str, payload: Payload) -> CacheEntry {
        let entry = CacheEntry {
            payload,
            fetched_at: Some(SystemTime::now()),
            last_error: None,
        };
        self.entries.write().insert(name.to_string(), entry.clone());
        entry
    }

    /// Records a failed fetch. A previously successful payload is left exactly as
    /// it was; otherwise an empty payload carrying the error is stored.
    pub fn record_failure(&self, name: &str, kind: SourceKind, error: &str) -> Recorded {
        let mut entries = self.entries.write();

        if let Some(existing) = entries.get_mut(name) {
            if existing.fetched_at.is_some() {
                return Recorded::Stale(existing.clone(), error.to_string());
            }
            existing.last_error = Some(error.to_string());
            return Recorded::Empty(existing.clone());
        }

        let entry = CacheEntry {
            payload: Payload::empty_for(kind),
            fetched_at: None,
            last_error: Some(error.to_string()),
        };
        entries.insert(name.to_string(), entry.clone());
        Recorded::Empty(entry)
    }

    pub fn remove(&self, name: &str) -> Option<CacheEntry> {
        self.entries.write().remove(name)
    }

    pub fn snapshot(&self) -> HashMap<String, CacheEntry> {
        self.entries.read().clone()
    }
}
