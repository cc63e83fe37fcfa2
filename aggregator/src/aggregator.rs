use crate::cache::{CacheEntry, CacheStore, Recorded};
use crate::fetch::{FetchError, Upstream};
use crate::metrics_defs::{CACHE_HIT, CACHE_MISS, CACHE_STALE};
use crate::registry::{Registry, RegistryError};
use crate::types::{DisplayMetadata, Payload, SourceDescriptor, SourceLocation};
use parking_lot::Mutex;
use shared::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// How a read was answered. Surfaces as the `X-Cache` response header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Stale,
}

impl CacheStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Stale => "STALE",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Served {
    pub status: CacheStatus,
    pub entry: CacheEntry,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ReadError {
    #[error("unknown source {0:?}")]
    UnknownSource(String),

    /// Upstream failed and nothing was ever fetched for this source.
    #[error("{message}")]
    Unavailable { name: String, message: String },
}

struct AggregatorInner {
    registry: Registry,
    cache: CacheStore,
    upstream: Arc<dyn Upstream>,
    // One guard per source name so that at most one fetch per source runs at a time.
    fetch_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    started_at: Instant,
}

/// Ties the registry, the cache and the upstream together. Cheap to clone.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<AggregatorInner>,
}

impl Aggregator {
    pub fn new(registry: Registry, upstream: Arc<dyn Upstream>) -> Self {
        Aggregator {
            inner: Arc::new(AggregatorInner {
                registry,
                cache: CacheStore::new(),
                upstream,
                fetch_locks: Mutex::new(HashMap::new()),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.inner.started_at.elapsed()
    }

    /// Serves a source from the cache, fetching through to upstream on a miss.
    /// With `force` the cache is bypassed and upstream is always consulted, so a
    /// failed fetch over a previous payload is answered as stale.
    pub async fn read(&self, name: &str, force: bool) -> Result<Served, ReadError> {
        let unknown = || ReadError::UnknownSource(name.to_string());
        self.registry().resolve(name).ok_or_else(unknown)?;

        if !force && let Some(entry) = self.cached(name) {
            counter!(CACHE_HIT).increment(1);
            return Ok(Served {
                status: CacheStatus::Hit,
                entry,
            });
        }

        let lock = self.fetch_lock(name);
        let _guard = lock.lock().await;

        // Concurrent misses for the same source wait here for the first one and
        // reuse its result.
        if !force && let Some(entry) = self.cached(name) {
            counter!(CACHE_MISS).increment(1);
            return Ok(Served {
                status: CacheStatus::Miss,
                entry,
            });
        }

        // The source may have been removed or replaced while we waited.
        let descriptor = self.registry().resolve(name).ok_or_else(unknown)?;

        match self.fetch_and_record(&descriptor).await {
            Recorded::Fresh(entry) => {
                counter!(CACHE_MISS).increment(1);
                Ok(Served {
                    status: CacheStatus::Miss,
                    entry,
                })
            }
            Recorded::Stale(entry, _) => {
                counter!(CACHE_STALE).increment(1);
                Ok(Served {
                    status: CacheStatus::Stale,
                    entry,
                })
            }
            Recorded::Empty(entry) => Err(ReadError::Unavailable {
                name: name.to_string(),
                message: entry.last_error.unwrap_or_default(),
            }),
        }
    }

    /// Fetches one source by name and records the outcome in the cache. Waits
    /// for any fetch of the same source already in progress, then fetches from
    /// the location registered at that point. Returns `None` when the source no
    /// longer exists.
    pub async fn refresh(&self, name: &str) -> Option<Recorded> {
        let lock = self.fetch_lock(name);
        let _guard = lock.lock().await;

        let Some(descriptor) = self.registry().resolve(name) else {
            tracing::debug!(source = %name, "Skipping refresh of removed source");
            return None;
        };
        Some(self.fetch_and_record(&descriptor).await)
    }

    /// Registers or replaces a dynamic source and drops whatever was cached
    /// under its name. The location is probed with one fetch whose outcome is
    /// returned to the caller; the cache is filled by the first read. A failed
    /// probe does not undo the registration.
    pub async fn register_source(
        &self,
        name: &str,
        location: SourceLocation,
        metadata: DisplayMetadata,
    ) -> Result<(SourceDescriptor, Result<Payload, FetchError>), RegistryError> {
        let lock = self.fetch_lock(name);
        let _guard = lock.lock().await;

        let owned = name.to_string();
        let descriptor = self
            .update_registry(move |registry| registry.register(&owned, location, metadata))
            .await?;
        self.cache().remove(name);
        tracing::info!(source = %name, kind = %descriptor.kind(), "Registered dynamic source");

        let probe = self.inner.upstream.fetch(&descriptor.location).await;
        if let Err(e) = &probe {
            tracing::warn!(source = %name, error = %e, "Newly registered source could not be fetched");
        }
        Ok((descriptor, probe))
    }

    pub async fn remove_source(&self, name: &str) -> Result<SourceDescriptor, RegistryError> {
        let lock = self.fetch_lock(name);
        let removed = {
            let _guard = lock.lock().await;
            let owned = name.to_string();
            let removed = self
                .update_registry(move |registry| registry.remove(&owned))
                .await;
            if removed.is_ok() {
                self.cache().remove(name);
            }
            removed
        };
        drop(lock);
        self.release_fetch_lock(name);

        let removed = removed?;
        tracing::info!(source = %name, "Removed dynamic source");
        Ok(removed)
    }

    /// Returns whether the hidden set changed.
    pub async fn hide_source(&self, name: &str) -> Result<bool, RegistryError> {
        let owned = name.to_string();
        self.update_registry(move |registry| registry.hide(&owned)).await
    }

    /// Returns whether the hidden set changed.
    pub async fn unhide_source(&self, name: &str) -> Result<bool, RegistryError> {
        let owned = name.to_string();
        self.update_registry(move |registry| registry.unhide(&owned)).await
    }

    /// Registry mutations write to the state store while holding the registry
    /// lock, so they run on the blocking pool.
    async fn update_registry<T, F>(&self, update: F) -> Result<T, RegistryError>
    where
        T: Send + 'static,
        F: FnOnce(&Registry) -> Result<T, RegistryError> + Send + 'static,
    {
        let aggregator = self.clone();
        tokio::task::spawn_blocking(move || update(aggregator.registry())).await?
    }

    fn cached(&self, name: &str) -> Option<CacheEntry> {
        self.cache().get(name).filter(CacheEntry::has_data)
    }

    fn fetch_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .fetch_locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Drops the guard for `name` once nobody holds or waits on it. A task
    /// still queued on the old guard keeps it in the map, so a re-registered
    /// source never gets a second guard.
    fn release_fetch_lock(&self, name: &str) {
        let mut locks = self.inner.fetch_locks.lock();
        if locks
            .get(name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(name);
        }
    }

    /// Caller must hold the fetch lock for `descriptor.name`.
    async fn fetch_and_record(&self, descriptor: &SourceDescriptor) -> Recorded {
        let name = &descriptor.name;
        match self.inner.upstream.fetch(&descriptor.location).await {
            Ok(payload) => {
                let entry = self.cache().put(name, payload);
                tracing::debug!(
                    source = %name,
                    records = entry.payload.record_count(),
                    "Fetched source"
                );
                Recorded::Fresh(entry)
            }
            Err(e) => {
                let error = e.to_string();
                let recorded = self
                    .cache()
                    .record_failure(name, descriptor.kind(), &error);
                match &recorded {
                    Recorded::Stale(..) => {
                        tracing::warn!(source = %name, error = %error, "Fetch failed, keeping previous payload")
                    }
                    _ => {
                        tracing::warn!(source = %name, error = %error, "Fetch failed with nothing cached")
                    }
                }
                recorded
            }
        }
    }
}
