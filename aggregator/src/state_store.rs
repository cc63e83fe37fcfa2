//! Durable storage for registry state that must survive a restart: the
//! runtime-registered sources and the hidden set. Cached payloads are never
//! stored here.
use crate::config::StateStoreType;
use crate::types::SourceDescriptor;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const DYNAMIC_FILENAME: &str = "dynamic_sources.json";
const HIDDEN_FILENAME: &str = "hidden_sources.json";

#[derive(thiserror::Error, Debug)]
pub enum StateStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSources {
    pub sources: Vec<SourceDescriptor>,
    pub updated_at: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HiddenSources {
    pub hidden: Vec<String>,
    pub updated_at: u64,
}

pub trait StateStore: Send + Sync {
    fn load_dynamic(&self) -> Result<DynamicSources, StateStoreError>;
    fn store_dynamic(&self, sources: &DynamicSources) -> Result<(), StateStoreError>;
    fn load_hidden(&self) -> Result<HiddenSources, StateStoreError>;
    fn store_hidden(&self, hidden: &HiddenSources) -> Result<(), StateStoreError>;
}

pub fn get_state_store(store_type: &StateStoreType) -> Arc<dyn StateStore> {
    match store_type {
        StateStoreType::Filesystem { base_dir } => Arc::new(FilesystemStateStore::new(base_dir)),
        StateStoreType::Memory => {
            tracing::warn!("Registry state is kept in memory and will be lost on restart");
            Arc::new(MemoryStateStore::default())
        }
    }
}

pub struct FilesystemStateStore {
    base_dir: PathBuf,
}

impl FilesystemStateStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        FilesystemStateStore {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn read<T: DeserializeOwned + Default>(&self, filename: &str) -> Result<T, StateStoreError> {
        let path = self.base_dir.join(filename);
        let file = match File::open(&path) {
            Ok(file) => file,
            // Nothing persisted yet.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Writes to a sibling temp file and renames it into place.
    fn write<T: Serialize>(&self, filename: &str, value: &T) -> Result<(), StateStoreError> {
        fs::create_dir_all(&self.base_dir)?;
        let path = self.base_dir.join(filename);
        let tmp_path = self.base_dir.join(format!(".{filename}.tmp"));

        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&tmp_path, &path)?;
        tracing::debug!(path = %path.display(), "Persisted registry state");
        Ok(())
    }
}

impl StateStore for FilesystemStateStore {
    fn load_dynamic(&self) -> Result<DynamicSources, StateStoreError> {
        self.read(DYNAMIC_FILENAME)
    }

    fn store_dynamic(&self, sources: &DynamicSources) -> Result<(), StateStoreError> {
        self.write(DYNAMIC_FILENAME, sources)
    }

    fn load_hidden(&self) -> Result<HiddenSources, StateStoreError> {
        self.read(HIDDEN_FILENAME)
    }

    fn store_hidden(&self, hidden: &HiddenSources) -> Result<(), StateStoreError> {
        self.write(HIDDEN_FILENAME, hidden)
    }
}

/// Process-local store. Counts writes so callers can check that a rejected
/// mutation never reached storage.
#[derive(Default)]
pub struct MemoryStateStore {
    dynamic: Mutex<DynamicSources>,
    hidden: Mutex<HiddenSources>,
    writes: AtomicUsize,
}

impl MemoryStateStore {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl StateStore for MemoryStateStore {
    fn load_dynamic(&self) -> Result<DynamicSources, StateStoreError> {
        Ok(self.dynamic.lock().clone())
    }

    fn store_dynamic(&self, sources: &DynamicSources) -> Result<(), StateStoreError> {
        *self.dynamic.lock() = sources.clone();
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn load_hidden(&self) -> Result<HiddenSources, StateStoreError> {
        Ok(self.hidden.lock().clone())
    }

    fn store_hidden(&self, hidden: &HiddenSources) -> Result<(), StateStoreError> {
        *self.hidden.lock() = hidden.clone();
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
