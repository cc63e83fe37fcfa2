use crate::state_store::{DynamicSources, HiddenSources, StateStore, StateStoreError};
use crate::types::{DisplayMetadata, SourceDescriptor, SourceLocation};
use indexmap::IndexMap;
use parking_lot::RwLock;
use shared::time::now_millis;
use std::collections::BTreeSet;
use std::sync::Arc;

const MAX_NAME_LEN: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("source {0:?} is builtin and cannot be modified")]
    Conflict(String),

    #[error("source {0:?} not found")]
    NotFound(String),

    #[error("invalid source name {0:?}: use 1-64 characters from [A-Za-z0-9_-]")]
    InvalidName(String),

    #[error("could not persist registry state: {0}")]
    Persist(#[from] StateStoreError),

    #[error("registry update did not complete: {0}")]
    Interrupted(#[from] tokio::task::JoinError),
}

/// Names double as URL path segments.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

struct RegistryState {
    builtin: IndexMap<String, SourceDescriptor>,
    dynamic: IndexMap<String, SourceDescriptor>,
    hidden: BTreeSet<String>,
}

impl RegistryState {
    fn contains(&self, name: &str) -> bool {
        self.builtin.contains_key(name) || self.dynamic.contains_key(name)
    }

    fn dynamic_record(&self) -> DynamicSources {
        DynamicSources {
            sources: self.dynamic.values().cloned().collect(),
            updated_at: now_millis(),
        }
    }

    fn hidden_record(&self) -> HiddenSources {
        HiddenSources {
            hidden: self.hidden.iter().cloned().collect(),
            updated_at: now_millis(),
        }
    }
}

/// The merged namespace of builtin and runtime-registered sources, plus the set
/// of names hidden from navigation. Every mutation is persisted before it is
/// made visible.
pub struct Registry {
    state: RwLock<RegistryState>,
    store: Arc<dyn StateStore>,
}

impl Registry {
    /// Merges the builtin sources with whatever was persisted. Persisted dynamic
    /// sources that now collide with a builtin are dropped, and hidden names that
    /// no longer resolve are pruned.
    pub fn load(
        builtins: Vec<SourceDescriptor>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, RegistryError> {
        let builtin: IndexMap<String, SourceDescriptor> = builtins
            .into_iter()
            .map(|source| (source.name.clone(), source))
            .collect();

        let mut dynamic = IndexMap::new();
        for source in store.load_dynamic()?.sources {
            if builtin.contains_key(&source.name) {
                tracing::warn!(
                    source = %source.name,
                    "Ignoring persisted dynamic source shadowed by a builtin"
                );
                continue;
            }
            dynamic.insert(source.name.clone(), source);
        }

        let mut state = RegistryState {
            builtin,
            dynamic,
            hidden: BTreeSet::new(),
        };

        let persisted_hidden = store.load_hidden()?.hidden;
        let persisted_len = persisted_hidden.len();
        let hidden: BTreeSet<String> = persisted_hidden
            .into_iter()
            .filter(|name| state.contains(name))
            .collect();
        state.hidden = hidden;

        if state.hidden.len() != persisted_len {
            tracing::info!(
                pruned = persisted_len - state.hidden.len(),
                "Pruned hidden entries for sources that no longer exist"
            );
            store.store_hidden(&state.hidden_record())?;
        }

        tracing::info!(
            builtin = state.builtin.len(),
            dynamic = state.dynamic.len(),
            hidden = state.hidden.len(),
            "Loaded source registry"
        );

        Ok(Registry {
            state: RwLock::new(state),
            store,
        })
    }

    pub fn resolve(&self, name: &str) -> Option<SourceDescriptor> {
        let state = self.state.read();
        state
            .builtin
            .get(name)
            .or_else(|| state.dynamic.get(name))
            .cloned()
    }

    /// Builtin sources first, each group in registration order.
    pub fn list_all(&self) -> Vec<SourceDescriptor> {
        let state = self.state.read();
        state
            .builtin
            .values()
            .chain(state.dynamic.values())
            .cloned()
            .collect()
    }

    pub fn list_dynamic(&self) -> Vec<SourceDescriptor> {
        self.state.read().dynamic.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let state = self.state.read();
        state.builtin.len() + state.dynamic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers or replaces a dynamic source. Replacing keeps the original
    /// creation time.
    pub fn register(
        &self,
        name: &str,
        location: SourceLocation,
        mut metadata: DisplayMetadata,
    ) -> Result<SourceDescriptor, RegistryError> {
        if !is_valid_name(name) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }

        let mut state = self.state.write();
        if state.builtin.contains_key(name) {
            return Err(RegistryError::Conflict(name.to_string()));
        }

        metadata.created_at = state
            .dynamic
            .get(name)
            .and_then(|existing| existing.metadata.as_ref())
            .map(|existing| existing.created_at)
            .unwrap_or_else(now_millis);

        let descriptor = SourceDescriptor::dynamic(name, location, metadata);

        let mut record = state.dynamic_record();
        match record.sources.iter_mut().find(|s| s.name == name) {
            Some(existing) => *existing = descriptor.clone(),
            None => record.sources.push(descriptor.clone()),
        }
        self.store.store_dynamic(&record)?;

        state.dynamic.insert(name.to_string(), descriptor.clone());
        Ok(descriptor)
    }

    /// Removes a dynamic source and any hidden flag it carried.
    pub fn remove(&self, name: &str) -> Result<SourceDescriptor, RegistryError> {
        let mut state = self.state.write();
        if state.builtin.contains_key(name) {
            return Err(RegistryError::Conflict(name.to_string()));
        }
        if !state.dynamic.contains_key(name) {
            return Err(RegistryError::NotFound(name.to_string()));
        }

        let mut record = state.dynamic_record();
        record.sources.retain(|s| s.name != name);
        self.store.store_dynamic(&record)?;

        let removed = state
            .dynamic
            .shift_remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        if state.hidden.remove(name) {
            self.store.store_hidden(&state.hidden_record())?;
        }

        Ok(removed)
    }

    /// Returns whether the hidden set changed.
    pub fn hide(&self, name: &str) -> Result<bool, RegistryError> {
        let mut state = self.state.write();
        if !state.contains(name) {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        if state.hidden.contains(name) {
            return Ok(false);
        }

        let mut record = state.hidden_record();
        record.hidden.push(name.to_string());
        record.hidden.sort();
        self.store.store_hidden(&record)?;

        state.hidden.insert(name.to_string());
        Ok(true)
    }

    /// Returns whether the hidden set changed. Unhiding an unknown name is a no-op.
    pub fn unhide(&self, name: &str) -> Result<bool, RegistryError> {
        let mut state = self.state.write();
        if !state.hidden.contains(name) {
            return Ok(false);
        }

        let mut record = state.hidden_record();
        record.hidden.retain(|n| n != name);
        self.store.store_hidden(&record)?;

        state.hidden.remove(name);
        Ok(true)
    }

    pub fn is_hidden(&self, name: &str) -> bool {
        self.state.read().hidden.contains(name)
    }

    pub fn hidden(&self) -> Vec<String> {
        self.state.read().hidden.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::{FilesystemStateStore, MemoryStateStore};

    fn sheet(id: &str) -> SourceLocation {
        SourceLocation::Sheet {
            spreadsheet_id: id.into(),
            tab: "Sheet1".into(),
        }
    }

    fn builtins() -> Vec<SourceDescriptor> {
        vec![
            SourceDescriptor::builtin("sponsored", sheet("s1")),
            SourceDescriptor::builtin(
                "about",
                SourceLocation::Document {
                    url: "http://docs/about".into(),
                },
            ),
        ]
    }

    fn label(label: &str) -> DisplayMetadata {
        DisplayMetadata {
            label: Some(label.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_and_list() {
        let store = Arc::new(MemoryStateStore::default());
        let registry = Registry::load(builtins(), store).unwrap();
        registry
            .register("grants2026", sheet("g"), label("Grants"))
            .unwrap();

        assert!(registry.resolve("sponsored").unwrap().is_builtin());
        assert!(!registry.resolve("grants2026").unwrap().is_builtin());
        assert!(registry.resolve("missing").is_none());

        let names: Vec<_> = registry.list_all().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["sponsored", "about", "grants2026"]);
        assert_eq!(registry.list_dynamic().len(), 1);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_register_builtin_name_conflicts() {
        let store = Arc::new(MemoryStateStore::default());
        let registry = Registry::load(builtins(), store.clone()).unwrap();

        let result = registry.register("sponsored", sheet("other"), label("x"));
        assert!(matches!(result, Err(RegistryError::Conflict(_))));

        // Nothing reached storage and the builtin is untouched
        assert_eq!(store.writes(), 0);
        assert_eq!(
            registry.resolve("sponsored").unwrap().location,
            sheet("s1")
        );
    }

    #[test]
    fn test_register_invalid_name() {
        let store = Arc::new(MemoryStateStore::default());
        let registry = Registry::load(vec![], store.clone()).unwrap();
        let too_long = "x".repeat(65);
        for name in ["", "a/b", "with space", too_long.as_str()] {
            assert!(matches!(
                registry.register(name, sheet("g"), DisplayMetadata::default()),
                Err(RegistryError::InvalidName(_))
            ));
        }
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn test_reregister_keeps_created_at() {
        let store = Arc::new(MemoryStateStore::default());
        let registry = Registry::load(vec![], store.clone()).unwrap();

        let first = registry.register("g", sheet("a"), label("A")).unwrap();
        let second = registry.register("g", sheet("b"), label("B")).unwrap();

        let created = |s: &SourceDescriptor| s.metadata.as_ref().unwrap().created_at;
        assert_eq!(created(&first), created(&second));
        assert_eq!(registry.resolve("g").unwrap().location, sheet("b"));
        assert_eq!(store.load_dynamic().unwrap().sources.len(), 1);
    }

    #[test]
    fn test_remove() {
        let store = Arc::new(MemoryStateStore::default());
        let registry = Registry::load(builtins(), store.clone()).unwrap();
        registry.register("g", sheet("a"), label("A")).unwrap();
        registry.hide("g").unwrap();

        assert!(matches!(
            registry.remove("sponsored"),
            Err(RegistryError::Conflict(_))
        ));
        assert!(matches!(
            registry.remove("nope"),
            Err(RegistryError::NotFound(_))
        ));

        registry.remove("g").unwrap();
        assert!(registry.resolve("g").is_none());
        assert!(!registry.is_hidden("g"));
        assert!(store.load_dynamic().unwrap().sources.is_empty());
        assert!(store.load_hidden().unwrap().hidden.is_empty());
    }

    #[test]
    fn test_hide_unhide() {
        let store = Arc::new(MemoryStateStore::default());
        let registry = Registry::load(builtins(), store.clone()).unwrap();

        assert!(registry.hide("sponsored").unwrap());
        assert!(!registry.hide("sponsored").unwrap());
        assert!(registry.is_hidden("sponsored"));
        assert_eq!(store.load_hidden().unwrap().hidden, vec!["sponsored"]);

        assert!(matches!(
            registry.hide("missing"),
            Err(RegistryError::NotFound(_))
        ));

        assert!(registry.unhide("sponsored").unwrap());
        assert!(!registry.unhide("sponsored").unwrap());
        assert!(!registry.unhide("missing").unwrap());
        assert!(registry.hidden().is_empty());
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        let registry =
            Registry::load(builtins(), Arc::new(FilesystemStateStore::new(dir.path()))).unwrap();
        registry.register("g", sheet("a"), label("A")).unwrap();
        registry.hide("g").unwrap();
        registry.hide("about").unwrap();
        drop(registry);

        let registry =
            Registry::load(builtins(), Arc::new(FilesystemStateStore::new(dir.path()))).unwrap();
        assert_eq!(registry.resolve("g").unwrap().location, sheet("a"));
        assert_eq!(registry.hidden(), vec!["about", "g"]);
    }

    #[test]
    fn test_load_prunes_and_drops_shadowed() {
        let store = Arc::new(MemoryStateStore::default());
        store
            .store_dynamic(&DynamicSources {
                sources: vec![
                    SourceDescriptor::dynamic("sponsored", sheet("shadow"), label("x")),
                    SourceDescriptor::dynamic("g", sheet("a"), label("A")),
                ],
                updated_at: 1,
            })
            .unwrap();
        store
            .store_hidden(&HiddenSources {
                hidden: vec!["g".into(), "deleted".into()],
                updated_at: 1,
            })
            .unwrap();

        let registry = Registry::load(builtins(), store.clone()).unwrap();
        assert_eq!(registry.resolve("sponsored").unwrap().location, sheet("s1"));
        assert_eq!(registry.list_dynamic().len(), 1);
        assert_eq!(registry.hidden(), vec!["g"]);
        assert_eq!(store.load_hidden().unwrap().hidden, vec!["g"]);
    }
}
