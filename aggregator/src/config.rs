use crate::types::{SourceDescriptor, SourceLocation};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SHEET_MIRRORS: &[&str] = &[
    "https://opensheet.elk.sh/{spreadsheet_id}/{tab}",
    "https://opensheet.vercel.app/{spreadsheet_id}/{tab}",
];

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Duplicate builtin source name: {0}")]
    DuplicateSource(String),

    #[error("Invalid builtin source name: {0:?}")]
    InvalidSourceName(String),

    #[error("At least one sheet mirror is required")]
    NoSheetMirrors,

    #[error("Sheet mirror {0:?} must contain {{spreadsheet_id}} and {{tab}}")]
    InvalidSheetMirror(String),

    #[error("{0} must be greater than 0")]
    Zero(&'static str),
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StateStoreType {
    Filesystem { base_dir: String },
    Memory,
}

impl Default for StateStoreType {
    fn default() -> Self {
        StateStoreType::Filesystem {
            base_dir: "./data".into(),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    /// URL templates with `{spreadsheet_id}` and `{tab}` placeholders, tried in order.
    pub sheet_mirrors: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            timeout_secs: 60,
            sheet_mirrors: DEFAULT_SHEET_MIRRORS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        RefreshConfig {
            interval_secs: 300,
            batch_size: 5,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct AdminConfig {
    /// Hex encoded SHA-256 of the admin password. Takes precedence over `password_env`.
    pub password_sha256: Option<String>,
    /// Environment variable holding the plaintext admin password.
    pub password_env: String,
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        AdminConfig {
            password_sha256: None,
            password_env: "SOURCEHUB_ADMIN_PASSWORD".into(),
            session_ttl_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
        }
    }
}

/// A builtin source as declared in the deployment config.
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct BuiltinSource {
    pub name: String,
    #[serde(flatten)]
    pub location: SourceLocation,
}

impl From<BuiltinSource> for SourceDescriptor {
    fn from(source: BuiltinSource) -> Self {
        SourceDescriptor::builtin(source.name, source.location)
    }
}

#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub state_store: StateStoreType,
    #[serde(default)]
    pub sources: Vec<BuiltinSource>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.listener.port == 0 {
            return Err(ValidationError::InvalidPort);
        }

        if self.fetch.timeout_secs == 0 {
            return Err(ValidationError::Zero("fetch.timeout_secs"));
        }
        if self.refresh.interval_secs == 0 {
            return Err(ValidationError::Zero("refresh.interval_secs"));
        }
        if self.refresh.batch_size == 0 {
            return Err(ValidationError::Zero("refresh.batch_size"));
        }
        if self.admin.session_ttl_secs == 0 {
            return Err(ValidationError::Zero("admin.session_ttl_secs"));
        }
        if self.admin.sweep_interval_secs == 0 {
            return Err(ValidationError::Zero("admin.sweep_interval_secs"));
        }

        if self.fetch.sheet_mirrors.is_empty() {
            return Err(ValidationError::NoSheetMirrors);
        }
        for mirror in &self.fetch.sheet_mirrors {
            if !mirror.contains("{spreadsheet_id}") || !mirror.contains("{tab}") {
                return Err(ValidationError::InvalidSheetMirror(mirror.clone()));
            }
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if !crate::registry::is_valid_name(&source.name) {
                return Err(ValidationError::InvalidSourceName(source.name.clone()));
            }
            if !names.insert(&source.name) {
                return Err(ValidationError::DuplicateSource(source.name.clone()));
            }
        }

        Ok(())
    }

    pub fn builtin_sources(&self) -> Vec<SourceDescriptor> {
        self.sources.iter().cloned().map(Into::into).collect()
    }
}
