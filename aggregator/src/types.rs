use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One decoded record. Column order follows the upstream header row.
pub type Row = IndexMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Sheet,
    Csv,
    Document,
}

impl SourceKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Sheet => "sheet",
            SourceKind::Csv => "csv",
            SourceKind::Document => "document",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a source lives upstream and how its body is decoded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum SourceLocation {
    Sheet {
        spreadsheet_id: String,
        tab: String,
    },
    Csv {
        url: String,
        #[serde(default)]
        sanitize_headers: bool,
        #[serde(default)]
        raw_number: bool,
    },
    Document {
        url: String,
    },
}

impl SourceLocation {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceLocation::Sheet { .. } => SourceKind::Sheet,
            SourceLocation::Csv { .. } => SourceKind::Csv,
            SourceLocation::Document { .. } => SourceKind::Document,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Builtin,
    Dynamic,
}

/// Navigation metadata carried by runtime-registered sources.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMetadata {
    pub label: Option<String>,
    pub category: Option<String>,
    pub route: Option<String>,
    pub edit_url: Option<String>,
    /// Unix milliseconds.
    #[serde(default)]
    pub created_at: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub location: SourceLocation,
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DisplayMetadata>,
}

impl SourceDescriptor {
    pub fn builtin<N: Into<String>>(name: N, location: SourceLocation) -> Self {
        SourceDescriptor {
            name: name.into(),
            location,
            origin: Origin::Builtin,
            metadata: None,
        }
    }

    pub fn dynamic<N: Into<String>>(
        name: N,
        location: SourceLocation,
        metadata: DisplayMetadata,
    ) -> Self {
        SourceDescriptor {
            name: name.into(),
            location,
            origin: Origin::Dynamic,
            metadata: Some(metadata),
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.location.kind()
    }

    pub fn is_builtin(&self) -> bool {
        self.origin == Origin::Builtin
    }
}

/// Decoded upstream body. Serialized untagged so clients see a plain array,
/// a `{count}` object or a string.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Rows(Vec<Row>),
    Scalar { count: Option<f64> },
    Markup(String),
}

impl Payload {
    /// The placeholder recorded when a source has never been fetched successfully.
    pub fn empty_for(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Sheet | SourceKind::Csv => Payload::Rows(Vec::new()),
            SourceKind::Document => Payload::Markup(String::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Rows(rows) => rows.is_empty(),
            Payload::Scalar { count } => count.is_none(),
            Payload::Markup(markup) => markup.is_empty(),
        }
    }

    /// Number of records, as reported by the health and refresh endpoints.
    pub fn record_count(&self) -> usize {
        match self {
            Payload::Rows(rows) => rows.len(),
            Payload::Scalar { count } => usize::from(count.is_some()),
            Payload::Markup(markup) => usize::from(!markup.is_empty()),
        }
    }
}
