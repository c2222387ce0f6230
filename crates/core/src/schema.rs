//! Declarative per-slice type definitions.
//!
//! A schema is supplied once when a state manager is built and never changes
//! afterwards. Every slice maps path names to a [`PathSchema`] describing the
//! kind of value stored there.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{StateError, StateResult};

/// Name of the implicit bookkeeping slice present in every schema.
pub const CONTROL_SLICE: &str = "_control";
/// COUNTER incremented once per dispatch.
pub const CHANGE_COUNT: &str = "change_count";
/// COUNTER holding the sequence of the last applied record.
pub const LOG_SEQUENCE: &str = "log_sequence";

/// Kind of value stored at a path.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValueKind {
    Hash,
    List,
    Counter,
}

impl core::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ValueKind::Hash => "HASH",
            ValueKind::List => "LIST",
            ValueKind::Counter => "COUNTER",
        };
        f.write_str(name)
    }
}

/// Human-readable identifier assigned to LIST documents on ADD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifierFormat {
    pub prefix: String,
    pub zero_padding: usize,
}

impl IdentifierFormat {
    pub fn new(prefix: impl Into<String>, zero_padding: usize) -> Self {
        Self {
            prefix: prefix.into(),
            zero_padding,
        }
    }

    /// `prefix` followed by `id` left-padded with zeros to `zero_padding` digits.
    pub fn format(&self, id: u64) -> String {
        format!("{}{:0width$}", self.prefix, id, width = self.zero_padding)
    }
}

/// Declaration of one path inside a slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSchema {
    #[serde(rename = "type")]
    pub kind: ValueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier_format: Option<IdentifierFormat>,
    /// Initial HASH contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Map<String, JsonValue>>,
}

impl PathSchema {
    pub fn hash() -> Self {
        Self {
            kind: ValueKind::Hash,
            identifier_format: None,
            values: None,
        }
    }

    pub fn hash_with(values: Map<String, JsonValue>) -> Self {
        Self {
            values: Some(values),
            ..Self::hash()
        }
    }

    pub fn list() -> Self {
        Self {
            kind: ValueKind::List,
            identifier_format: None,
            values: None,
        }
    }

    pub fn list_with_identifier(prefix: impl Into<String>, zero_padding: usize) -> Self {
        Self {
            identifier_format: Some(IdentifierFormat::new(prefix, zero_padding)),
            ..Self::list()
        }
    }

    pub fn counter() -> Self {
        Self {
            kind: ValueKind::Counter,
            identifier_format: None,
            values: None,
        }
    }
}

/// Paths of a single slice.
pub type SliceSchema = BTreeMap<String, PathSchema>;

/// Mapping slice → path → declaration.
///
/// Construction validates the declarations and adds the `_control` slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, SliceSchema>", into = "BTreeMap<String, SliceSchema>")]
pub struct SchemaDefinition {
    slices: BTreeMap<String, SliceSchema>,
}

impl SchemaDefinition {
    pub fn new(mut slices: BTreeMap<String, SliceSchema>) -> StateResult<Self> {
        if slices.contains_key(CONTROL_SLICE) {
            // A round-tripped schema already carries the control slice; it must
            // still match the built-in declaration.
            if slices.get(CONTROL_SLICE) != Some(&control_slice()) {
                return Err(StateError::invalid_schema(format!(
                    "slice '{CONTROL_SLICE}' is reserved"
                )));
            }
        }

        for (slice, paths) in &slices {
            for (path, decl) in paths {
                if decl.identifier_format.is_some() && decl.kind != ValueKind::List {
                    return Err(StateError::invalid_schema(format!(
                        "'{slice}.{path}': identifierFormat is only valid on LIST"
                    )));
                }
                if decl.values.is_some() && decl.kind != ValueKind::Hash {
                    return Err(StateError::invalid_schema(format!(
                        "'{slice}.{path}': values is only valid on HASH"
                    )));
                }
            }
        }

        slices.insert(CONTROL_SLICE.to_string(), control_slice());
        Ok(Self { slices })
    }

    /// Start an empty builder.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn slices(&self) -> impl Iterator<Item = (&str, &SliceSchema)> {
        self.slices.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn slice(&self, slice: &str) -> StateResult<&SliceSchema> {
        self.slices
            .get(slice)
            .ok_or_else(|| StateError::UnknownSlice(slice.to_string()))
    }

    pub fn path(&self, slice: &str, path: &str) -> StateResult<&PathSchema> {
        self.slice(slice)?
            .get(path)
            .ok_or_else(|| StateError::UnknownPath {
                slice: slice.to_string(),
                path: path.to_string(),
            })
    }
}

impl TryFrom<BTreeMap<String, SliceSchema>> for SchemaDefinition {
    type Error = StateError;

    fn try_from(value: BTreeMap<String, SliceSchema>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SchemaDefinition> for BTreeMap<String, SliceSchema> {
    fn from(value: SchemaDefinition) -> Self {
        value.slices
    }
}

fn control_slice() -> SliceSchema {
    let mut paths = SliceSchema::new();
    paths.insert(CHANGE_COUNT.to_string(), PathSchema::counter());
    paths.insert(LOG_SEQUENCE.to_string(), PathSchema::counter());
    paths
}

/// Fluent construction of a [`SchemaDefinition`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    slices: BTreeMap<String, SliceSchema>,
}

impl SchemaBuilder {
    pub fn path(mut self, slice: &str, path: &str, decl: PathSchema) -> Self {
        self.slices
            .entry(slice.to_string())
            .or_default()
            .insert(path.to_string(), decl);
        self
    }

    pub fn build(self) -> StateResult<SchemaDefinition> {
        SchemaDefinition::new(self.slices)
    }
}
