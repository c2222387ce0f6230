//! Apply-engine error model.

use thiserror::Error;

use crate::schema::ValueKind;
use crate::update::Method;

/// Result type used by the apply engine and schema validation.
pub type StateResult<T> = Result<T, StateError>;

/// Schema or assertion violation raised while validating or applying updates.
///
/// These are programmer errors: reducers emitted an update the schema does not
/// allow. They abort the whole dispatch; nothing from the batch is committed.
/// Business-rule failures are never reported through this type, they travel
/// as data in `ReducerInfo`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The slice is not declared in the schema.
    #[error("unknown slice '{0}'")]
    UnknownSlice(String),

    /// The path is not declared under the slice.
    #[error("unknown path '{slice}.{path}'")]
    UnknownPath { slice: String, path: String },

    /// The method cannot be used on the declared kind (e.g. INC on a LIST).
    #[error("{method} is not valid on {kind} path '{slice}.{path}'")]
    MethodNotAllowed {
        method: Method,
        kind: ValueKind,
        slice: String,
        path: String,
    },

    /// A LIST operation needed `filter.id` but it was missing.
    #[error("'{slice}.{path}': {method} requires filter.id")]
    MissingFilter {
        method: Method,
        slice: String,
        path: String,
    },

    /// ADD was given a document that already carries an `id`.
    #[error("'{slice}.{path}': ADD must not supply an id")]
    CallerSuppliedId { slice: String, path: String },

    /// The targeted document does not exist.
    #[error("'{slice}.{path}': no document with id {id:?}")]
    MissingDocument {
        slice: String,
        path: String,
        id: Option<u64>,
    },

    /// The update payload has the wrong shape.
    #[error("'{slice}.{path}': invalid document: {reason}")]
    InvalidDocument {
        slice: String,
        path: String,
        reason: String,
    },

    /// The schema definition itself is inconsistent.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// An identifier failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl StateError {
    pub fn invalid_document(
        slice: impl Into<String>,
        path: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidDocument {
            slice: slice.into(),
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_schema(msg: impl Into<String>) -> Self {
        Self::InvalidSchema(msg.into())
    }
}
