//! Error types for silo operations.
//!
//! Every failure surfaced by the silo maps onto one of the SCIM error kinds
//! defined in RFC 7644 section 3.12. A kind carries a human-readable detail
//! message; `scim_type()` and `http_status()` expose the wire-level values a
//! protocol layer needs to render the error.

/// Main error type for all silo operations.
///
/// Each variant corresponds to one SCIM error kind. Errors raised inside a
/// write transaction abort it; nothing is ever partially committed.
#[derive(Debug, thiserror::Error)]
pub enum ScimError {
    /// Malformed JSON, path or filter text.
    #[error("Invalid syntax: {message}")]
    InvalidSyntax { message: String },

    /// A path that does not resolve against the schema.
    #[error("Invalid path: {message}")]
    InvalidPath { message: String },

    /// A value that fails schema typing, multiple primary flags, or a missing
    /// required attribute.
    #[error("Invalid value: {message}")]
    InvalidValue { message: String },

    /// A write to a readOnly or immutable attribute.
    #[error("Mutability violation: {message}")]
    Mutability { message: String },

    /// A duplicate value on a unique attribute.
    #[error("Uniqueness violation: {message}")]
    Uniqueness { message: String },

    /// A value selector that matched no entry on add/replace/remove.
    #[error("No target: {message}")]
    NoTarget { message: String },

    /// Resource id absent.
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Authentication failure.
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// Codec or storage-layer failure.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ScimError {
    pub fn invalid_syntax(message: impl Into<String>) -> Self {
        Self::InvalidSyntax {
            message: message.into(),
        }
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::InvalidPath {
            message: message.into(),
        }
    }

    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::InvalidValue {
            message: message.into(),
        }
    }

    pub fn mutability(message: impl Into<String>) -> Self {
        Self::Mutability {
            message: message.into(),
        }
    }

    pub fn uniqueness(message: impl Into<String>) -> Self {
        Self::Uniqueness {
            message: message.into(),
        }
    }

    pub fn no_target(message: impl Into<String>) -> Self {
        Self::NoTarget {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The SCIM `scimType` string for this error.
    pub fn scim_type(&self) -> &'static str {
        match self {
            Self::InvalidSyntax { .. } => "invalidSyntax",
            Self::InvalidPath { .. } => "invalidPath",
            Self::InvalidValue { .. } => "invalidValue",
            Self::Mutability { .. } => "mutability",
            Self::Uniqueness { .. } => "uniqueness",
            Self::NoTarget { .. } => "noTarget",
            Self::NotFound { .. } => "notFound",
            Self::Forbidden { .. } => "forbidden",
            Self::Internal { .. } => "internal",
        }
    }

    /// The HTTP status a protocol layer should respond with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidSyntax { .. }
            | Self::InvalidPath { .. }
            | Self::InvalidValue { .. }
            | Self::Mutability { .. } => 400,
            Self::Uniqueness { .. } => 409,
            Self::NoTarget { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Forbidden { .. } => 403,
            Self::Internal { .. } => 500,
        }
    }
}

impl From<redb::DatabaseError> for ScimError {
    fn from(e: redb::DatabaseError) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<redb::TransactionError> for ScimError {
    fn from(e: redb::TransactionError) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<redb::TableError> for ScimError {
    fn from(e: redb::TableError) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<redb::StorageError> for ScimError {
    fn from(e: redb::StorageError) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<redb::CommitError> for ScimError {
    fn from(e: redb::CommitError) -> Self {
        Self::internal(e.to_string())
    }
}

/// Result type alias used throughout the crate.
pub type ScimResult<T> = Result<T, ScimError>;
