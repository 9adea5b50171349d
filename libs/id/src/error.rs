//! Error types for id parsing.

use thiserror::Error;

/// Errors that can occur when parsing a typed id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The id string is empty.
    #[error("id cannot be empty")]
    Empty,

    /// The id is missing the underscore separator.
    #[error("id missing underscore separator")]
    MissingSeparator,

    /// The id has the wrong prefix for this type.
    #[error("invalid id prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ULID portion of the id is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}
