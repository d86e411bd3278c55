//! Error types for data parsing in caremon-types.

use thiserror::Error;

/// Errors that can occur when parsing caremon data model values.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    /// Unknown metric type name.
    #[error("Unknown metric type: {0}")]
    UnknownMetricType(String),

    /// Unknown HTTP method name.
    #[error("Unknown HTTP method: {0}")]
    UnknownMethod(String),

    /// Quality score outside of [0, 1] or not a number.
    #[error("Quality score {0} is outside [0, 1]")]
    QualityOutOfRange(f32),

    /// Payload could not be interpreted.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias using caremon-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
