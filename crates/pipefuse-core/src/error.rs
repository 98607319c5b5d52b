//! Error types for pipefuse

use thiserror::Error;

/// Result type alias using the pipefuse [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building, compiling or running a query pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed tree shape detected by the builder (arity, terminal misuse)
    #[error("Construction error: {0}")]
    Construction(String),

    /// Declared and actual element types disagree at construction time
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Type the consumer declared
        expected: String,
        /// Type the producer actually has
        actual: String,
    },

    /// Invalid argument observed while executing a compiled routine
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure raised by a lambda body or host function during execution
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The backend could not lower the tree
    #[error("Compile error: {0}")]
    Compile(String),

    /// The tree uses an operator or type outside the device subset
    #[error("Unsupported for device: {0}")]
    UnsupportedForDevice(String),

    /// Device context or launch failure
    #[error("Device error: {0}")]
    Device(String),

    /// Invalid compiler configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors while loading configuration
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a construction error
    pub fn construction(msg: impl Into<String>) -> Self {
        Error::Construction(msg.into())
    }

    /// Create a type mismatch error
    pub fn type_mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        Error::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create a runtime error
    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime(msg.into())
    }

    /// Create a compile error
    pub fn compile(msg: impl Into<String>) -> Self {
        Error::Compile(msg.into())
    }

    /// Create an unsupported-for-device error
    pub fn unsupported_for_device(msg: impl Into<String>) -> Self {
        Error::UnsupportedForDevice(msg.into())
    }

    /// Create a device error
    pub fn device(msg: impl Into<String>) -> Self {
        Error::Device(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// True for errors raised by the builder before anything is compiled
    pub fn is_construction(&self) -> bool {
        matches!(self, Error::Construction(_) | Error::TypeMismatch { .. })
    }

    /// True for deferred argument validation failures
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }

    /// True when the device backend rejected the tree
    pub fn is_unsupported_for_device(&self) -> bool {
        matches!(self, Error::UnsupportedForDevice(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::invalid_argument("count is negative");
        assert_eq!(err.to_string(), "Invalid argument: count is negative");

        let err = Error::type_mismatch("int", "string");
        assert_eq!(err.to_string(), "Type mismatch: expected int, got string");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::construction("x").is_construction());
        assert!(Error::type_mismatch("a", "b").is_construction());
        assert!(!Error::runtime("x").is_construction());
        assert!(Error::invalid_argument("x").is_invalid_argument());
        assert!(Error::unsupported_for_device("x").is_unsupported_for_device());
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Json(_)));
    }
}
