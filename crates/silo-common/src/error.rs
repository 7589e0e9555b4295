//! Common error types for the silo ecosystem.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`SiloError`].
pub type SiloResult<T> = Result<T, SiloError>;

/// Common errors across the silo ecosystem.
///
/// Every client-facing operation surfaces exactly one of these kinds
/// together with a human-readable message.
#[derive(Error, Diagnostic, Debug)]
pub enum SiloError {
    /// A value failed validation (bad path, bad size, bad bool).
    #[error("Invalid value: {message}")]
    #[diagnostic(code(silo::invalid_value))]
    InvalidValue {
        /// What was wrong with the value.
        message: String,
    },

    /// A property name is unknown or cannot be written.
    #[error("Invalid property: {message}")]
    #[diagnostic(code(silo::invalid_property))]
    InvalidProperty {
        /// The offending property and why it was rejected.
        message: String,
    },

    /// Caller lacks privilege for the operation.
    #[error("Permission denied: {message}")]
    #[diagnostic(code(silo::permission))]
    Permission {
        /// The operation that was denied.
        message: String,
    },

    /// The selected backend or platform cannot do this.
    #[error("Not supported: {message}")]
    #[diagnostic(code(silo::not_supported))]
    NotSupported {
        /// The unsupported feature.
        message: String,
    },

    /// Space or inode guarantee cannot be honored.
    #[error("No space: {message}")]
    #[diagnostic(code(silo::no_space))]
    NoSpace {
        /// Accounting details for the failed guarantee.
        message: String,
    },

    /// A finite resource (loop device, fallocate reservation) ran out.
    #[error("Resource not available: {message}")]
    #[diagnostic(code(silo::resource_not_available))]
    ResourceNotAvailable {
        /// Which resource ran out.
        message: String,
    },

    /// A referenced layer does not exist.
    #[error("Layer not found: {name}")]
    #[diagnostic(code(silo::layer_not_found))]
    LayerNotFound {
        /// The missing layer.
        name: String,
    },

    /// A volume is already registered at this path.
    #[error("Volume already exists: {path}")]
    #[diagnostic(code(silo::volume_already_exists))]
    VolumeAlreadyExists {
        /// The conflicting path.
        path: String,
    },

    /// The object is in use and cannot be changed right now.
    #[error("Busy: {message}")]
    #[diagnostic(code(silo::busy))]
    Busy {
        /// What is holding the object.
        message: String,
    },

    /// I/O or syscall error, errno preserved.
    #[error("I/O error: {0}")]
    #[diagnostic(code(silo::io))]
    Io(#[from] std::io::Error),

    /// Record (de)serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(silo::serialization))]
    Serialization(String),

    /// Anything else.
    #[error("Unknown error: {message}")]
    #[diagnostic(code(silo::unknown))]
    Unknown {
        /// The error message.
        message: String,
    },
}

impl From<serde_json::Error> for SiloError {
    fn from(err: serde_json::Error) -> Self {
        SiloError::Serialization(err.to_string())
    }
}

impl SiloError {
    /// The errno carried by an I/O error, if any.
    #[must_use]
    pub fn errno(&self) -> Option<i32> {
        match self {
            SiloError::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SiloError::LayerNotFound {
            name: "ubuntu-base".to_string(),
        };
        assert_eq!(err.to_string(), "Layer not found: ubuntu-base");
    }

    #[test]
    fn error_from_io_keeps_errno() {
        let io_err = std::io::Error::from_raw_os_error(28);
        let err: SiloError = io_err.into();
        assert_eq!(err.errno(), Some(28));
        assert!(matches!(err, SiloError::Io(_)));
    }
}
