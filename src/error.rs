//! Error types and handling for Seurat

use std::time::Duration;

/// Result type alias for Seurat operations
pub type Result<T> = std::result::Result<T, SeuratError>;

/// Coarse classification of every error, exposed to callers that only need
/// to pick a retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// OS memory, file or slot limits were hit
    ResourceExhausted,
    /// Schema, type or layout version mismatch
    Incompatible,
    /// Pool is full and the policy is non-blocking
    NoSpace,
    /// A bounded wait exceeded its deadline
    Timeout,
    /// The handle was torn down while the caller was suspended
    Cancelled,
    /// Segment metadata invariant violated
    Corrupted,
    /// Invalid parameters or configuration
    InvalidParameter,
    /// Other I/O or platform failure
    Io,
}

/// Error type for the shared memory publish/subscribe core
#[derive(Debug, thiserror::Error)]
pub enum SeuratError {
    /// I/O related errors (file operations, mmap, etc.)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// OS-level shared memory or endpoint slots could not be allocated
    #[error("Resource exhausted: {resource} - {message}")]
    ResourceExhausted { resource: String, message: String },

    /// Existing segment does not match the requester
    #[error("Incompatible segment {segment}: {message}")]
    Incompatible { segment: String, message: String },

    /// The sample pool has no free slot
    #[error("No space: pool of {capacity} slots exhausted")]
    NoSpace { capacity: usize },

    /// Blocking operation exceeded its deadline
    #[error("Timeout: {operation} did not complete within {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// Handle destroyed while the caller was suspended
    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    /// Segment metadata invariant violated
    #[error("Corrupted segment: {message}")]
    Corrupted { message: String },

    /// Invalid parameters or configuration
    #[error("Invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Platform-specific errors
    #[error("Platform error: {message}")]
    Platform { message: String },
}

impl SeuratError {
    /// Create an I/O error from a standard I/O error, classifying OS
    /// out-of-resource conditions as `ResourceExhausted`
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        if is_exhaustion(&source) {
            return Self::ResourceExhausted {
                resource: "shared memory".to_string(),
                message: format!("{}: {}", context, source),
            };
        }
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create an incompatible segment error
    pub fn incompatible(segment: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Incompatible {
            segment: segment.into(),
            message: message.into(),
        }
    }

    /// Create a pool exhausted error
    pub fn no_space(capacity: usize) -> Self {
        Self::NoSpace { capacity }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create a cancelled error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a corrupted segment error
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a platform error
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }

    /// Tagged classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::Platform { .. } => ErrorKind::Io,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Incompatible { .. } => ErrorKind::Incompatible,
            Self::NoSpace { .. } => ErrorKind::NoSpace,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Corrupted { .. } | Self::Serialization { .. } => ErrorKind::Corrupted,
            Self::InvalidParameter { .. } => ErrorKind::InvalidParameter,
        }
    }

    /// Whether the error is an expected steady-state condition the caller's
    /// policy should handle (`NoSpace`, `Timeout`)
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::NoSpace | ErrorKind::Timeout)
    }
}

fn is_exhaustion(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOSPC) | Some(libc::ENOMEM) | Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::EFBIG)
    )
}

// Convert from common error types
impl From<std::io::Error> for SeuratError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

impl From<bincode::Error> for SeuratError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization(format!("Bincode error: {}", err))
    }
}
