//! Error types for the OMAPI transport
//!
//! Two levels are distinguished. [`ServiceError`] classifies what the platform
//! secure element service reported. [`OmapiError`] is what the transport
//! surfaces to the calling framework, and always falls into one of the three
//! [`ErrorKind`]s.

use std::borrow::Cow;

/// Failures reported by the platform secure element service
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Communication with the secure element failed
    #[error("I/O error: {0}")]
    Io(String),

    /// The caller is not allowed to access the secure element or applet
    #[error("Security error: {0}")]
    Security(String),

    /// The requested applet does not exist on the secure element
    #[error("No such element: {0}")]
    NoSuchElement(String),

    /// The service or session is in the wrong state for the call
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The service does not implement the requested operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl ServiceError {
    /// Create an I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io(message.into())
    }

    /// Create a security error
    pub fn security<S: Into<String>>(message: S) -> Self {
        Self::Security(message.into())
    }

    /// Create a not-found error
    pub fn no_such_element<S: Into<String>>(message: S) -> Self {
        Self::NoSuchElement(message.into())
    }

    /// Create an illegal state error
    pub fn illegal_state<S: Into<String>>(message: S) -> Self {
        Self::IllegalState(message.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        Self::Unsupported(message.into())
    }
}

/// Classification of every error the transport reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// I/O failure, access denial or a channel that could not be obtained
    Transport,
    /// The requested application identifier does not exist
    IllegalArgument,
    /// The requested feature is not supported by the negotiated service version
    UnsupportedFeature,
}

/// Errors surfaced by readers and the plugin
#[derive(Debug, thiserror::Error)]
pub enum OmapiError {
    /// Transport level failure
    #[error("{message}")]
    Transport {
        /// Description of the failed operation
        message: Cow<'static, str>,
        /// Underlying service error, if any
        #[source]
        source: Option<ServiceError>,
    },

    /// The application identifier is not present on the secure element
    #[error("{message}")]
    IllegalArgument {
        /// Description including the hex encoded AID
        message: String,
        /// Underlying service error
        #[source]
        source: Option<ServiceError>,
    },

    /// The feature is not available with the negotiated service version
    #[error("{0}")]
    UnsupportedFeature(String),
}

impl OmapiError {
    /// Create a transport error without an underlying cause
    pub fn transport<S: Into<Cow<'static, str>>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error caused by a service error
    pub fn transport_caused_by<S: Into<Cow<'static, str>>>(
        message: S,
        source: ServiceError,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create an illegal argument error
    pub fn illegal_argument<S: Into<String>>(message: S, source: Option<ServiceError>) -> Self {
        Self::IllegalArgument {
            message: message.into(),
            source,
        }
    }

    /// Create an unsupported feature error
    pub fn unsupported_feature<S: Into<String>>(message: S) -> Self {
        Self::UnsupportedFeature(message.into())
    }

    /// Get the kind of this error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::IllegalArgument { .. } => ErrorKind::IllegalArgument,
            Self::UnsupportedFeature(_) => ErrorKind::UnsupportedFeature,
        }
    }

    /// Check if this is a transport error
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Get the service error that caused this error, if any
    pub const fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::Transport { source, .. } | Self::IllegalArgument { source, .. } => {
                source.as_ref()
            }
            Self::UnsupportedFeature(_) => None,
        }
    }
}

/// Result type for OMAPI operations
pub type Result<T> = std::result::Result<T, OmapiError>;
