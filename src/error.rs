//! Error types for the kwok controller

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration error (bad flags, unparseable config stream)
    #[error("configuration error: {0}")]
    Config(String),

    /// A Stage rule that cannot be compiled
    #[error("invalid stage {name}: {reason}")]
    InvalidStage {
        /// Name of the offending Stage
        name: String,
        /// What is wrong with it
        reason: String,
    },

    /// Invalid dotted-path expression
    #[error("invalid expression {0:?}")]
    Expr(String),

    /// Status template rendering error
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Pod IP pool error
    #[error("ip pool error: {0}")]
    Ipam(String),

    /// Startup error that should terminate the process
    #[error("startup error: {0}")]
    Startup(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-stage error
    pub fn invalid_stage(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidStage {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an ip pool error with the given message
    pub fn ipam(msg: impl Into<String>) -> Self {
        Self::Ipam(msg.into())
    }

    /// Create a startup error with the given message
    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }
}

/// True if the error is a 404 from the API server.
///
/// Not-found targets are dropped silently; the next watch event settles
/// the caches.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True if the error is a 409 conflict from the API server.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}
