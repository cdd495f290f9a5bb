//! Error types for minikv-client

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Operation kinds, used as error context and in replica requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Get,
    Set,
    Del,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Get => write!(f, "get"),
            OpKind::Set => write!(f, "set"),
            OpKind::Del => write!(f, "del"),
        }
    }
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Timeout,
    InvalidTable,
    NotPrimary,
    StaleConfig,
    Unreachable,
    Cancelled,
    Internal,
    InvalidArgument,
}

// Cloneable so a single resolution outcome can be handed to every waiter.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // === Data Errors ===
    #[error("Key not found: {0}")]
    NotFound(String),

    // === Routing Errors ===
    #[error("Invalid table: {0}")]
    InvalidTable(String),

    #[error("Not primary: {0}")]
    NotPrimary(String),

    #[error("Stale config: {0}")]
    StaleConfig(String),

    // === Network Errors ===
    #[error("Connection failed: {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Unreachable: {0}")]
    Unreachable(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    // === Protocol Errors ===
    #[error("Codec error: {0}")]
    Codec(Arc<bincode::Error>),

    #[error("Internal error: {0}")]
    Internal(String),

    // === Caller Errors ===
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Context ===
    #[error("{op} on table {table}: {source}")]
    Operation {
        table: String,
        op: OpKind,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn connection(addr: impl Into<String>, source: std::io::Error) -> Self {
        Error::ConnectionFailed {
            addr: addr.into(),
            source: Arc::new(source),
        }
    }

    /// Classify into the client-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidTable(_) => ErrorKind::InvalidTable,
            Error::NotPrimary(_) => ErrorKind::NotPrimary,
            Error::StaleConfig(_) => ErrorKind::StaleConfig,
            Error::ConnectionFailed { .. } | Error::Unreachable(_) => ErrorKind::Unreachable,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Codec(_) | Error::Internal(_) => ErrorKind::Internal,
            Error::InvalidArgument(_) | Error::InvalidConfig(_) => ErrorKind::InvalidArgument,
            Error::Operation { source, .. } => source.kind(),
        }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout
                | ErrorKind::Unreachable
                | ErrorKind::NotPrimary
                | ErrorKind::StaleConfig
        )
    }

    /// Routing is stale and a partition map refresh may fix it.
    pub fn is_stale_routing(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotPrimary | ErrorKind::StaleConfig)
    }

    /// Attach table/operation context. Already-wrapped errors are left alone.
    pub fn with_op(self, table: &str, op: OpKind) -> Self {
        match self {
            Error::Operation { .. } => self,
            other => Error::Operation {
                table: table.to_string(),
                op,
                source: Box::new(other),
            },
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(Arc::new(e))
    }
}
