//! Error types and their scalar status codes.

use std::io;

use thiserror::Error;

use crate::driver::PostError;
use crate::registry::{Handle, ResourceKind};

/// Status written when a precondition checked inside this crate fails.
pub const STATUS_FAILURE: i32 = 1;

/// Error of a fallible verbs operation.
#[derive(Debug, Error)]
pub enum VerbsError {
    /// The driver could not produce a device list.
    #[error("cannot enumerate devices: {0}")]
    Enumeration(#[source] io::Error),

    /// The device index is out of range for the current device list.
    #[error("device index {index} out of range ({count} devices)")]
    InvalidDeviceIndex { index: usize, count: usize },

    /// The driver returned a null native handle.
    #[error("driver returned a null {0}")]
    NullResource(ResourceKind),

    /// The handle was never issued, was revoked, or names another kind.
    #[error("invalid {kind} handle {handle:?}")]
    InvalidHandle { kind: ResourceKind, handle: Handle },

    /// An argument failed validation before reaching the driver.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The resource still has live dependents.
    #[error("{kind} still has {dependents} dependent resource(s)")]
    Busy { kind: ResourceKind, dependents: usize },

    /// `libibverbs` interfaces (or the software provider) returned an error.
    #[error("driver error: {0}")]
    Driver(#[from] io::Error),

    /// A work request in a posted list was rejected. Requests before it
    /// remain posted.
    #[error("work request #{index} rejected: {source}")]
    Post {
        index: usize,
        #[source]
        source: io::Error,
    },
}

impl VerbsError {
    /// Scalar status reported across the boundary.
    pub fn status(&self) -> i32 {
        match self {
            VerbsError::Enumeration(_)
            | VerbsError::InvalidDeviceIndex { .. }
            | VerbsError::NullResource(_)
            | VerbsError::InvalidHandle { .. }
            | VerbsError::InvalidArgument(_) => STATUS_FAILURE,
            VerbsError::Busy { .. } => libc::EBUSY,
            VerbsError::Driver(e) | VerbsError::Post { source: e, .. } => io_status(e),
        }
    }
}

impl From<PostError> for VerbsError {
    fn from(e: PostError) -> Self {
        VerbsError::Post {
            index: e.index,
            source: e.source,
        }
    }
}

/// Status of a driver error: its errno, or `EIO` when it carries none.
pub(crate) fn io_status(e: &io::Error) -> i32 {
    match e.raw_os_error() {
        Some(0) | None => libc::EIO,
        Some(code) => code,
    }
}

/// Configuration loading error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file: {0}")]
    Io(#[from] io::Error),

    #[error("malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("`[rdmabridge]` table not found")]
    MissingTable,

    #[error("unknown provider `{0}`")]
    UnknownProvider(String),

    #[error("provider `{0}` is not compiled in")]
    ProviderUnavailable(&'static str),
}
