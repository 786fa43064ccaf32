//! The rdmabridge prelude.
//!
//! The purpose of this module is to alleviate imports of the handle-based
//! verbs and their value types.

pub use crate::config::{Config, DependencyPolicy, ProviderKind};
pub use crate::driver::soft::{SoftConfig, SoftDeviceConfig, SoftDriver, SoftLinkLayer};
pub use crate::driver::Driver;
pub use crate::error::{ConfigError, VerbsError, STATUS_FAILURE};
pub use crate::registry::{Handle, ResourceKind};
pub use crate::result::VerbsResult;
pub use crate::types::*;
pub use crate::verbs::Verbs;
