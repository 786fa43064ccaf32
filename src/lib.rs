//! Handle-based RDMA verbs resources with a scalar, exception-free C boundary.
//!
//! `rdmabridge` hands out opaque 64-bit [`Handle`]s for every verbs resource
//! (device contexts, protection domains, memory regions, completion
//! channels, completion queues, shared receive queues and queue pairs).
//! Handles are tagged with their resource kind, never reused, and revoked
//! on destruction, so a stale or mistyped handle is reported as a failure
//! rather than dereferenced.
//!
//! Native work is done by a [`driver::Driver`]. Two are provided:
//!
//! - [`driver::soft::SoftDriver`], an in-process software fabric. It needs
//!   no hardware and is the default.
//! - `driver::ibverbs::IbvDriver`, over the system's `libibverbs`, behind
//!   the `ibverbs` feature.
//!
//! Foreign callers use the `rdmabridge_*` functions in [`ffi`], which report
//! every outcome through a [`VerbsResult`] record instead of unwinding.
//!
//! # Example
//!
//! ```rust
//! use rdmabridge::prelude::*;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let verbs = Verbs::new(SoftDriver::default());
//!     let ctx = verbs.open_device(0)?;
//!     let pd = verbs.alloc_pd(ctx)?;
//!
//!     let mut buf = vec![0u8; 4096];
//!     let mr = unsafe { verbs.reg_slice(pd, &mut buf, Permission::LOCAL_WRITE)? };
//!     assert_eq!(verbs.query_mr(mr)?.length, 4096);
//!
//!     verbs.dereg_mr(mr)?;
//!     verbs.dealloc_pd(pd)?;
//!     verbs.close_device(ctx)?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod fd;
pub mod ffi;
pub mod registry;
pub mod result;
pub mod types;
pub mod verbs;

mod utils;

pub use config::{Config, DependencyPolicy, ProviderKind};
pub use error::{ConfigError, VerbsError, STATUS_FAILURE};
pub use registry::{Handle, ResourceKind};
pub use result::VerbsResult;
pub use verbs::Verbs;

/// Prelude.
pub mod prelude;
