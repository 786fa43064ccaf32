//! Handle-based verbs.
//!
//! [`Verbs`] is the managers' common state: a driver, the handle registry
//! and the teardown policy. Operations are grouped by resource family in
//! [`device`], [`memory`] and [`queue`]; every one of them takes and returns
//! [`Handle`]s and reports failure as a [`VerbsError`].

mod device;
mod memory;
mod queue;

use std::fmt;
use std::io;

use dashmap::DashMap;

use crate::config::{Config, DependencyPolicy};
use crate::driver::Driver;
use crate::error::{ConfigError, VerbsError};
use crate::registry::{Handle, RawResource, Registry, ResourceKind};
use crate::types::{MrInfo, QpType};

/// Facts recorded at creation time that later operations need.
#[derive(Debug, Clone, Copy)]
enum Details {
    Mr(MrInfo),
    Cq { capacity: u32 },
    Qp { qp_num: u32, qp_type: QpType },
}

/// The verbs resource layer.
pub struct Verbs {
    driver: Box<dyn Driver>,
    registry: Registry,
    details: DashMap<Handle, Details>,
    policy: DependencyPolicy,
}

impl Verbs {
    /// Verbs over `driver` with the default teardown policy.
    pub fn new(driver: impl Driver + 'static) -> Self {
        Self::with_policy(Box::new(driver), DependencyPolicy::default())
    }

    pub fn with_policy(driver: Box<dyn Driver>, policy: DependencyPolicy) -> Self {
        log::debug!(
            "verbs over the `{}` provider, {:?} dependency policy",
            driver.name(),
            policy
        );
        Self {
            driver,
            registry: Registry::new(),
            details: DashMap::new(),
            policy,
        }
    }

    /// Verbs over the driver a configuration selects.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::with_policy(
            config.build_driver()?,
            config.dependency_policy,
        ))
    }

    #[inline]
    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[inline]
    pub fn policy(&self) -> DependencyPolicy {
        self.policy
    }

    fn resolve(&self, handle: Handle, kind: ResourceKind) -> Result<RawResource, VerbsError> {
        self.registry
            .resolve(handle, kind)
            .ok_or(VerbsError::InvalidHandle { kind, handle })
    }

    /// Resolve an optional handle: [`Handle::NULL`] means none.
    fn resolve_opt(
        &self,
        handle: Handle,
        kind: ResourceKind,
    ) -> Result<Option<RawResource>, VerbsError> {
        if handle.is_null() {
            Ok(None)
        } else {
            self.resolve(handle, kind).map(Some)
        }
    }

    /// Issue a handle for a freshly created native resource. A null native
    /// identity is a failure.
    fn issue(
        &self,
        kind: ResourceKind,
        raw: RawResource,
        parents: &[Handle],
    ) -> Result<Handle, VerbsError> {
        if raw.is_null() {
            return Err(VerbsError::NullResource(kind));
        }
        let handle = self.registry.insert(kind, raw, parents);
        log::debug!("created {:?} ({:?})", handle, raw);
        Ok(handle)
    }

    /// Destroy the native resource behind `handle` and revoke the handle.
    fn destroy(
        &self,
        handle: Handle,
        kind: ResourceKind,
        op: impl FnOnce(&dyn Driver, RawResource) -> io::Result<()>,
    ) -> Result<(), VerbsError> {
        let raw = self.resolve(handle, kind)?;
        if self.policy == DependencyPolicy::Registry {
            let dependents = self.registry.dependents(handle);
            if dependents > 0 {
                log::warn!(
                    "refusing to destroy {:?}: {} live dependent(s)",
                    handle,
                    dependents
                );
                return Err(VerbsError::Busy { kind, dependents });
            }
        }
        op(self.driver(), raw).map_err(|e| {
            if e.raw_os_error() == Some(libc::EBUSY) {
                log::warn!("driver refused to destroy {:?}: {}", handle, e);
            }
            VerbsError::Driver(e)
        })?;
        self.registry.remove(handle);
        self.details.remove(&handle);
        log::debug!("destroyed {:?}", handle);
        Ok(())
    }

    /// The context a resource was created under.
    fn context_of(&self, handle: Handle) -> Option<Handle> {
        let mut cur = handle;
        loop {
            if cur.kind() == Some(ResourceKind::Context) {
                return Some(cur);
            }
            cur = *self.registry.parents(cur).first()?;
        }
    }
}

impl fmt::Debug for Verbs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verbs")
            .field("driver", &self.driver.name())
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .finish()
    }
}
