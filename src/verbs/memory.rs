use super::*;
use crate::types::Permission;

impl Verbs {
    /// Allocate a protection domain under a context.
    pub fn alloc_pd(&self, ctx: Handle) -> Result<Handle, VerbsError> {
        let raw_ctx = self.resolve(ctx, ResourceKind::Context)?;
        let raw = self.driver.alloc_pd(raw_ctx)?;
        self.issue(ResourceKind::ProtectionDomain, raw, &[ctx])
    }

    /// Deallocate a protection domain. A second call with the same handle
    /// fails: the handle was revoked by the first.
    pub fn dealloc_pd(&self, pd: Handle) -> Result<(), VerbsError> {
        self.destroy(pd, ResourceKind::ProtectionDomain, |d, raw| {
            d.dealloc_pd(raw)
        })
    }

    /// Register `len` bytes at `addr` with the given access rights.
    ///
    /// A null address or a zero length is rejected without calling the
    /// driver.
    ///
    /// # Safety
    ///
    /// The memory must stay allocated, and must not move, until the region
    /// is deregistered. Remote peers may read and write it as `perm` allows.
    pub unsafe fn reg_mr(
        &self,
        pd: Handle,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> Result<Handle, VerbsError> {
        if addr.is_null() {
            return Err(VerbsError::InvalidArgument("null memory region address"));
        }
        if len == 0 {
            return Err(VerbsError::InvalidArgument("zero memory region length"));
        }
        let raw_pd = self.resolve(pd, ResourceKind::ProtectionDomain)?;
        let mr = self.driver.reg_mr(raw_pd, addr, len, perm)?;
        let handle = self.issue(ResourceKind::MemoryRegion, mr.raw, &[pd])?;
        self.details.insert(handle, Details::Mr(mr.info));
        Ok(handle)
    }

    /// Register a mutable slice. See [`Verbs::reg_mr`].
    ///
    /// # Safety
    ///
    /// The slice must outlive the registration.
    pub unsafe fn reg_slice(
        &self,
        pd: Handle,
        buf: &mut [u8],
        perm: Permission,
    ) -> Result<Handle, VerbsError> {
        self.reg_mr(pd, buf.as_mut_ptr(), buf.len(), perm)
    }

    /// Address, length and keys of a registration.
    pub fn query_mr(&self, mr: Handle) -> Result<MrInfo, VerbsError> {
        self.resolve(mr, ResourceKind::MemoryRegion)?;
        match self.details.get(&mr).map(|d| *d) {
            Some(Details::Mr(info)) => Ok(info),
            _ => Err(VerbsError::InvalidHandle {
                kind: ResourceKind::MemoryRegion,
                handle: mr,
            }),
        }
    }

    pub fn dereg_mr(&self, mr: Handle) -> Result<(), VerbsError> {
        self.destroy(mr, ResourceKind::MemoryRegion, |d, raw| d.dereg_mr(raw))
    }
}
