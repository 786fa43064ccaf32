//! The outcome record every fallible boundary operation writes into.

use crate::error::VerbsError;
use crate::registry::Handle;

/// Outcome of one fallible operation: a status and, on success, a handle.
///
/// Allocated by the caller before the call, populated by the callee, read
/// right after. `handle` is only meaningful when `status == 0`; on failure,
/// and after every destroy/close, it is `0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct VerbsResult {
    pub status: i32,
    pub handle: u64,
}

impl VerbsResult {
    pub const fn new() -> Self {
        Self {
            status: 0,
            handle: 0,
        }
    }

    /// Record an operation that yields a handle.
    pub fn record(&mut self, outcome: Result<Handle, VerbsError>) {
        match outcome {
            Ok(handle) => {
                self.status = 0;
                self.handle = handle.as_raw();
            }
            Err(e) => self.fail(&e),
        }
    }

    /// Record an operation that yields nothing. The handle is reset.
    pub fn record_unit(&mut self, outcome: Result<(), VerbsError>) {
        match outcome {
            Ok(()) => {
                self.status = 0;
                self.handle = 0;
            }
            Err(e) => self.fail(&e),
        }
    }

    fn fail(&mut self, e: &VerbsError) {
        log::debug!("rdmabridge: {}", e);
        self.status = e.status();
        self.handle = 0;
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    /// The handle, if the status says it may be used.
    #[inline]
    pub fn handle(&self) -> Option<Handle> {
        self.is_success().then_some(Handle::from_raw(self.handle))
    }

    /// Turn the record back into a `Result` of handle or status.
    pub fn into_result(self) -> Result<Handle, i32> {
        self.handle().ok_or(self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::STATUS_FAILURE;
    use crate::registry::ResourceKind;

    #[test]
    fn test_record() {
        let mut r = VerbsResult::new();
        r.record(Ok(Handle::from_raw(0x0100_0000_0000_0001)));
        assert!(r.is_success());
        assert_eq!(r.handle().map(|h| h.kind()), Some(Some(ResourceKind::Context)));

        r.record(Err(VerbsError::InvalidArgument("null address")));
        assert_eq!(r.status, STATUS_FAILURE);
        assert_eq!(r.handle, 0);
        assert_eq!(r.handle(), None);
        assert_eq!(r.into_result(), Err(STATUS_FAILURE));
    }

    #[test]
    fn test_record_unit_resets_handle() {
        let mut r = VerbsResult {
            status: 0,
            handle: 99,
        };
        r.record_unit(Ok(()));
        assert_eq!(r, VerbsResult::new());

        r.handle = 99;
        r.record_unit(Err(VerbsError::Busy {
            kind: ResourceKind::CompletionQueue,
            dependents: 2,
        }));
        assert_eq!(r.status, libc::EBUSY);
        assert_eq!(r.handle, 0);
    }
}
