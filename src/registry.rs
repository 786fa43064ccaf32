//! Translation between opaque handles and native resource identities.
//!
//! The registry only translates: it never creates or destroys native
//! resources. Each entry remembers its parents so that the number of live
//! dependents of any handle is known in O(1).

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;

/// Kind of resource a handle refers to. The kind is encoded in the top byte
/// of every handle value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResourceKind {
    Context = 1,
    ProtectionDomain = 2,
    MemoryRegion = 3,
    CompletionChannel = 4,
    CompletionQueue = 5,
    SharedReceiveQueue = 6,
    QueuePair = 7,
}

impl ResourceKind {
    fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => ResourceKind::Context,
            2 => ResourceKind::ProtectionDomain,
            3 => ResourceKind::MemoryRegion,
            4 => ResourceKind::CompletionChannel,
            5 => ResourceKind::CompletionQueue,
            6 => ResourceKind::SharedReceiveQueue,
            7 => ResourceKind::QueuePair,
            _ => return None,
        })
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Context => "context",
            ResourceKind::ProtectionDomain => "protection domain",
            ResourceKind::MemoryRegion => "memory region",
            ResourceKind::CompletionChannel => "completion channel",
            ResourceKind::CompletionQueue => "completion queue",
            ResourceKind::SharedReceiveQueue => "shared receive queue",
            ResourceKind::QueuePair => "queue pair",
        })
    }
}

/// Opaque handle handed to callers. `0` is never issued.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Handle(u64);

impl Handle {
    /// The invalid sentinel.
    pub const NULL: Handle = Handle(0);

    const KIND_SHIFT: u32 = 56;
    const SEQ_MASK: u64 = (1 << Self::KIND_SHIFT) - 1;

    fn compose(kind: ResourceKind, seq: u64) -> Self {
        Handle(((kind as u64) << Self::KIND_SHIFT) | (seq & Self::SEQ_MASK))
    }

    /// Reinterpret a scalar received across the boundary.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    /// The scalar passed across the boundary.
    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Kind encoded in the handle value, if the value could have been issued.
    pub fn kind(self) -> Option<ResourceKind> {
        ResourceKind::from_tag((self.0 >> Self::KIND_SHIFT) as u8)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "Handle({kind}#{})", self.0 & Self::SEQ_MASK),
            None => write!(f, "Handle({:#x})", self.0),
        }
    }
}

impl From<Handle> for u64 {
    fn from(h: Handle) -> Self {
        h.0
    }
}

/// Native identity of a driver resource: a pointer for libibverbs, an object
/// id for the software provider. `0` is null.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct RawResource(u64);

impl RawResource {
    pub const NULL: RawResource = RawResource(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        RawResource(raw)
    }

    #[inline]
    pub fn from_ptr<T>(p: *mut T) -> Self {
        RawResource(p as usize as u64)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for RawResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawResource({:#x})", self.0)
    }
}

struct Entry {
    raw: RawResource,
    parents: Vec<Handle>,
    dependents: AtomicUsize,
}

/// Handle table.
pub struct Registry {
    entries: DashMap<Handle, Entry>,
    reverse: DashMap<(ResourceKind, RawResource), Handle>,
    // Start from 1 so that no handle is ever zero.
    next_seq: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            reverse: DashMap::new(),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Issue a handle for `raw`. Each listed parent gains one dependent;
    /// null parents are skipped.
    pub fn insert(&self, kind: ResourceKind, raw: RawResource, parents: &[Handle]) -> Handle {
        let handle = Handle::compose(kind, self.next_seq.fetch_add(1, Ordering::Relaxed));
        let parents: Vec<Handle> = parents.iter().copied().filter(|p| !p.is_null()).collect();
        for p in &parents {
            if let Some(entry) = self.entries.get(p) {
                entry.dependents.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.entries.insert(
            handle,
            Entry {
                raw,
                parents,
                dependents: AtomicUsize::new(0),
            },
        );
        self.reverse.insert((kind, raw), handle);
        handle
    }

    /// Resolve a handle of the expected kind. `None` if the handle was never
    /// issued, has been revoked, or names another kind of resource.
    pub fn resolve(&self, handle: Handle, kind: ResourceKind) -> Option<RawResource> {
        if handle.kind() != Some(kind) {
            return None;
        }
        self.entries.get(&handle).map(|e| e.raw)
    }

    /// Handle currently issued for a native identity.
    pub fn lookup_raw(&self, kind: ResourceKind, raw: RawResource) -> Option<Handle> {
        self.reverse.get(&(kind, raw)).map(|h| *h)
    }

    /// Number of live resources that name `handle` as a parent.
    pub fn dependents(&self, handle: Handle) -> usize {
        self.entries
            .get(&handle)
            .map_or(0, |e| e.dependents.load(Ordering::Acquire))
    }

    /// Parents recorded for `handle`.
    pub fn parents(&self, handle: Handle) -> Vec<Handle> {
        self.entries
            .get(&handle)
            .map_or_else(Vec::new, |e| e.parents.clone())
    }

    /// Revoke a handle and release its hold on its parents.
    pub fn remove(&self, handle: Handle) -> Option<RawResource> {
        let (_, entry) = self.entries.remove(&handle)?;
        if let Some(kind) = handle.kind() {
            self.reverse
                .remove_if(&(kind, entry.raw), |_, issued| *issued == handle);
        }
        for p in &entry.parents {
            if let Some(parent) = self.entries.get(p) {
                parent.dependents.fetch_sub(1, Ordering::AcqRel);
            }
        }
        Some(entry.raw)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("live", &self.entries.len())
            .finish()
    }
}
