//! The verbs provider seam.
//!
//! Managers in [`crate::verbs`] translate handles and enforce preconditions;
//! a [`Driver`] performs the native operation. Native identities are opaque
//! [`RawResource`]s and a null one is a valid return value: deciding that a
//! null allocation is a failure is the managers' job.

pub mod soft;

#[cfg(feature = "ibverbs")]
pub mod ibverbs;

use std::io;
use std::os::fd::RawFd;

use crate::registry::RawResource;
use crate::types::*;

/// One entry of a device list snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevice {
    /// Driver-specific device identity, valid while the owning
    /// [`DeviceList`] is alive.
    pub raw: RawResource,
    /// Device name, if the driver reports one.
    pub name: Option<String>,
}

/// Snapshot of the devices present at enumeration time.
///
/// Some drivers must keep the native list alive until a device from it has
/// been opened; the optional owner is dropped with the snapshot.
pub struct DeviceList {
    devices: Vec<RawDevice>,
    _owner: Option<Box<dyn Send>>,
}

impl DeviceList {
    pub fn new(devices: Vec<RawDevice>) -> Self {
        Self {
            devices,
            _owner: None,
        }
    }

    /// A snapshot whose entries borrow from `owner`.
    pub fn with_owner(devices: Vec<RawDevice>, owner: Box<dyn Send>) -> Self {
        Self {
            devices,
            _owner: Some(owner),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&RawDevice> {
        self.devices.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RawDevice> {
        self.devices.iter()
    }
}

/// Native identities of a freshly registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMr {
    pub raw: RawResource,
    pub info: MrInfo,
}

/// Native identity and actual capacity of a freshly created CQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCq {
    pub raw: RawResource,
    pub capacity: u32,
}

/// Native identity and number of a freshly created QP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawQp {
    pub raw: RawResource,
    pub qp_num: u32,
}

/// QP creation attributes after handle translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawQpInit {
    pub send_cq: RawResource,
    pub recv_cq: RawResource,
    pub srq: Option<RawResource>,
    pub qp_type: QpType,
    pub sq_sig_all: bool,
    pub cap: QpCaps,
}

/// Rejection of one request of a posted list, like the `bad_wr` out
/// parameter of `ibv_post_send`.
#[derive(Debug)]
pub struct PostError {
    /// Index of the first rejected request. Requests before it were posted.
    pub index: usize,
    pub source: io::Error,
}

impl PostError {
    pub fn new(index: usize, errno: i32) -> Self {
        Self {
            index,
            source: io::Error::from_raw_os_error(errno),
        }
    }
}

/// A completion event read from a completion channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqEvent {
    pub cq: RawResource,
    pub cookie: u64,
}

/// Native verbs invoked by the managers.
///
/// Implementations follow libibverbs semantics: completions of one side of
/// one QP are delivered in submission order; destroying a resource that
/// still has dependents fails with `EBUSY`.
pub trait Driver: Send + Sync {
    /// Provider name, for logging.
    fn name(&self) -> &'static str;

    // Devices and contexts.

    fn device_list(&self) -> io::Result<DeviceList>;
    fn open_device(&self, dev: &RawDevice) -> io::Result<RawResource>;
    fn close_device(&self, ctx: RawResource) -> io::Result<()>;
    fn device_name(&self, ctx: RawResource) -> Option<String>;
    fn query_device(&self, ctx: RawResource, attr: &mut DeviceAttr) -> io::Result<()>;
    fn query_port(&self, ctx: RawResource, port_num: u8, attr: &mut PortAttr) -> io::Result<()>;

    /// GID at `index` of the port's GID table.
    fn query_gid(&self, ctx: RawResource, port_num: u8, index: u8) -> io::Result<[u8; 16]>;

    // Protection domains and memory regions.

    fn alloc_pd(&self, ctx: RawResource) -> io::Result<RawResource>;
    fn dealloc_pd(&self, pd: RawResource) -> io::Result<()>;

    /// Register `len` bytes at `addr`.
    ///
    /// # Safety
    ///
    /// The memory must stay allocated and unmoved until [`Driver::dereg_mr`].
    unsafe fn reg_mr(
        &self,
        pd: RawResource,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<RawMr>;
    fn dereg_mr(&self, mr: RawResource) -> io::Result<()>;

    // Completion channels and completion queues.

    fn create_comp_channel(&self, ctx: RawResource) -> io::Result<RawResource>;
    fn destroy_comp_channel(&self, channel: RawResource) -> io::Result<()>;
    fn comp_channel_fd(&self, channel: RawResource) -> io::Result<RawFd>;

    fn create_cq(
        &self,
        ctx: RawResource,
        depth: u32,
        channel: Option<RawResource>,
        cookie: u64,
        vector: i32,
    ) -> io::Result<RawCq>;
    fn destroy_cq(&self, cq: RawResource) -> io::Result<()>;
    fn poll_cq(&self, cq: RawResource, wc: &mut [Wc]) -> io::Result<usize>;
    fn req_notify_cq(&self, cq: RawResource, solicited_only: bool) -> io::Result<()>;

    /// Wait for the next event on `channel`. Blocks unless the channel's
    /// descriptor is non-blocking, in which case `EAGAIN` is returned.
    fn get_cq_event(&self, channel: RawResource) -> io::Result<CqEvent>;
    fn ack_cq_events(&self, cq: RawResource, n: u32);

    // Shared receive queues.

    fn create_srq(&self, pd: RawResource, attr: &SrqInitAttr) -> io::Result<RawResource>;
    fn destroy_srq(&self, srq: RawResource) -> io::Result<()>;
    fn post_srq_recv(&self, srq: RawResource, wrs: &[RecvWr]) -> Result<(), PostError>;

    // Queue pairs.

    fn create_qp(&self, pd: RawResource, init: &RawQpInit) -> io::Result<RawQp>;
    fn modify_qp(&self, qp: RawResource, attr: &QpAttr, mask: QpAttrMask) -> io::Result<()>;
    fn query_qp_state(&self, qp: RawResource) -> io::Result<QpState>;
    fn destroy_qp(&self, qp: RawResource) -> io::Result<()>;
    fn post_send(&self, qp: RawResource, wrs: &[SendWr]) -> Result<(), PostError>;
    fn post_recv(&self, qp: RawResource, wrs: &[RecvWr]) -> Result<(), PostError>;
}
