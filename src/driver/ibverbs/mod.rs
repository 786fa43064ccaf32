//! The `libibverbs` provider.
//!
//! Native identities are the C pointers themselves. A null pointer from an
//! allocating call is passed up unchanged; the managers report it.

mod sys;

use std::ffi::{c_int, c_uint, c_void, CStr};
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;

use self::sys::*;
use super::*;
use crate::registry::RawResource;
use crate::types::*;
use crate::utils::interop::{from_c_err, from_c_ret};

/// Driver over the system's `libibverbs`.
#[derive(Debug, Default)]
pub struct IbvDriver {
    _priv: (),
}

impl IbvDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Owner of a native device list; freed when the snapshot is dropped.
struct NativeDeviceList(*mut *mut ibv_device);

// SAFETY: the list is only read, and freed once.
unsafe impl Send for NativeDeviceList {}

impl Drop for NativeDeviceList {
    fn drop(&mut self) {
        // SAFETY: obtained from `ibv_get_device_list` and freed only here.
        unsafe { ibv_free_device_list(self.0) };
    }
}

/// Wrap an allocation result. A null pointer is logged with the current
/// `errno` and passed on.
fn alloc<T>(p: *mut T, what: &str) -> RawResource {
    if p.is_null() {
        log::debug!("ibverbs: {} returned null: {}", what, io::Error::last_os_error());
    }
    RawResource::from_ptr(p)
}

unsafe fn c_name(p: *const std::ffi::c_char) -> Option<String> {
    (!p.is_null())
        .then(|| CStr::from_ptr(p).to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

/// Chain `wrs` through their `next` pointers. `wrs` must not move afterwards.
macro_rules! link_list {
    ($wrs:expr) => {{
        let base = $wrs.as_mut_ptr();
        for i in 1..$wrs.len() {
            (*base.add(i - 1)).next = base.add(i);
        }
        base
    }};
}

/// Index of `bad` within the array at `base`.
fn bad_index<T>(base: *mut T, bad: *mut T) -> usize {
    if bad.is_null() {
        0
    } else {
        (bad as usize - base as usize) / mem::size_of::<T>()
    }
}

fn native_recv(wr: &RecvWr) -> ibv_recv_wr {
    ibv_recv_wr {
        wr_id: wr.wr_id,
        next: ptr::null_mut(),
        // `Sge` has the layout of `ibv_sge`; the list is not written through.
        sg_list: wr.sg_list.as_ptr() as *mut ibv_sge,
        num_sge: wr.sg_list.len() as c_int,
    }
}

fn native_send(wr: &SendWr) -> ibv_send_wr {
    let remote = wr.remote;
    let target = if wr.opcode.is_atomic() {
        wr_t {
            atomic: atomic_t {
                remote_addr: remote.addr,
                compare_add: wr.compare_add,
                swap: wr.swap,
                rkey: remote.rkey,
            },
        }
    } else {
        wr_t {
            rdma: rdma_t {
                remote_addr: remote.addr,
                rkey: remote.rkey,
            },
        }
    };
    ibv_send_wr {
        wr_id: wr.wr_id,
        next: ptr::null_mut(),
        sg_list: wr.sg_list.as_ptr() as *mut ibv_sge,
        num_sge: wr.sg_list.len() as c_int,
        opcode: wr.opcode as ibv_wr_opcode::Type,
        send_flags: wr.flags.0 as c_uint,
        imm_data: wr.imm_data.to_be(),
        wr: target,
        xrc_remote_srqn: 0,
        bind_mw_tso: [0; 6],
    }
}

unsafe fn post_recv_list(
    wrs: &[RecvWr],
    post: impl FnOnce(*mut ibv_recv_wr, *mut *mut ibv_recv_wr) -> io::Result<c_int>,
) -> Result<(), PostError> {
    if wrs.is_empty() {
        return Ok(());
    }
    let mut native = wrs.iter().map(native_recv).collect::<Vec<_>>();
    let head = link_list!(native);
    let mut bad = ptr::null_mut();
    match post(head, &mut bad) {
        Ok(0) => Ok(()),
        Ok(ret) => Err(PostError::new(bad_index(head, bad), ret.abs())),
        Err(source) => Err(PostError { index: 0, source }),
    }
}

impl Driver for IbvDriver {
    fn name(&self) -> &'static str {
        "ibverbs"
    }

    fn device_list(&self) -> io::Result<DeviceList> {
        let mut num: c_int = 0;
        // SAFETY: FFI.
        let list = unsafe { ibv_get_device_list(&mut num) };
        if list.is_null() {
            return Err(io::Error::last_os_error());
        }
        let owner = NativeDeviceList(list);
        let devices = (0..num.max(0) as usize)
            .map(|i| {
                // SAFETY: `num` entries are valid while the list lives.
                let dev = unsafe { *list.add(i) };
                RawDevice {
                    raw: RawResource::from_ptr(dev),
                    name: unsafe { c_name(ibv_get_device_name(dev)) },
                }
            })
            .collect();
        Ok(DeviceList::with_owner(devices, Box::new(owner)))
    }

    fn open_device(&self, dev: &RawDevice) -> io::Result<RawResource> {
        // SAFETY: the device list owning `dev` is alive.
        let ctx = unsafe { ibv_open_device(dev.raw.as_ptr()) };
        Ok(alloc(ctx, "ibv_open_device"))
    }

    fn close_device(&self, ctx: RawResource) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_close_device(ctx.as_ptr()) })
    }

    fn device_name(&self, ctx: RawResource) -> Option<String> {
        let ctx = ctx.as_ptr::<ibv_context>();
        // SAFETY: `ctx` is an open context.
        unsafe { c_name(ibv_get_device_name((*ctx).device)) }
    }

    fn query_device(&self, ctx: RawResource, attr: &mut DeviceAttr) -> io::Result<()> {
        let mut native = ibv_device_attr::default();
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_query_device(ctx.as_ptr(), &mut native) })?;

        *attr = DeviceAttr::default();
        for (dst, src) in attr.fw_ver.iter_mut().zip(native.fw_ver.iter()) {
            *dst = *src as u8;
        }
        attr.fw_ver[63] = 0;
        attr.node_guid = u64::from_be(native.node_guid);
        attr.sys_image_guid = u64::from_be(native.sys_image_guid);
        attr.max_mr_size = native.max_mr_size;
        attr.page_size_cap = native.page_size_cap;
        attr.vendor_id = native.vendor_id;
        attr.vendor_part_id = native.vendor_part_id;
        attr.hw_ver = native.hw_ver;
        attr.max_qp = native.max_qp as u32;
        attr.max_qp_wr = native.max_qp_wr as u32;
        attr.device_cap_flags = native.device_cap_flags;
        attr.max_sge = native.max_sge as u32;
        attr.max_cq = native.max_cq as u32;
        attr.max_cqe = native.max_cqe as u32;
        attr.max_mr = native.max_mr as u32;
        attr.max_pd = native.max_pd as u32;
        attr.max_qp_rd_atom = native.max_qp_rd_atom as u32;
        attr.max_qp_init_rd_atom = native.max_qp_init_rd_atom as u32;
        attr.max_srq = native.max_srq as u32;
        attr.max_srq_wr = native.max_srq_wr as u32;
        attr.max_srq_sge = native.max_srq_sge as u32;
        attr.atomic_cap = native.atomic_cap as u32;
        attr.max_pkeys = native.max_pkeys;
        attr.local_ca_ack_delay = native.local_ca_ack_delay;
        attr.phys_port_cnt = native.phys_port_cnt;
        Ok(())
    }

    fn query_port(&self, ctx: RawResource, port_num: u8, attr: &mut PortAttr) -> io::Result<()> {
        // The exported symbol takes the compat layout, a prefix of the full
        // one; the zeroed tail stays zero.
        let mut native = ibv_port_attr::default();
        // SAFETY: FFI.
        from_c_ret(unsafe {
            ibv_query_port(ctx.as_ptr(), port_num, ptr::addr_of_mut!(native).cast())
        })?;

        *attr = PortAttr {
            state: native.state as u32,
            max_mtu: native.max_mtu as u32,
            active_mtu: native.active_mtu as u32,
            gid_tbl_len: native.gid_tbl_len,
            port_cap_flags: native.port_cap_flags,
            max_msg_sz: native.max_msg_sz,
            lid: native.lid,
            sm_lid: native.sm_lid,
            pkey_tbl_len: native.pkey_tbl_len,
            active_width: native.active_width,
            active_speed: native.active_speed,
            phys_state: native.phys_state,
            link_layer: native.link_layer,
            lmc: native.lmc,
            max_vl_num: native.max_vl_num,
        };
        Ok(())
    }

    fn query_gid(&self, ctx: RawResource, port_num: u8, index: u8) -> io::Result<[u8; 16]> {
        let mut gid = ibv_gid { raw: [0; 16] };
        // SAFETY: FFI.
        let ret = unsafe { ibv_query_gid(ctx.as_ptr(), port_num, index as c_int, &mut gid) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: every bit pattern is a valid `[u8; 16]`.
        Ok(unsafe { gid.raw })
    }

    fn alloc_pd(&self, ctx: RawResource) -> io::Result<RawResource> {
        // SAFETY: FFI.
        let pd = unsafe { ibv_alloc_pd(ctx.as_ptr()) };
        Ok(alloc(pd, "ibv_alloc_pd"))
    }

    fn dealloc_pd(&self, pd: RawResource) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_dealloc_pd(pd.as_ptr()) })
    }

    unsafe fn reg_mr(
        &self,
        pd: RawResource,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<RawMr> {
        let mr = ibv_reg_mr(pd.as_ptr(), addr as *mut c_void, len, perm.bits() as c_int);
        let raw = alloc(mr, "ibv_reg_mr");
        let info = match mr.as_ref() {
            Some(mr) => MrInfo {
                addr: mr.addr as u64,
                length: mr.length as u64,
                lkey: mr.lkey,
                rkey: mr.rkey,
            },
            None => MrInfo::default(),
        };
        Ok(RawMr { raw, info })
    }

    fn dereg_mr(&self, mr: RawResource) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_dereg_mr(mr.as_ptr()) })
    }

    fn create_comp_channel(&self, ctx: RawResource) -> io::Result<RawResource> {
        // SAFETY: FFI.
        let channel = unsafe { ibv_create_comp_channel(ctx.as_ptr()) };
        Ok(alloc(channel, "ibv_create_comp_channel"))
    }

    fn destroy_comp_channel(&self, channel: RawResource) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_destroy_comp_channel(channel.as_ptr()) })
    }

    fn comp_channel_fd(&self, channel: RawResource) -> io::Result<RawFd> {
        let channel = channel.as_ptr::<ibv_comp_channel>();
        // SAFETY: `channel` is a live completion channel.
        Ok(unsafe { (*channel).fd })
    }

    fn create_cq(
        &self,
        ctx: RawResource,
        depth: u32,
        channel: Option<RawResource>,
        cookie: u64,
        vector: i32,
    ) -> io::Result<RawCq> {
        let depth = c_int::try_from(depth).or_else(|_| from_c_err(libc::EINVAL))?;
        let channel = channel.map_or(ptr::null_mut(), |c| c.as_ptr());
        // SAFETY: FFI. The cookie travels as the CQ context pointer.
        let cq = unsafe {
            ibv_create_cq(ctx.as_ptr(), depth, cookie as *mut c_void, channel, vector)
        };
        let raw = alloc(cq, "ibv_create_cq");
        // SAFETY: non-null CQs are live.
        let capacity = unsafe { cq.as_ref() }.map_or(0, |cq| cq.cqe as u32);
        Ok(RawCq { raw, capacity })
    }

    fn destroy_cq(&self, cq: RawResource) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_destroy_cq(cq.as_ptr()) })
    }

    fn poll_cq(&self, cq: RawResource, wc: &mut [Wc]) -> io::Result<usize> {
        if wc.is_empty() {
            return Ok(0);
        }
        let mut native = Vec::<ibv_wc>::with_capacity(wc.len());
        // SAFETY: `native` has room for `wc.len()` entries.
        let n = unsafe { ibv_poll_cq(cq.as_ptr(), wc.len() as c_int, native.as_mut_ptr())? };
        if n < 0 {
            // Providers report failure as a bare negative count.
            return from_c_err(libc::EIO);
        }
        // SAFETY: the provider initialised the first `n` entries.
        unsafe { native.set_len(n as usize) };
        for (dst, src) in wc.iter_mut().zip(&native) {
            *dst = Wc {
                wr_id: src.wr_id,
                status: src.status,
                opcode: src.opcode,
                vendor_err: src.vendor_err,
                byte_len: src.byte_len,
                imm_data: u32::from_be(src.imm_data),
                qp_num: src.qp_num,
                src_qp: src.src_qp,
                wc_flags: src.wc_flags,
            };
        }
        Ok(n as usize)
    }

    fn req_notify_cq(&self, cq: RawResource, solicited_only: bool) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_req_notify_cq(cq.as_ptr(), solicited_only as c_int)? })
    }

    fn get_cq_event(&self, channel: RawResource) -> io::Result<CqEvent> {
        let mut cq: *mut ibv_cq = ptr::null_mut();
        let mut cookie: *mut c_void = ptr::null_mut();
        // SAFETY: FFI.
        let ret = unsafe { ibv_get_cq_event(channel.as_ptr(), &mut cq, &mut cookie) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(CqEvent {
            cq: RawResource::from_ptr(cq),
            cookie: cookie as u64,
        })
    }

    fn ack_cq_events(&self, cq: RawResource, n: u32) {
        // SAFETY: FFI.
        unsafe { ibv_ack_cq_events(cq.as_ptr(), n as c_uint) };
    }

    fn create_srq(&self, pd: RawResource, attr: &SrqInitAttr) -> io::Result<RawResource> {
        let mut init = ibv_srq_init_attr::default();
        init.attr.max_wr = attr.max_wr;
        init.attr.max_sge = attr.max_sge;
        init.attr.srq_limit = attr.srq_limit;
        // SAFETY: FFI.
        let srq = unsafe { ibv_create_srq(pd.as_ptr(), &mut init) };
        Ok(alloc(srq, "ibv_create_srq"))
    }

    fn destroy_srq(&self, srq: RawResource) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_destroy_srq(srq.as_ptr()) })
    }

    fn post_srq_recv(&self, srq: RawResource, wrs: &[RecvWr]) -> Result<(), PostError> {
        // SAFETY: the scatter/gather lists outlive the call.
        unsafe {
            post_recv_list(wrs, |head, bad| {
                ibv_post_srq_recv(srq.as_ptr(), head, bad)
            })
        }
    }

    fn create_qp(&self, pd: RawResource, init: &RawQpInit) -> io::Result<RawQp> {
        let mut native = ibv_qp_init_attr::default();
        native.send_cq = init.send_cq.as_ptr();
        native.recv_cq = init.recv_cq.as_ptr();
        native.srq = init.srq.map_or(ptr::null_mut(), |s| s.as_ptr());
        native.cap.max_send_wr = init.cap.max_send_wr;
        native.cap.max_recv_wr = init.cap.max_recv_wr;
        native.cap.max_send_sge = init.cap.max_send_sge;
        native.cap.max_recv_sge = init.cap.max_recv_sge;
        native.cap.max_inline_data = init.cap.max_inline_data;
        native.qp_type = init.qp_type as ibv_qp_type::Type;
        native.sq_sig_all = init.sq_sig_all as c_int;

        // SAFETY: FFI.
        let qp = unsafe { ibv_create_qp(pd.as_ptr(), &mut native) };
        let raw = alloc(qp, "ibv_create_qp");
        // SAFETY: non-null QPs are live.
        let qp_num = unsafe { qp.as_ref() }.map_or(0, |qp| qp.qp_num);
        Ok(RawQp { raw, qp_num })
    }

    fn modify_qp(&self, qp: RawResource, attr: &QpAttr, mask: QpAttrMask) -> io::Result<()> {
        let mut native = ibv_qp_attr::default();
        native.qp_state = attr.qp_state as ibv_qp_state::Type;
        native.cur_qp_state = attr.cur_qp_state as ibv_qp_state::Type;
        native.path_mtu = attr.path_mtu as ibv_mtu::Type;
        native.qp_access_flags = attr.qp_access_flags as c_uint;
        native.qkey = attr.qkey;
        native.rq_psn = attr.rq_psn;
        native.sq_psn = attr.sq_psn;
        native.dest_qp_num = attr.dest_qp_num;
        native.pkey_index = attr.pkey_index as u16;
        native.port_num = attr.port_num;
        native.timeout = attr.timeout;
        native.retry_cnt = attr.retry_cnt;
        native.rnr_retry = attr.rnr_retry;
        native.min_rnr_timer = attr.min_rnr_timer;
        native.max_rd_atomic = attr.max_rd_atomic;
        native.max_dest_rd_atomic = attr.max_dest_rd_atomic;

        native.ah_attr.dlid = attr.dlid;
        native.ah_attr.port_num = attr.port_num;
        native.ah_attr.is_global = attr.is_global;
        native.ah_attr.grh.dgid.raw = attr.dgid;
        native.ah_attr.grh.sgid_index = attr.sgid_index;
        native.ah_attr.grh.hop_limit = 0xFF;

        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_modify_qp(qp.as_ptr(), &mut native, mask.0 as c_int) })
    }

    fn query_qp_state(&self, qp: RawResource) -> io::Result<QpState> {
        let mut attr = ibv_qp_attr::default();
        let mut init = ibv_qp_init_attr::default();
        // SAFETY: FFI.
        from_c_ret(unsafe {
            ibv_query_qp(qp.as_ptr(), &mut attr, QpAttrMask::STATE.0 as c_int, &mut init)
        })?;
        QpState::try_from(attr.qp_state as u32).or_else(|_| from_c_err(libc::EINVAL))
    }

    fn destroy_qp(&self, qp: RawResource) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_destroy_qp(qp.as_ptr()) })
    }

    fn post_send(&self, qp: RawResource, wrs: &[SendWr]) -> Result<(), PostError> {
        if wrs.is_empty() {
            return Ok(());
        }
        let mut native = wrs.iter().map(native_send).collect::<Vec<_>>();
        // SAFETY: `native` and the scatter/gather lists outlive the call.
        unsafe {
            let head = link_list!(native);
            let mut bad = ptr::null_mut();
            match ibv_post_send(qp.as_ptr(), head, &mut bad) {
                Ok(0) => Ok(()),
                Ok(ret) => Err(PostError::new(bad_index(head, bad), ret.abs())),
                Err(source) => Err(PostError { index: 0, source }),
            }
        }
    }

    fn post_recv(&self, qp: RawResource, wrs: &[RecvWr]) -> Result<(), PostError> {
        // SAFETY: the scatter/gather lists outlive the call.
        unsafe { post_recv_list(wrs, |head, bad| ibv_post_recv(qp.as_ptr(), head, bad)) }
    }
}
