//! Software loopback provider.
//!
//! Every device of one [`SoftDriver`] is attached to the same in-process
//! fabric, so queue pairs opened on any of them can be connected to each
//! other. Data moves by copying between registered buffers under the
//! fabric lock, with the key, range and permission checks a real RDMA NIC
//! performs. Limits come from [`SoftDeviceConfig`].

mod engine;
mod eventfd;
mod fabric;

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use self::engine::MAX_MSG_SZ;
use self::fabric::*;
use super::*;
use crate::registry::RawResource;
use crate::types::*;
use crate::utils::interop::from_c_err;

/// Link layer a software device reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoftLinkLayer {
    #[default]
    Infiniband,
    Ethernet,
}

/// Description and limits of one software device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftDeviceConfig {
    /// Device name. An empty name is reported as no name.
    pub name: String,
    pub ports: u8,
    /// Port MTU in bytes, one of 256, 512, 1024, 2048, 4096.
    pub mtu: u32,
    pub link_layer: SoftLinkLayer,
    pub comp_vectors: u32,
    pub max_pd: u32,
    pub max_mr: u32,
    pub max_mr_size: u64,
    pub max_cq: u32,
    pub max_cqe: u32,
    pub max_qp: u32,
    pub max_qp_wr: u32,
    pub max_sge: u32,
    pub max_inline_data: u32,
    pub max_srq: u32,
    pub max_srq_wr: u32,
}

impl SoftDeviceConfig {
    /// A device with default limits.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ports: 1,
            mtu: 4096,
            link_layer: SoftLinkLayer::Infiniband,
            comp_vectors: 1,
            max_pd: 1024,
            max_mr: 4096,
            max_mr_size: 1 << 40,
            max_cq: 1024,
            max_cqe: 65536,
            max_qp: 1024,
            max_qp_wr: 16384,
            max_sge: 16,
            max_inline_data: 256,
            max_srq: 256,
            max_srq_wr: 16384,
        }
    }

    fn port_mtu(&self) -> Mtu {
        Mtu::from_bytes(self.mtu).unwrap_or(Mtu::Mtu4096)
    }
}

impl Default for SoftDeviceConfig {
    fn default() -> Self {
        Self::named("softrdma_0")
    }
}

/// Devices attached to the fabric at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftConfig {
    pub devices: Vec<SoftDeviceConfig>,
}

impl Default for SoftConfig {
    fn default() -> Self {
        Self {
            devices: vec![
                SoftDeviceConfig::named("softrdma_0"),
                SoftDeviceConfig::named("softrdma_1"),
            ],
        }
    }
}

/// The software loopback driver.
///
/// Clones share one fabric, so a clone kept aside can plug and unplug
/// devices under a driver already handed to [`crate::Verbs`].
#[derive(Clone)]
pub struct SoftDriver {
    fabric: Arc<Mutex<Fabric>>,
}

impl SoftDriver {
    pub fn new(config: &SoftConfig) -> Self {
        for dev in &config.devices {
            if Mtu::from_bytes(dev.mtu).is_none() {
                log::warn!(
                    "soft: device `{}` has invalid MTU {}, using 4096",
                    dev.name,
                    dev.mtu
                );
            }
        }
        Self {
            fabric: Arc::new(Mutex::new(Fabric::new(config.devices.clone()))),
        }
    }

    /// Attach a device. It appears in enumerations from now on.
    pub fn plug_device(&self, config: SoftDeviceConfig) {
        log::debug!("soft: plugging device `{}`", config.name);
        self.fabric.lock().plug(config);
    }

    /// Detach every device called `name`. Contexts already open on it keep
    /// working. Returns whether any device was detached.
    pub fn unplug_device(&self, name: &str) -> bool {
        log::debug!("soft: unplugging device `{}`", name);
        self.fabric.lock().unplug(name)
    }
}

impl Default for SoftDriver {
    fn default() -> Self {
        Self::new(&SoftConfig::default())
    }
}

fn node_guid(device_uid: u64) -> u64 {
    0x0002_c903_0000_0000 | (device_uid & 0xffff_ffff)
}

fn port_lid(device_uid: u64, port_num: u8) -> u16 {
    (((device_uid & 0xfff) << 4) as u16) | port_num as u16
}

fn check_port(config: &SoftDeviceConfig, port_num: u8) -> io::Result<()> {
    if port_num == 0 || port_num > config.ports {
        return from_c_err(libc::EINVAL);
    }
    Ok(())
}

impl Driver for SoftDriver {
    fn name(&self) -> &'static str {
        "soft"
    }

    fn device_list(&self) -> io::Result<DeviceList> {
        let f = self.fabric.lock();
        let devices = f
            .devices
            .iter()
            .map(|d| RawDevice {
                raw: RawResource::new(d.uid),
                name: (!d.config.name.is_empty()).then(|| d.config.name.clone()),
            })
            .collect();
        Ok(DeviceList::new(devices))
    }

    fn open_device(&self, dev: &RawDevice) -> io::Result<RawResource> {
        let mut f = self.fabric.lock();
        let Some(config) = f
            .devices
            .iter()
            .find(|d| d.uid == dev.raw.get())
            .map(|d| d.config.clone())
        else {
            return from_c_err(libc::ENODEV);
        };
        let id = f.alloc_id();
        f.contexts.insert(
            id,
            SoftContext {
                device_uid: dev.raw.get(),
                config,
            },
        );
        Ok(RawResource::new(id))
    }

    fn close_device(&self, ctx: RawResource) -> io::Result<()> {
        let mut f = self.fabric.lock();
        f.context(ctx)?;
        if f.count_in_ctx(ctx.get()).total() > 0 {
            return from_c_err(libc::EBUSY);
        }
        f.contexts.remove(&ctx.get());
        Ok(())
    }

    fn device_name(&self, ctx: RawResource) -> Option<String> {
        let f = self.fabric.lock();
        let ctx = f.contexts.get(&ctx.get())?;
        (!ctx.config.name.is_empty()).then(|| ctx.config.name.clone())
    }

    fn query_device(&self, ctx: RawResource, attr: &mut DeviceAttr) -> io::Result<()> {
        let f = self.fabric.lock();
        let ctx = f.context(ctx)?;
        let c = &ctx.config;
        *attr = DeviceAttr {
            node_guid: node_guid(ctx.device_uid),
            sys_image_guid: node_guid(ctx.device_uid),
            max_mr_size: c.max_mr_size,
            page_size_cap: !0xfff,
            max_qp: c.max_qp,
            max_qp_wr: c.max_qp_wr,
            max_sge: c.max_sge,
            max_cq: c.max_cq,
            max_cqe: c.max_cqe,
            max_mr: c.max_mr,
            max_pd: c.max_pd,
            max_qp_rd_atom: 16,
            max_qp_init_rd_atom: 16,
            max_srq: c.max_srq,
            max_srq_wr: c.max_srq_wr,
            max_srq_sge: c.max_sge,
            atomic_cap: DeviceAttr::ATOMIC_HCA,
            max_pkeys: 1,
            phys_port_cnt: c.ports,
            ..Default::default()
        };
        attr.set_fw_ver(env!("CARGO_PKG_VERSION"));
        Ok(())
    }

    fn query_port(&self, ctx: RawResource, port_num: u8, attr: &mut PortAttr) -> io::Result<()> {
        let f = self.fabric.lock();
        let ctx = f.context(ctx)?;
        check_port(&ctx.config, port_num)?;
        let mtu = ctx.config.port_mtu() as u32;
        let (lid, link_layer) = match ctx.config.link_layer {
            SoftLinkLayer::Infiniband => {
                (port_lid(ctx.device_uid, port_num), link_layer::INFINIBAND)
            }
            SoftLinkLayer::Ethernet => (0, link_layer::ETHERNET),
        };
        *attr = PortAttr {
            state: PortState::Active as u32,
            max_mtu: mtu,
            active_mtu: mtu,
            gid_tbl_len: 1,
            port_cap_flags: 0,
            max_msg_sz: MAX_MSG_SZ as u32,
            lid,
            sm_lid: 1,
            pkey_tbl_len: 1,
            // 4x lanes, 25 Gb/s each.
            active_width: 2,
            active_speed: 32,
            // LinkUp.
            phys_state: 5,
            link_layer,
            lmc: 0,
            max_vl_num: 1,
        };
        Ok(())
    }

    fn query_gid(&self, ctx: RawResource, port_num: u8, index: u8) -> io::Result<[u8; 16]> {
        let f = self.fabric.lock();
        let ctx = f.context(ctx)?;
        check_port(&ctx.config, port_num)?;
        if index != 0 {
            return from_c_err(libc::EINVAL);
        }
        // Link-local prefix, interface id from the node GUID and port.
        let mut gid = [0u8; 16];
        gid[0] = 0xfe;
        gid[1] = 0x80;
        gid[8..16].copy_from_slice(&(node_guid(ctx.device_uid) + port_num as u64).to_be_bytes());
        Ok(gid)
    }

    fn alloc_pd(&self, ctx: RawResource) -> io::Result<RawResource> {
        let mut f = self.fabric.lock();
        let max_pd = f.context(ctx)?.config.max_pd;
        if f.count_in_ctx(ctx.get()).pds >= max_pd as usize {
            return from_c_err(libc::ENOMEM);
        }
        let id = f.alloc_id();
        f.pds.insert(id, SoftPd { ctx: ctx.get() });
        Ok(RawResource::new(id))
    }

    fn dealloc_pd(&self, pd: RawResource) -> io::Result<()> {
        let mut f = self.fabric.lock();
        if !f.pds.contains_key(&pd.get()) {
            return invalid();
        }
        if f.count_in_pd(pd.get()).total() > 0 {
            return from_c_err(libc::EBUSY);
        }
        f.pds.remove(&pd.get());
        Ok(())
    }

    unsafe fn reg_mr(
        &self,
        pd: RawResource,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<RawMr> {
        let mut f = self.fabric.lock();
        let config = &f.pd_context(pd.get())?.config;
        let (max_mr, max_mr_size) = (config.max_mr, config.max_mr_size);
        if addr.is_null() || len == 0 || len as u64 > max_mr_size {
            return from_c_err(libc::EINVAL);
        }
        if perm.has_unknown_bits() || !perm.is_consistent() {
            return from_c_err(libc::EINVAL);
        }
        let ctx = f.pds.get(&pd.get()).map(|p| p.ctx);
        let used = f
            .mrs
            .values()
            .filter(|m| f.pds.get(&m.pd).map(|p| p.ctx) == ctx)
            .count();
        if used >= max_mr as usize {
            return from_c_err(libc::ENOMEM);
        }

        let id = f.alloc_id();
        let key = f.alloc_key();
        let mr = SoftMr {
            pd: pd.get(),
            addr: addr as u64,
            len: len as u64,
            perm,
            lkey: key,
            rkey: key,
        };
        f.mrs.insert(id, mr);
        Ok(RawMr {
            raw: RawResource::new(id),
            info: MrInfo {
                addr: addr as u64,
                length: len as u64,
                lkey: key,
                rkey: key,
            },
        })
    }

    fn dereg_mr(&self, mr: RawResource) -> io::Result<()> {
        let mut f = self.fabric.lock();
        f.mrs.remove(&mr.get()).map_or_else(invalid, |_| Ok(()))
    }

    fn create_comp_channel(&self, ctx: RawResource) -> io::Result<RawResource> {
        let mut f = self.fabric.lock();
        f.context(ctx)?;
        let event = eventfd::EventFd::new()?;
        let id = f.alloc_id();
        f.channels.insert(
            id,
            SoftChannel {
                ctx: ctx.get(),
                event,
                pending: VecDeque::new(),
            },
        );
        Ok(RawResource::new(id))
    }

    fn destroy_comp_channel(&self, channel: RawResource) -> io::Result<()> {
        let mut f = self.fabric.lock();
        if !f.channels.contains_key(&channel.get()) {
            return invalid();
        }
        if f.cqs.values().any(|cq| cq.channel == Some(channel.get())) {
            return from_c_err(libc::EBUSY);
        }
        f.channels.remove(&channel.get());
        Ok(())
    }

    fn comp_channel_fd(&self, channel: RawResource) -> io::Result<RawFd> {
        let f = self.fabric.lock();
        f.channels
            .get(&channel.get())
            .map_or_else(invalid, |ch| Ok(ch.event.as_raw_fd()))
    }

    fn create_cq(
        &self,
        ctx: RawResource,
        depth: u32,
        channel: Option<RawResource>,
        cookie: u64,
        vector: i32,
    ) -> io::Result<RawCq> {
        let mut f = self.fabric.lock();
        let config = &f.context(ctx)?.config;
        let (max_cq, max_cqe, comp_vectors) = (config.max_cq, config.max_cqe, config.comp_vectors);
        if depth == 0 || depth > max_cqe {
            return from_c_err(libc::EINVAL);
        }
        if vector < 0 || vector as u32 >= comp_vectors {
            return from_c_err(libc::EINVAL);
        }
        if let Some(ch) = channel {
            if f.channels.get(&ch.get()).map(|c| c.ctx) != Some(ctx.get()) {
                return from_c_err(libc::EINVAL);
            }
        }
        if f.count_in_ctx(ctx.get()).cqs >= max_cq as usize {
            return from_c_err(libc::ENOMEM);
        }

        let capacity = depth.checked_next_power_of_two().unwrap_or(max_cqe).min(max_cqe);
        let id = f.alloc_id();
        f.cqs.insert(
            id,
            SoftCq {
                ctx: ctx.get(),
                channel: channel.map(RawResource::get),
                cookie,
                capacity,
                entries: VecDeque::with_capacity(capacity as usize),
                armed: None,
                overflowed: false,
                unacked: 0,
            },
        );
        Ok(RawCq {
            raw: RawResource::new(id),
            capacity,
        })
    }

    fn destroy_cq(&self, cq: RawResource) -> io::Result<()> {
        let mut f = self.fabric.lock();
        let id = cq.get();
        let Some((channel, unacked)) = f.cqs.get(&id).map(|c| (c.channel, c.unacked)) else {
            return invalid();
        };
        if unacked > 0 {
            return from_c_err(libc::EBUSY);
        }
        if f.qps.values().any(|qp| qp.send_cq == id || qp.recv_cq == id) {
            return from_c_err(libc::EBUSY);
        }
        if let Some(ch) = channel.and_then(|ch| f.channels.get_mut(&ch)) {
            // Each dropped event takes its token with it, or the channel
            // stays readable with nothing to fetch.
            let before = ch.pending.len();
            ch.pending.retain(|ev| ev.cq != cq);
            for _ in ch.pending.len()..before {
                match ch.event.try_take() {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        log::warn!("soft: cannot drain completion channel: {}", e);
                        break;
                    }
                }
            }
        }
        f.cqs.remove(&id);
        Ok(())
    }

    fn poll_cq(&self, cq: RawResource, wc: &mut [Wc]) -> io::Result<usize> {
        let mut f = self.fabric.lock();
        let Some(cq) = f.cqs.get_mut(&cq.get()) else {
            return invalid();
        };
        if cq.overflowed {
            return from_c_err(libc::EOVERFLOW);
        }
        let n = wc.len().min(cq.entries.len());
        for (slot, entry) in wc.iter_mut().zip(cq.entries.drain(..n)) {
            *slot = entry;
        }
        Ok(n)
    }

    fn req_notify_cq(&self, cq: RawResource, solicited_only: bool) -> io::Result<()> {
        let mut f = self.fabric.lock();
        let Some(cq) = f.cqs.get_mut(&cq.get()) else {
            return invalid();
        };
        if cq.channel.is_none() {
            return from_c_err(libc::EINVAL);
        }
        // Arming for every completion is not narrowed by a later
        // solicited-only request.
        cq.armed = Some(cq.armed != Some(false) && solicited_only);
        Ok(())
    }

    fn get_cq_event(&self, channel: RawResource) -> io::Result<CqEvent> {
        let fd = self.comp_channel_fd(channel)?;
        eventfd::wait(fd)?;

        let mut f = self.fabric.lock();
        let Some(ch) = f.channels.get_mut(&channel.get()) else {
            return invalid();
        };
        let Some(event) = ch.pending.pop_front() else {
            return from_c_err(libc::EAGAIN);
        };
        if let Some(cq) = f.cqs.get_mut(&event.cq.get()) {
            cq.unacked += 1;
        }
        Ok(event)
    }

    fn ack_cq_events(&self, cq: RawResource, n: u32) {
        if let Some(cq) = self.fabric.lock().cqs.get_mut(&cq.get()) {
            cq.unacked = cq.unacked.saturating_sub(n);
        }
    }

    fn create_srq(&self, pd: RawResource, attr: &SrqInitAttr) -> io::Result<RawResource> {
        let mut f = self.fabric.lock();
        let ctx = f.pd_context(pd.get())?;
        let config = &ctx.config;
        if attr.max_wr == 0 || attr.max_wr > config.max_srq_wr {
            return from_c_err(libc::EINVAL);
        }
        if attr.max_sge == 0 || attr.max_sge > config.max_sge {
            return from_c_err(libc::EINVAL);
        }
        let max_srq = config.max_srq as usize;
        let ctx_id = f.pds.get(&pd.get()).map(|p| p.ctx);
        let used = f
            .srqs
            .values()
            .filter(|s| f.pds.get(&s.pd).map(|p| p.ctx) == ctx_id)
            .count();
        if used >= max_srq {
            return from_c_err(libc::ENOMEM);
        }

        let id = f.alloc_id();
        f.srqs.insert(
            id,
            SoftSrq {
                pd: pd.get(),
                max_wr: attr.max_wr,
                max_sge: attr.max_sge,
                queue: VecDeque::new(),
            },
        );
        Ok(RawResource::new(id))
    }

    fn destroy_srq(&self, srq: RawResource) -> io::Result<()> {
        let mut f = self.fabric.lock();
        if !f.srqs.contains_key(&srq.get()) {
            return invalid();
        }
        if f.qps.values().any(|qp| qp.srq == Some(srq.get())) {
            return from_c_err(libc::EBUSY);
        }
        f.srqs.remove(&srq.get());
        Ok(())
    }

    fn post_srq_recv(&self, srq: RawResource, wrs: &[RecvWr]) -> Result<(), PostError> {
        let mut f = self.fabric.lock();
        let Some(s) = f.srqs.get_mut(&srq.get()) else {
            return Err(PostError::new(0, libc::EINVAL));
        };
        let mut outcome = Ok(());
        for (i, wr) in wrs.iter().enumerate() {
            if wr.sg_list.len() > s.max_sge as usize {
                outcome = Err(PostError::new(i, libc::EINVAL));
                break;
            }
            if s.queue.len() >= s.max_wr as usize {
                outcome = Err(PostError::new(i, libc::ENOMEM));
                break;
            }
            s.queue.push_back(wr.clone());
        }
        engine::progress(&mut f);
        outcome
    }

    fn create_qp(&self, pd: RawResource, init: &RawQpInit) -> io::Result<RawQp> {
        let mut f = self.fabric.lock();
        let config = f.pd_context(pd.get())?.config.clone();
        let ctx_id = f.pds.get(&pd.get()).map(|p| p.ctx);

        for cq in [init.send_cq, init.recv_cq] {
            if f.cqs.get(&cq.get()).map(|c| c.ctx) != ctx_id {
                return from_c_err(libc::EINVAL);
            }
        }
        if let Some(srq) = init.srq {
            let srq_ctx = f
                .srqs
                .get(&srq.get())
                .and_then(|s| f.pds.get(&s.pd))
                .map(|p| p.ctx);
            if srq_ctx.is_none() || srq_ctx != ctx_id {
                return from_c_err(libc::EINVAL);
            }
        }

        let cap = init.cap;
        let recv_ok = init.srq.is_some()
            || (cap.max_recv_wr > 0
                && cap.max_recv_wr <= config.max_qp_wr
                && cap.max_recv_sge <= config.max_sge);
        if cap.max_send_wr == 0
            || cap.max_send_wr > config.max_qp_wr
            || cap.max_send_sge > config.max_sge
            || cap.max_inline_data > config.max_inline_data
            || !recv_ok
        {
            return from_c_err(libc::EINVAL);
        }
        let used = f
            .qps
            .values()
            .filter(|q| f.pds.get(&q.pd).map(|p| p.ctx) == ctx_id)
            .count();
        if used >= config.max_qp as usize {
            return from_c_err(libc::ENOMEM);
        }

        let id = f.alloc_id();
        let qp_num = f.alloc_qpn();
        f.qps.insert(
            id,
            SoftQp {
                pd: pd.get(),
                qp_num,
                qp_type: init.qp_type,
                send_cq: init.send_cq.get(),
                recv_cq: init.recv_cq.get(),
                srq: init.srq.map(RawResource::get),
                sq_sig_all: init.sq_sig_all,
                cap,
                state: QpState::Reset,
                access: Permission::EMPTY,
                dest_qp_num: None,
                sq: VecDeque::new(),
                rq: VecDeque::new(),
            },
        );
        f.qpns.insert(qp_num, id);
        Ok(RawQp {
            raw: RawResource::new(id),
            qp_num,
        })
    }

    fn modify_qp(&self, qp: RawResource, attr: &QpAttr, mask: QpAttrMask) -> io::Result<()> {
        let mut f = self.fabric.lock();
        let id = qp.get();
        let Some(q) = f.qps.get(&id) else {
            return invalid();
        };
        let config = f.pd_context(q.pd)?.config.clone();
        let cur = q.state;

        let target = if mask.contains(QpAttrMask::STATE) {
            QpState::try_from(attr.qp_state).or_else(|_| invalid())?
        } else {
            cur
        };
        if mask.contains(QpAttrMask::CUR_STATE) && attr.cur_qp_state != cur as u32 {
            return invalid();
        }
        use QpState::*;
        let legal = match (cur, target) {
            (_, Reset) | (_, Error) => true,
            (Reset, Init) => mask.contains(QpAttrMask::PORT),
            (Init, Init) => true,
            (Init, Rtr) => mask.contains(QpAttrMask::DEST_QPN),
            (Rtr, Rts) | (Rts, Rts) | (Rts, Sqd) | (Sqd, Sqd) | (Sqd, Rts) | (Sqe, Rts) => true,
            _ => false,
        };
        if !legal {
            log::debug!("soft: illegal QP transition {:?} -> {:?}", cur, target);
            return invalid();
        }

        if mask.contains(QpAttrMask::PORT) {
            check_port(&config, attr.port_num)?;
        }
        let access = Permission::from_bits(attr.qp_access_flags);
        if mask.contains(QpAttrMask::ACCESS_FLAGS) && access.has_unknown_bits() {
            return invalid();
        }
        if mask.contains(QpAttrMask::PATH_MTU) {
            match Mtu::try_from(attr.path_mtu) {
                Ok(mtu) if mtu <= config.port_mtu() => {}
                _ => return invalid(),
            }
        }

        let Some(q) = f.qps.get_mut(&id) else {
            return invalid();
        };
        if mask.contains(QpAttrMask::ACCESS_FLAGS) {
            q.access = access;
        }
        if mask.contains(QpAttrMask::DEST_QPN) {
            q.dest_qp_num = Some(attr.dest_qp_num);
        }
        q.state = target;

        match target {
            Reset => {
                q.sq.clear();
                q.rq.clear();
                q.dest_qp_num = None;
                q.access = Permission::EMPTY;
            }
            Error if cur != Error => engine::enter_error(&mut f, id),
            _ => {}
        }
        engine::progress(&mut f);
        Ok(())
    }

    fn query_qp_state(&self, qp: RawResource) -> io::Result<QpState> {
        let f = self.fabric.lock();
        f.qps.get(&qp.get()).map_or_else(invalid, |q| Ok(q.state))
    }

    fn destroy_qp(&self, qp: RawResource) -> io::Result<()> {
        let mut f = self.fabric.lock();
        let Some(q) = f.qps.remove(&qp.get()) else {
            return invalid();
        };
        f.qpns.remove(&q.qp_num);
        engine::progress(&mut f);
        Ok(())
    }

    fn post_send(&self, qp: RawResource, wrs: &[SendWr]) -> Result<(), PostError> {
        let mut f = self.fabric.lock();
        let id = qp.get();
        let Some(q) = f.qps.get(&id) else {
            return Err(PostError::new(0, libc::EINVAL));
        };
        let (pd, cap, state) = (q.pd, q.cap, q.state);
        if !matches!(state, QpState::Rts | QpState::Sqd | QpState::Error) {
            return Err(PostError::new(0, libc::EINVAL));
        }

        let mut outcome = Ok(());
        for (i, wr) in wrs.iter().enumerate() {
            if wr.sg_list.len() > cap.max_send_sge as usize {
                outcome = Err(PostError::new(i, libc::EINVAL));
                break;
            }
            let inline = if wr.flags.contains(SendFlags::INLINE) {
                match capture_inline(&f, pd, wr, cap.max_inline_data) {
                    Some(data) => Some(data),
                    None => {
                        outcome = Err(PostError::new(i, libc::EINVAL));
                        break;
                    }
                }
            } else {
                None
            };
            let Some(q) = f.qps.get_mut(&id) else {
                break;
            };
            if q.sq.len() >= cap.max_send_wr as usize {
                outcome = Err(PostError::new(i, libc::ENOMEM));
                break;
            }
            q.sq.push_back(PendingSend {
                wr: wr.clone(),
                inline,
            });
        }

        if state == QpState::Error {
            engine::flush(&mut f, id);
        }
        engine::progress(&mut f);
        outcome
    }

    fn post_recv(&self, qp: RawResource, wrs: &[RecvWr]) -> Result<(), PostError> {
        let mut f = self.fabric.lock();
        let id = qp.get();
        let Some(q) = f.qps.get_mut(&id) else {
            return Err(PostError::new(0, libc::EINVAL));
        };
        if q.state == QpState::Reset || q.srq.is_some() {
            return Err(PostError::new(0, libc::EINVAL));
        }

        let mut outcome = Ok(());
        for (i, wr) in wrs.iter().enumerate() {
            if wr.sg_list.len() > q.cap.max_recv_sge as usize {
                outcome = Err(PostError::new(i, libc::EINVAL));
                break;
            }
            if q.rq.len() >= q.cap.max_recv_wr as usize {
                outcome = Err(PostError::new(i, libc::ENOMEM));
                break;
            }
            q.rq.push_back(wr.clone());
        }

        if q.state == QpState::Error {
            engine::flush(&mut f, id);
        }
        engine::progress(&mut f);
        outcome
    }
}

/// Copy the payload of an inline send. Inline payloads bypass key checks,
/// but each entry must still lie within memory registered in `pd`.
fn capture_inline(f: &Fabric, pd: u64, wr: &SendWr, max_inline: u32) -> Option<Vec<u8>> {
    if wr.opcode == WrOpcode::RdmaRead || wr.opcode.is_atomic() {
        return None;
    }
    if wr.total_len() > max_inline as u64 {
        return None;
    }
    let mut data = Vec::with_capacity(wr.total_len() as usize);
    for sge in wr.sg_list.iter().filter(|s| s.length > 0) {
        let registered = f
            .mrs
            .values()
            .any(|mr| mr.pd == pd && mr.covers(sge.addr, sge.length as u64));
        if !registered {
            return None;
        }
        // SAFETY: the range lies within a registered region.
        data.extend_from_slice(unsafe {
            std::slice::from_raw_parts(sge.addr as *const u8, sge.length as usize)
        });
    }
    Some(data)
}
