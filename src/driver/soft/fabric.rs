//! Object tables of the software fabric.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;

use super::eventfd::EventFd;
use super::SoftDeviceConfig;
use crate::driver::CqEvent;
use crate::registry::RawResource;
use crate::types::*;
use crate::utils::interop::from_c_err;

pub(super) struct PluggedDevice {
    pub uid: u64,
    pub config: SoftDeviceConfig,
}

pub(super) struct SoftContext {
    pub device_uid: u64,
    pub config: SoftDeviceConfig,
}

pub(super) struct SoftPd {
    pub ctx: u64,
}

pub(super) struct SoftMr {
    pub pd: u64,
    pub addr: u64,
    pub len: u64,
    pub perm: Permission,
    pub lkey: u32,
    pub rkey: u32,
}

impl SoftMr {
    #[inline]
    pub fn covers(&self, addr: u64, len: u64) -> bool {
        addr >= self.addr
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= self.addr + self.len)
    }
}

pub(super) struct SoftChannel {
    pub ctx: u64,
    pub event: EventFd,
    pub pending: VecDeque<CqEvent>,
}

pub(super) struct SoftCq {
    pub ctx: u64,
    pub channel: Option<u64>,
    pub cookie: u64,
    pub capacity: u32,
    pub entries: VecDeque<Wc>,
    /// `Some(solicited_only)` while armed.
    pub armed: Option<bool>,
    pub overflowed: bool,
    /// Events handed out by `get_cq_event` and not yet acknowledged.
    pub unacked: u32,
}

pub(super) struct SoftSrq {
    pub pd: u64,
    pub max_wr: u32,
    pub max_sge: u32,
    pub queue: VecDeque<RecvWr>,
}

/// A send request waiting in a send queue. Inline payloads are captured at
/// post time so that the caller may reuse the buffer immediately.
pub(super) struct PendingSend {
    pub wr: SendWr,
    pub inline: Option<Vec<u8>>,
}

pub(super) struct SoftQp {
    pub pd: u64,
    pub qp_num: u32,
    pub qp_type: QpType,
    pub send_cq: u64,
    pub recv_cq: u64,
    pub srq: Option<u64>,
    pub sq_sig_all: bool,
    pub cap: QpCaps,
    pub state: QpState,
    pub access: Permission,
    pub dest_qp_num: Option<u32>,
    pub sq: VecDeque<PendingSend>,
    pub rq: VecDeque<RecvWr>,
}

/// Every object of one software fabric. Object ids are shared across kinds
/// and never reused; an id doubles as the object's [`RawResource`].
pub(super) struct Fabric {
    pub devices: Vec<PluggedDevice>,
    pub contexts: HashMap<u64, SoftContext>,
    pub pds: HashMap<u64, SoftPd>,
    pub mrs: HashMap<u64, SoftMr>,
    pub channels: HashMap<u64, SoftChannel>,
    pub cqs: HashMap<u64, SoftCq>,
    pub srqs: HashMap<u64, SoftSrq>,
    pub qps: HashMap<u64, SoftQp>,
    /// QP number to object id.
    pub qpns: BTreeMap<u32, u64>,
    next_id: u64,
    next_key: u32,
    next_qpn: u32,
}

const FIRST_QPN: u32 = 0x100;
const QPN_MASK: u32 = 0x00ff_ffff;

impl Fabric {
    pub fn new(devices: Vec<SoftDeviceConfig>) -> Self {
        let mut fabric = Self {
            devices: Vec::new(),
            contexts: HashMap::new(),
            pds: HashMap::new(),
            mrs: HashMap::new(),
            channels: HashMap::new(),
            cqs: HashMap::new(),
            srqs: HashMap::new(),
            qps: HashMap::new(),
            qpns: BTreeMap::new(),
            next_id: 1,
            next_key: 0x1000,
            next_qpn: FIRST_QPN,
        };
        for config in devices {
            fabric.plug(config);
        }
        fabric
    }

    pub fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn alloc_key(&mut self) -> u32 {
        let key = self.next_key;
        self.next_key = self.next_key.wrapping_add(1).max(1);
        key
    }

    pub fn alloc_qpn(&mut self) -> u32 {
        loop {
            let qpn = self.next_qpn;
            self.next_qpn = (self.next_qpn + 1) & QPN_MASK;
            if self.next_qpn == 0 {
                self.next_qpn = FIRST_QPN;
            }
            if !self.qpns.contains_key(&qpn) {
                return qpn;
            }
        }
    }

    pub fn plug(&mut self, config: SoftDeviceConfig) -> u64 {
        let uid = self.alloc_id();
        self.devices.push(PluggedDevice { uid, config });
        uid
    }

    pub fn unplug(&mut self, name: &str) -> bool {
        let before = self.devices.len();
        self.devices.retain(|d| d.config.name != name);
        self.devices.len() != before
    }

    pub fn context(&self, ctx: RawResource) -> io::Result<&SoftContext> {
        self.contexts.get(&ctx.get()).map_or_else(invalid, Ok)
    }

    /// Context that owns a protection domain.
    pub fn pd_context(&self, pd: u64) -> io::Result<&SoftContext> {
        let pd = self.pds.get(&pd).map_or_else(invalid, Ok)?;
        self.contexts.get(&pd.ctx).map_or_else(invalid, Ok)
    }

    pub fn qp_by_num(&self, qp_num: u32) -> Option<u64> {
        self.qpns.get(&qp_num).copied()
    }

    /// Find the region of `pd` registered under `lkey` that covers the range.
    pub fn local_mr(&self, pd: u64, sge: &Sge) -> Option<&SoftMr> {
        self.mrs
            .values()
            .find(|mr| mr.pd == pd && mr.lkey == sge.lkey && mr.covers(sge.addr, sge.length as u64))
    }

    /// Find the region of `pd` registered under `rkey` that covers the range.
    pub fn remote_mr(&self, pd: u64, rkey: u32, addr: u64, len: u64) -> Option<&SoftMr> {
        self.mrs
            .values()
            .find(|mr| mr.pd == pd && mr.rkey == rkey && mr.covers(addr, len))
    }

    pub fn count_in_ctx(&self, ctx: u64) -> CtxUsage {
        CtxUsage {
            pds: self.pds.values().filter(|p| p.ctx == ctx).count(),
            cqs: self.cqs.values().filter(|c| c.ctx == ctx).count(),
            channels: self.channels.values().filter(|c| c.ctx == ctx).count(),
        }
    }

    pub fn count_in_pd(&self, pd: u64) -> PdUsage {
        PdUsage {
            mrs: self.mrs.values().filter(|m| m.pd == pd).count(),
            srqs: self.srqs.values().filter(|s| s.pd == pd).count(),
            qps: self.qps.values().filter(|q| q.pd == pd).count(),
        }
    }

    /// Append a completion to a CQ and raise an event if the CQ is armed for
    /// it. A full CQ overflows and the completion is lost.
    pub fn complete(&mut self, cq_id: u64, wc: Wc, solicited: bool) {
        let Some(cq) = self.cqs.get_mut(&cq_id) else {
            return;
        };
        if cq.entries.len() >= cq.capacity as usize {
            if !cq.overflowed {
                log::warn!("soft: completion queue {:#x} overflowed", cq_id);
            }
            cq.overflowed = true;
            return;
        }
        let failed = wc.status != WcStatus::Success as u32;
        cq.entries.push_back(wc);

        let fire = match cq.armed {
            Some(solicited_only) => !solicited_only || solicited || failed,
            None => false,
        };
        if !fire {
            return;
        }
        cq.armed = None;
        let (channel, cookie) = (cq.channel, cq.cookie);
        if let Some(ch) = channel.and_then(|ch| self.channels.get_mut(&ch)) {
            ch.pending.push_back(CqEvent {
                cq: RawResource::new(cq_id),
                cookie,
            });
            if let Err(e) = ch.event.signal() {
                log::warn!("soft: cannot signal completion channel: {}", e);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct CtxUsage {
    pub pds: usize,
    pub cqs: usize,
    pub channels: usize,
}

impl CtxUsage {
    pub fn total(&self) -> usize {
        self.pds + self.cqs + self.channels
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct PdUsage {
    pub mrs: usize,
    pub srqs: usize,
    pub qps: usize,
}

impl PdUsage {
    pub fn total(&self) -> usize {
        self.mrs + self.srqs + self.qps
    }
}

/// `EINVAL` for a native identity the fabric does not know.
pub(super) fn invalid<T>() -> io::Result<T> {
    from_c_err(libc::EINVAL)
}
