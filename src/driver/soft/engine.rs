//! Execution of queued send requests.
//!
//! The engine runs inside the fabric lock after every call that can unblock a
//! send queue. Each pass walks the queue pairs in QP-number order and
//! executes send requests from the head of each queue until one blocks. A
//! request blocks only when it needs a receive request at an RC peer that
//! has none posted; it then stays at the head of its queue, keeping the
//! queue in order, until a receive is posted.

use std::{ptr, slice};

use super::fabric::{Fabric, PendingSend};
use crate::types::*;

/// Largest message the fabric carries.
pub(super) const MAX_MSG_SZ: u64 = 1 << 31;

enum Outcome {
    /// The request finished; the completion carries this many bytes.
    Done(u32),
    /// No receive request is available at the RC peer.
    Blocked,
    /// The request failed with this status.
    Failed(WcStatus),
}

/// Run every runnable send queue until nothing moves.
pub(super) fn progress(f: &mut Fabric) {
    loop {
        let mut runnable: Vec<(u32, u64)> = f
            .qps
            .iter()
            .filter(|(_, qp)| qp.state == QpState::Rts && !qp.sq.is_empty())
            .map(|(id, qp)| (qp.qp_num, *id))
            .collect();
        runnable.sort_unstable();

        let mut advanced = false;
        for (_, id) in runnable {
            while step(f, id) {
                advanced = true;
            }
        }
        if !advanced {
            break;
        }
    }
}

/// Move a QP to the error state and flush both of its queues.
pub(super) fn enter_error(f: &mut Fabric, qp_id: u64) {
    if let Some(qp) = f.qps.get_mut(&qp_id) {
        if qp.state != QpState::Error {
            log::debug!("soft: QP {:#x} enters the error state", qp.qp_num);
        }
        qp.state = QpState::Error;
    }
    flush(f, qp_id);
}

/// Complete every queued request of a QP with `WR_FLUSH_ERR`. Requests on a
/// shared receive queue are not flushed.
pub(super) fn flush(f: &mut Fabric, qp_id: u64) {
    let Some(qp) = f.qps.get_mut(&qp_id) else {
        return;
    };
    let sends: Vec<PendingSend> = qp.sq.drain(..).collect();
    let recvs: Vec<RecvWr> = qp.rq.drain(..).collect();
    let (qp_num, send_cq, recv_cq) = (qp.qp_num, qp.send_cq, qp.recv_cq);

    for s in sends {
        let wc = Wc {
            wr_id: s.wr.wr_id,
            status: WcStatus::WrFlushErr as u32,
            opcode: send_wc_opcode(s.wr.opcode) as u32,
            qp_num,
            ..Default::default()
        };
        f.complete(send_cq, wc, false);
    }
    for r in recvs {
        let wc = Wc {
            wr_id: r.wr_id,
            status: WcStatus::WrFlushErr as u32,
            opcode: WcOpcode::Recv as u32,
            qp_num,
            ..Default::default()
        };
        f.complete(recv_cq, wc, false);
    }
}

/// Execute the head of one send queue. Returns whether it was consumed.
fn step(f: &mut Fabric, qp_id: u64) -> bool {
    let Some(qp) = f.qps.get_mut(&qp_id) else {
        return false;
    };
    if qp.state != QpState::Rts {
        return false;
    }
    let Some(pending) = qp.sq.pop_front() else {
        return false;
    };

    let outcome = execute(f, qp_id, &pending);
    let Some(qp) = f.qps.get_mut(&qp_id) else {
        return false;
    };
    let (qp_num, send_cq) = (qp.qp_num, qp.send_cq);
    let signaled = qp.sq_sig_all || pending.wr.flags.contains(SendFlags::SIGNALED);

    let mut wc = Wc {
        wr_id: pending.wr.wr_id,
        opcode: send_wc_opcode(pending.wr.opcode) as u32,
        qp_num,
        ..Default::default()
    };
    match outcome {
        Outcome::Blocked => {
            qp.sq.push_front(pending);
            false
        }
        Outcome::Done(byte_len) => {
            if signaled {
                wc.byte_len = byte_len;
                f.complete(send_cq, wc, false);
            }
            true
        }
        Outcome::Failed(status) => {
            log::debug!(
                "soft: QP {:#x} request {} failed: {}",
                qp_num,
                pending.wr.wr_id,
                status
            );
            wc.status = status as u32;
            f.complete(send_cq, wc, false);
            enter_error(f, qp_id);
            true
        }
    }
}

fn send_wc_opcode(op: WrOpcode) -> WcOpcode {
    match op {
        WrOpcode::Send | WrOpcode::SendWithImm => WcOpcode::Send,
        WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm => WcOpcode::RdmaWrite,
        WrOpcode::RdmaRead => WcOpcode::RdmaRead,
        WrOpcode::AtomicCmpAndSwp => WcOpcode::CompSwap,
        WrOpcode::AtomicFetchAndAdd => WcOpcode::FetchAdd,
    }
}

/// What the sender sees when its peer cannot take a request: RC retries
/// (and blocks or fails), UC silently drops.
fn lost(qp_type: QpType, len: u32, rc: Outcome) -> Outcome {
    match qp_type {
        QpType::Rc => rc,
        QpType::Uc => Outcome::Done(len),
    }
}

fn execute(f: &mut Fabric, qp_id: u64, pending: &PendingSend) -> Outcome {
    let Some(qp) = f.qps.get(&qp_id) else {
        return Outcome::Failed(WcStatus::FatalErr);
    };
    let wr = &pending.wr;
    let (pd, qp_num, qp_type, dest) = (qp.pd, qp.qp_num, qp.qp_type, qp.dest_qp_num);

    if qp_type == QpType::Uc && (wr.opcode == WrOpcode::RdmaRead || wr.opcode.is_atomic()) {
        return Outcome::Failed(WcStatus::LocQpOpErr);
    }

    // Local buffers. Inline payloads were captured and checked at post time.
    if pending.inline.is_none() {
        let writes_local = wr.opcode == WrOpcode::RdmaRead || wr.opcode.is_atomic();
        for sge in &wr.sg_list {
            match f.local_mr(pd, sge) {
                Some(mr) if !writes_local || mr.perm.contains(Permission::LOCAL_WRITE) => {}
                _ => return Outcome::Failed(WcStatus::LocProtErr),
            }
        }
    }
    let total = match &pending.inline {
        Some(data) => data.len() as u64,
        None => wr.total_len(),
    };
    if total > MAX_MSG_SZ {
        return Outcome::Failed(WcStatus::LocLenErr);
    }
    let len = total as u32;

    // The peer must be connected back to us and able to receive.
    let peer_id = dest.and_then(|n| f.qp_by_num(n)).filter(|id| {
        f.qps.get(id).is_some_and(|p| {
            matches!(p.state, QpState::Rtr | QpState::Rts)
                && p.qp_type == qp_type
                && (qp_type == QpType::Uc || p.dest_qp_num == Some(qp_num))
        })
    });
    let Some(peer_id) = peer_id else {
        return lost(qp_type, len, Outcome::Failed(WcStatus::RetryExcErr));
    };

    match wr.opcode {
        WrOpcode::Send | WrOpcode::SendWithImm => deliver(f, qp_id, peer_id, pending, len),
        WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm => write(f, qp_id, peer_id, pending, len),
        WrOpcode::RdmaRead => read(f, peer_id, wr, len),
        WrOpcode::AtomicCmpAndSwp | WrOpcode::AtomicFetchAndAdd => atomic(f, peer_id, wr),
    }
}

fn has_recv(f: &Fabric, peer_id: u64) -> bool {
    let Some(peer) = f.qps.get(&peer_id) else {
        return false;
    };
    match peer.srq {
        Some(srq) => f.srqs.get(&srq).is_some_and(|s| !s.queue.is_empty()),
        None => !peer.rq.is_empty(),
    }
}

fn take_recv(f: &mut Fabric, peer_id: u64) -> Option<RecvWr> {
    let peer = f.qps.get_mut(&peer_id)?;
    match peer.srq {
        Some(srq) => f.srqs.get_mut(&srq)?.queue.pop_front(),
        None => peer.rq.pop_front(),
    }
}

/// Post a receive completion at the peer. Error completions move the peer
/// to the error state.
fn complete_recv(f: &mut Fabric, peer_id: u64, mut wc: Wc, solicited: bool) {
    let Some(peer) = f.qps.get(&peer_id) else {
        return;
    };
    wc.qp_num = peer.qp_num;
    let recv_cq = peer.recv_cq;
    let failed = wc.status != WcStatus::Success as u32;
    f.complete(recv_cq, wc, solicited);
    if failed {
        enter_error(f, peer_id);
    }
}

fn deliver(f: &mut Fabric, qp_id: u64, peer_id: u64, pending: &PendingSend, len: u32) -> Outcome {
    let wr = &pending.wr;
    let Some(qp) = f.qps.get(&qp_id) else {
        return Outcome::Failed(WcStatus::FatalErr);
    };
    let (qp_num, qp_type) = (qp.qp_num, qp.qp_type);

    let Some(recv) = take_recv(f, peer_id) else {
        return lost(qp_type, len, Outcome::Blocked);
    };
    let Some(peer_pd) = f.qps.get(&peer_id).map(|p| p.pd) else {
        return Outcome::Failed(WcStatus::FatalErr);
    };

    let mut wc = Wc {
        wr_id: recv.wr_id,
        opcode: WcOpcode::Recv as u32,
        src_qp: qp_num,
        ..Default::default()
    };
    let writable = recv.sg_list.iter().all(|sge| {
        f.local_mr(peer_pd, sge)
            .is_some_and(|mr| mr.perm.contains(Permission::LOCAL_WRITE))
    });
    if !writable {
        wc.status = WcStatus::LocProtErr as u32;
        complete_recv(f, peer_id, wc, false);
        return lost(qp_type, len, Outcome::Failed(WcStatus::RemOpErr));
    }
    if recv.total_len() < len as u64 {
        wc.status = WcStatus::LocLenErr as u32;
        complete_recv(f, peer_id, wc, false);
        return lost(qp_type, len, Outcome::Failed(WcStatus::RemInvReqErr));
    }

    // SAFETY: every source and destination range lies within a registered
    // region, which stays valid until deregistered.
    unsafe {
        let data = gather(pending);
        scatter(&recv.sg_list, &data);
    }

    wc.byte_len = len;
    if wr.opcode.has_imm() {
        wc.imm_data = wr.imm_data;
        wc.wc_flags |= wc_flags::WITH_IMM;
    }
    complete_recv(f, peer_id, wc, wr.flags.contains(SendFlags::SOLICITED));
    Outcome::Done(len)
}

fn write(f: &mut Fabric, qp_id: u64, peer_id: u64, pending: &PendingSend, len: u32) -> Outcome {
    let wr = &pending.wr;
    let (Some(qp), Some(peer)) = (f.qps.get(&qp_id), f.qps.get(&peer_id)) else {
        return Outcome::Failed(WcStatus::FatalErr);
    };
    let (qp_num, qp_type) = (qp.qp_num, qp.qp_type);

    let allowed = peer.access.contains(Permission::REMOTE_WRITE)
        && f
            .remote_mr(peer.pd, wr.remote.rkey, wr.remote.addr, len as u64)
            .is_some_and(|mr| mr.perm.contains(Permission::REMOTE_WRITE));
    if !allowed {
        return lost(qp_type, len, Outcome::Failed(WcStatus::RemAccessErr));
    }
    if wr.opcode.consumes_recv() && !has_recv(f, peer_id) {
        return lost(qp_type, len, Outcome::Blocked);
    }

    // SAFETY: both ranges were checked against registered regions.
    unsafe {
        let data = gather(pending);
        ptr::copy(data.as_ptr(), wr.remote.addr as *mut u8, data.len());
    }

    if wr.opcode.consumes_recv() {
        if let Some(recv) = take_recv(f, peer_id) {
            let wc = Wc {
                wr_id: recv.wr_id,
                opcode: WcOpcode::RecvRdmaImm as u32,
                byte_len: len,
                imm_data: wr.imm_data,
                src_qp: qp_num,
                wc_flags: wc_flags::WITH_IMM,
                ..Default::default()
            };
            complete_recv(f, peer_id, wc, wr.flags.contains(SendFlags::SOLICITED));
        }
    }
    Outcome::Done(len)
}

fn read(f: &mut Fabric, peer_id: u64, wr: &SendWr, len: u32) -> Outcome {
    let Some(peer) = f.qps.get(&peer_id) else {
        return Outcome::Failed(WcStatus::FatalErr);
    };
    let allowed = peer.access.contains(Permission::REMOTE_READ)
        && f
            .remote_mr(peer.pd, wr.remote.rkey, wr.remote.addr, len as u64)
            .is_some_and(|mr| mr.perm.contains(Permission::REMOTE_READ));
    if !allowed {
        return Outcome::Failed(WcStatus::RemAccessErr);
    }

    // SAFETY: both ranges were checked against registered regions.
    unsafe {
        let data = slice::from_raw_parts(wr.remote.addr as *const u8, len as usize).to_vec();
        scatter(&wr.sg_list, &data);
    }
    Outcome::Done(len)
}

fn atomic(f: &mut Fabric, peer_id: u64, wr: &SendWr) -> Outcome {
    let [sge] = wr.sg_list.as_slice() else {
        return Outcome::Failed(WcStatus::LocLenErr);
    };
    if sge.length != 8 {
        return Outcome::Failed(WcStatus::LocLenErr);
    }
    if wr.remote.addr % 8 != 0 {
        return Outcome::Failed(WcStatus::RemInvReqErr);
    }
    let Some(peer) = f.qps.get(&peer_id) else {
        return Outcome::Failed(WcStatus::FatalErr);
    };
    let allowed = peer.access.contains(Permission::REMOTE_ATOMIC)
        && f
            .remote_mr(peer.pd, wr.remote.rkey, wr.remote.addr, 8)
            .is_some_and(|mr| mr.perm.contains(Permission::REMOTE_ATOMIC));
    if !allowed {
        return Outcome::Failed(WcStatus::RemAccessErr);
    }

    let target = wr.remote.addr as *mut u64;
    // SAFETY: the target is an aligned 8-byte range of a registered region
    // and the local entry is an 8-byte range of a writable registered region.
    // The fabric lock serialises every atomic of this fabric.
    unsafe {
        let old = ptr::read(target);
        let new = match wr.opcode {
            WrOpcode::AtomicCmpAndSwp if old == wr.compare_add => wr.swap,
            WrOpcode::AtomicCmpAndSwp => old,
            _ => old.wrapping_add(wr.compare_add),
        };
        ptr::write(target, new);
        ptr::write_unaligned(sge.addr as *mut u64, old);
    }
    Outcome::Done(8)
}

/// Collect the payload of a send request.
///
/// # Safety
///
/// Unless the payload is inline, every entry must lie in valid memory.
unsafe fn gather(pending: &PendingSend) -> Vec<u8> {
    if let Some(data) = &pending.inline {
        return data.clone();
    }
    let mut buf = Vec::with_capacity(pending.wr.total_len() as usize);
    for sge in pending.wr.sg_list.iter().filter(|s| s.length > 0) {
        buf.extend_from_slice(slice::from_raw_parts(
            sge.addr as *const u8,
            sge.length as usize,
        ));
    }
    buf
}

/// Spread `data` over a scatter list, in order.
///
/// # Safety
///
/// Every entry must lie in valid writable memory.
unsafe fn scatter(sges: &[Sge], data: &[u8]) {
    let mut offset = 0;
    for sge in sges {
        if offset >= data.len() {
            break;
        }
        let n = (sge.length as usize).min(data.len() - offset);
        ptr::copy(data[offset..].as_ptr(), sge.addr as *mut u8, n);
        offset += n;
    }
}
