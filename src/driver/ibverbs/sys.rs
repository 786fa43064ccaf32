//! Raw `libibverbs` interfaces.
//!
//! Most of the bindings are generated by `bindgen` at build time. Structs the
//! generator mishandles (anonymous unions) are written out by hand, and the
//! data-path calls, which `verbs.h` implements as `static inline` dispatch
//! through the context's ops table, are reimplemented here.

#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(deref_nullptr)]
#![allow(clippy::missing_safety_doc)]
#![allow(unused)]

use std::io;

use libc::*;

include!(concat!(env!("OUT_DIR"), "/verbs_bindings.rs"));

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ibv_wc {
    pub wr_id: u64,
    pub status: ibv_wc_status::Type,
    pub opcode: ibv_wc_opcode::Type,
    pub vendor_err: u32,
    pub byte_len: u32,
    /// Union of `imm_data` (network order) and `invalidated_rkey`.
    pub imm_data: u32,
    pub qp_num: u32,
    pub src_qp: u32,
    pub wc_flags: c_uint,
    pub pkey_index: u16,
    pub slid: u16,
    pub sl: u8,
    pub dlid_path_bits: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct rdma_t {
    pub remote_addr: u64,
    pub rkey: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct atomic_t {
    pub remote_addr: u64,
    pub compare_add: u64,
    pub swap: u64,
    pub rkey: u32,
}

/// The `wr` union. Its `ud` member is never used here and is no larger than
/// `atomic`.
#[repr(C)]
#[derive(Clone, Copy)]
pub union wr_t {
    pub rdma: rdma_t,
    pub atomic: atomic_t,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ibv_send_wr {
    pub wr_id: u64,
    pub next: *mut Self,
    pub sg_list: *mut ibv_sge,
    pub num_sge: c_int,
    pub opcode: ibv_wr_opcode::Type,
    pub send_flags: c_uint,
    /// Union of `imm_data` (network order) and `invalidate_rkey`.
    pub imm_data: u32,
    pub wr: wr_t,
    /// Union holding `xrc.remote_srqn`.
    pub xrc_remote_srqn: u32,
    /// Storage of the `bind_mw`/`tso` union, which is never filled here.
    pub bind_mw_tso: [u64; 6],
}

fn missing_op() -> io::Error {
    io::Error::from_raw_os_error(libc::EOPNOTSUPP)
}

/// `ibv_poll_cq` through the provider's ops table: the number of entries
/// polled, negative on failure.
#[inline]
pub unsafe fn ibv_poll_cq(
    cq: *mut ibv_cq,
    num_entries: c_int,
    wc: *mut ibv_wc,
) -> io::Result<c_int> {
    let op = (*(*cq).context).ops.poll_cq.ok_or_else(missing_op)?;
    Ok(op(cq, num_entries, wc))
}

/// `ibv_req_notify_cq` through the provider's ops table.
#[inline]
pub unsafe fn ibv_req_notify_cq(cq: *mut ibv_cq, solicited_only: c_int) -> io::Result<c_int> {
    let op = (*(*cq).context).ops.req_notify_cq.ok_or_else(missing_op)?;
    Ok(op(cq, solicited_only))
}

/// `ibv_post_send` through the provider's ops table. Inline payloads are
/// copied before the op returns.
#[inline]
pub unsafe fn ibv_post_send(
    qp: *mut ibv_qp,
    wr: *mut ibv_send_wr,
    bad_wr: *mut *mut ibv_send_wr,
) -> io::Result<c_int> {
    let op = (*(*qp).context).ops.post_send.ok_or_else(missing_op)?;
    Ok(op(qp, wr, bad_wr))
}

/// `ibv_post_recv` through the provider's ops table.
#[inline]
pub unsafe fn ibv_post_recv(
    qp: *mut ibv_qp,
    wr: *mut ibv_recv_wr,
    bad_wr: *mut *mut ibv_recv_wr,
) -> io::Result<c_int> {
    let op = (*(*qp).context).ops.post_recv.ok_or_else(missing_op)?;
    Ok(op(qp, wr, bad_wr))
}

/// `ibv_post_srq_recv` through the provider's ops table.
#[inline]
pub unsafe fn ibv_post_srq_recv(
    srq: *mut ibv_srq,
    wr: *mut ibv_recv_wr,
    bad_wr: *mut *mut ibv_recv_wr,
) -> io::Result<c_int> {
    let op = (*(*srq).context).ops.post_srq_recv.ok_or_else(missing_op)?;
    Ok(op(srq, wr, bad_wr))
}
