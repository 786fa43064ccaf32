//! Linked work request lists as C callers build them.

use std::{ptr, slice};

use crate::error::VerbsError;
use crate::types::*;

/// Longest list accepted in one post. Guards against cyclic lists.
pub const MAX_LIST_LEN: usize = 1 << 16;

/// A send work request, linked through `next` like `struct ibv_send_wr`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RawSendWr {
    pub wr_id: u64,
    pub next: *const RawSendWr,
    pub sg_list: *const Sge,
    pub num_sge: i32,
    /// Value of [`WrOpcode`].
    pub opcode: u32,
    /// [`SendFlags`] bits.
    pub send_flags: u32,
    pub imm_data: u32,
    pub remote_addr: u64,
    pub rkey: u32,
    pub compare_add: u64,
    pub swap: u64,
}

impl Default for RawSendWr {
    fn default() -> Self {
        Self {
            wr_id: 0,
            next: ptr::null(),
            sg_list: ptr::null(),
            num_sge: 0,
            opcode: WrOpcode::Send as u32,
            send_flags: 0,
            imm_data: 0,
            remote_addr: 0,
            rkey: 0,
            compare_add: 0,
            swap: 0,
        }
    }
}

/// A receive work request, linked through `next` like `struct ibv_recv_wr`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RawRecvWr {
    pub wr_id: u64,
    pub next: *const RawRecvWr,
    pub sg_list: *const Sge,
    pub num_sge: i32,
}

impl Default for RawRecvWr {
    fn default() -> Self {
        Self {
            wr_id: 0,
            next: ptr::null(),
            sg_list: ptr::null(),
            num_sge: 0,
        }
    }
}

unsafe fn sges(list: *const Sge, num_sge: i32) -> Result<Vec<Sge>, VerbsError> {
    match num_sge {
        0 => Ok(Vec::new()),
        n if n < 0 || list.is_null() => {
            Err(VerbsError::InvalidArgument("bad scatter/gather list"))
        }
        n => Ok(slice::from_raw_parts(list, n as usize).to_vec()),
    }
}

fn too_long() -> VerbsError {
    VerbsError::InvalidArgument("work request list too long")
}

/// Walk a send list. Nothing is posted if any element is malformed.
///
/// # Safety
///
/// `head` must be null or the start of a well-formed list whose
/// scatter/gather arrays hold `num_sge` entries each.
pub unsafe fn send_list(head: *const RawSendWr) -> Result<Vec<SendWr>, VerbsError> {
    let mut out = Vec::new();
    let mut cur = head;
    while let Some(raw) = cur.as_ref() {
        if out.len() >= MAX_LIST_LEN {
            return Err(too_long());
        }
        let opcode = WrOpcode::try_from(raw.opcode)
            .map_err(|_| VerbsError::InvalidArgument("unknown send opcode"))?;
        out.push(SendWr {
            wr_id: raw.wr_id,
            opcode,
            sg_list: sges(raw.sg_list, raw.num_sge)?,
            flags: SendFlags(raw.send_flags),
            imm_data: raw.imm_data,
            remote: RemoteAddr {
                addr: raw.remote_addr,
                rkey: raw.rkey,
            },
            compare_add: raw.compare_add,
            swap: raw.swap,
        });
        cur = raw.next;
    }
    Ok(out)
}

/// Walk a receive list. Nothing is posted if any element is malformed.
///
/// # Safety
///
/// Same as [`send_list`].
pub unsafe fn recv_list(head: *const RawRecvWr) -> Result<Vec<RecvWr>, VerbsError> {
    let mut out = Vec::new();
    let mut cur = head;
    while let Some(raw) = cur.as_ref() {
        if out.len() >= MAX_LIST_LEN {
            return Err(too_long());
        }
        out.push(RecvWr {
            wr_id: raw.wr_id,
            sg_list: sges(raw.sg_list, raw.num_sge)?,
        });
        cur = raw.next;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_list() {
        let sge = [Sge::new(0x1000, 8, 3), Sge::new(0x2000, 8, 3)];
        let second = RawSendWr {
            wr_id: 2,
            opcode: WrOpcode::RdmaWrite as u32,
            sg_list: sge.as_ptr(),
            num_sge: 2,
            remote_addr: 0x9000,
            rkey: 7,
            ..Default::default()
        };
        let first = RawSendWr {
            wr_id: 1,
            next: &second,
            send_flags: SendFlags::SIGNALED.0,
            ..Default::default()
        };
        let wrs = unsafe { send_list(&first) }.unwrap();
        assert_eq!(wrs.len(), 2);
        assert_eq!(wrs[0].opcode, WrOpcode::Send);
        assert!(wrs[0].sg_list.is_empty());
        assert_eq!(wrs[1].sg_list, sge.to_vec());
        assert_eq!(wrs[1].remote, RemoteAddr { addr: 0x9000, rkey: 7 });

        assert!(unsafe { send_list(ptr::null()) }.unwrap().is_empty());
    }

    #[test]
    fn test_malformed() {
        let bad_opcode = RawSendWr {
            opcode: 42,
            ..Default::default()
        };
        assert!(unsafe { send_list(&bad_opcode) }.is_err());

        let missing_sges = RawRecvWr {
            num_sge: 1,
            ..Default::default()
        };
        assert!(unsafe { recv_list(&missing_sges) }.is_err());

        // A self-referencing list is cut off.
        let mut cyclic = RawRecvWr::default();
        cyclic.next = ptr::addr_of!(cyclic);
        let err = unsafe { recv_list(&cyclic) }.unwrap_err();
        assert_eq!(err.status(), crate::error::STATUS_FAILURE);
    }
}
