//! Queue pair and shared receive queue attributes.

use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::registry::Handle;

/// Queue pair type, as in `enum ibv_qp_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum QpType {
    /// Reliable connection.
    Rc = 2,
    /// Unreliable connection.
    Uc = 3,
}

impl TryFrom<u32> for QpType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            2 => Ok(QpType::Rc),
            3 => Ok(QpType::Uc),
            x => Err(x),
        }
    }
}

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum QpState {
    /// Reset.
    Reset = 0,

    /// Initialized.
    Init = 1,

    /// Ready To Receive.
    Rtr = 2,

    /// Ready To Send.
    Rts = 3,

    /// Send Queue Drain.
    Sqd = 4,

    /// Send Queue Error.
    Sqe = 5,

    /// Error.
    Error = 6,
}

impl TryFrom<u32> for QpState {
    type Error = u32;

    fn try_from(qp_state: u32) -> Result<Self, u32> {
        Ok(match qp_state {
            0 => QpState::Reset,
            1 => QpState::Init,
            2 => QpState::Rtr,
            3 => QpState::Rts,
            4 => QpState::Sqd,
            5 => QpState::Sqe,
            6 => QpState::Error,
            x => return Err(x),
        })
    }
}

/// Queue pair capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

impl Default for QpCaps {
    fn default() -> Self {
        Self {
            max_send_wr: 128,
            max_recv_wr: 128,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        }
    }
}

/// Queue pair creation attributes.
///
/// CQs and the SRQ are given as registry handles; `srq` is [`Handle::NULL`]
/// when the QP has its own receive queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct QpInitAttr {
    pub send_cq: Handle,
    pub recv_cq: Handle,
    pub srq: Handle,
    /// Value of [`QpType`].
    pub qp_type: u32,
    /// Non-zero to generate a completion for every send request.
    pub sq_sig_all: u32,
    pub cap: QpCaps,
}

impl QpInitAttr {
    /// RC queue pair with both sides completing into `cq`.
    pub fn rc(cq: Handle) -> Self {
        Self::new(QpType::Rc, cq, cq)
    }

    /// Queue pair with separate send and receive CQs.
    pub fn new(qp_type: QpType, send_cq: Handle, recv_cq: Handle) -> Self {
        Self {
            send_cq,
            recv_cq,
            srq: Handle::NULL,
            qp_type: qp_type as u32,
            sq_sig_all: 0,
            cap: QpCaps::default(),
        }
    }

    /// Attach a shared receive queue.
    pub fn with_srq(mut self, srq: Handle) -> Self {
        self.srq = srq;
        self
    }

    /// Signal every send request.
    pub fn signal_all(mut self) -> Self {
        self.sq_sig_all = 1;
        self
    }

    /// Override the capabilities.
    pub fn with_caps(mut self, cap: QpCaps) -> Self {
        self.cap = cap;
        self
    }
}

/// Mask of the [`QpAttr`] fields a `modify_qp` call applies.
///
/// Bit values follow `enum ibv_qp_attr_mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct QpAttrMask(pub u32);

impl QpAttrMask {
    pub const STATE: Self = Self(1 << 0);
    pub const CUR_STATE: Self = Self(1 << 1);
    pub const EN_SQD_ASYNC_NOTIFY: Self = Self(1 << 2);
    pub const ACCESS_FLAGS: Self = Self(1 << 3);
    pub const PKEY_INDEX: Self = Self(1 << 4);
    pub const PORT: Self = Self(1 << 5);
    pub const QKEY: Self = Self(1 << 6);
    pub const AV: Self = Self(1 << 7);
    pub const PATH_MTU: Self = Self(1 << 8);
    pub const TIMEOUT: Self = Self(1 << 9);
    pub const RETRY_CNT: Self = Self(1 << 10);
    pub const RNR_RETRY: Self = Self(1 << 11);
    pub const RQ_PSN: Self = Self(1 << 12);
    pub const MAX_QP_RD_ATOMIC: Self = Self(1 << 13);
    pub const ALT_PATH: Self = Self(1 << 14);
    pub const MIN_RNR_TIMER: Self = Self(1 << 15);
    pub const SQ_PSN: Self = Self(1 << 16);
    pub const MAX_DEST_RD_ATOMIC: Self = Self(1 << 17);
    pub const PATH_MIG_STATE: Self = Self(1 << 18);
    pub const CAP: Self = Self(1 << 19);
    pub const DEST_QPN: Self = Self(1 << 20);

    /// Whether every bit of `other` is set.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for QpAttrMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for QpAttrMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Queue pair modification attributes. Only the fields selected by the
/// accompanying [`QpAttrMask`] are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct QpAttr {
    /// Value of [`QpState`].
    pub qp_state: u32,
    /// Value of [`QpState`].
    pub cur_qp_state: u32,
    /// Value of [`Mtu`](crate::types::Mtu).
    pub path_mtu: u32,
    /// [`Permission`](crate::types::Permission) bits for remote access.
    pub qp_access_flags: u32,
    pub qkey: u32,
    pub rq_psn: u32,
    pub sq_psn: u32,
    pub dest_qp_num: u32,
    pub dlid: u16,
    pub port_num: u8,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub min_rnr_timer: u8,
    pub max_rd_atomic: u8,
    pub max_dest_rd_atomic: u8,
    pub sgid_index: u8,
    pub is_global: u8,
    pub pkey_index: u8,
    pub dgid: [u8; 16],
}

impl QpAttr {
    /// Attributes that only change the state.
    pub fn state(state: QpState) -> Self {
        Self {
            qp_state: state as u32,
            ..Default::default()
        }
    }
}

/// Shared receive queue creation attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SrqInitAttr {
    pub max_wr: u32,
    pub max_sge: u32,
    pub srq_limit: u32,
}

impl Default for SrqInitAttr {
    fn default() -> Self {
        Self {
            max_wr: 256,
            max_sge: 1,
            srq_limit: 0,
        }
    }
}

/// What a peer needs to know to connect to a queue pair.
///
/// The exchange itself happens outside this crate (TCP, RDMA CM, a shared
/// file); this type is serialisable for that purpose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct QpEndpoint {
    pub qp_num: u32,
    pub lid: u16,
    pub port_num: u8,
    pub gid: [u8; 16],
    /// Value of [`Mtu`](crate::types::Mtu).
    pub mtu: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask() {
        let mask = QpAttrMask::STATE | QpAttrMask::DEST_QPN;
        assert!(mask.contains(QpAttrMask::STATE));
        assert!(!mask.contains(QpAttrMask::PORT));
        assert_eq!(mask.0, 1 | (1 << 20));
    }

    #[test]
    fn test_state_decode() {
        assert_eq!(QpState::try_from(3), Ok(QpState::Rts));
        assert_eq!(QpState::try_from(9), Err(9));
        assert_eq!(QpType::try_from(2), Ok(QpType::Rc));
        assert_eq!(QpType::try_from(4), Err(4));
    }
}
