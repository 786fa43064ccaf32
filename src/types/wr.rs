//! Work requests.

use std::ops::{BitOr, BitOrAssign};

/// Scatter/gather entry. Same layout as `struct ibv_sge`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

impl Sge {
    pub fn new(addr: u64, length: u32, lkey: u32) -> Self {
        Self { addr, length, lkey }
    }
}

/// Send-side opcode, as in `enum ibv_wr_opcode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum WrOpcode {
    RdmaWrite = 0,
    RdmaWriteWithImm = 1,
    Send = 2,
    SendWithImm = 3,
    RdmaRead = 4,
    AtomicCmpAndSwp = 5,
    AtomicFetchAndAdd = 6,
}

impl WrOpcode {
    /// Whether the opcode consumes a receive request at the responder.
    #[inline]
    pub fn consumes_recv(self) -> bool {
        matches!(
            self,
            WrOpcode::Send | WrOpcode::SendWithImm | WrOpcode::RdmaWriteWithImm
        )
    }

    /// Whether the opcode carries immediate data.
    #[inline]
    pub fn has_imm(self) -> bool {
        matches!(self, WrOpcode::SendWithImm | WrOpcode::RdmaWriteWithImm)
    }

    /// Whether the opcode is an atomic.
    #[inline]
    pub fn is_atomic(self) -> bool {
        matches!(self, WrOpcode::AtomicCmpAndSwp | WrOpcode::AtomicFetchAndAdd)
    }
}

impl TryFrom<u32> for WrOpcode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        Ok(match value {
            0 => WrOpcode::RdmaWrite,
            1 => WrOpcode::RdmaWriteWithImm,
            2 => WrOpcode::Send,
            3 => WrOpcode::SendWithImm,
            4 => WrOpcode::RdmaRead,
            5 => WrOpcode::AtomicCmpAndSwp,
            6 => WrOpcode::AtomicFetchAndAdd,
            x => return Err(x),
        })
    }
}

/// Send flags, as in `enum ibv_send_flags`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct SendFlags(pub u32);

impl SendFlags {
    pub const FENCE: Self = Self(1 << 0);
    pub const SIGNALED: Self = Self(1 << 1);
    pub const SOLICITED: Self = Self(1 << 2);
    pub const INLINE: Self = Self(1 << 3);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SendFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SendFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Remote memory addressed by RDMA and atomic requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteAddr {
    pub addr: u64,
    pub rkey: u32,
}

/// A send-side work request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendWr {
    pub wr_id: u64,
    pub opcode: WrOpcode,
    pub sg_list: Vec<Sge>,
    pub flags: SendFlags,
    pub imm_data: u32,
    /// Target of RDMA and atomic opcodes; ignored for sends.
    pub remote: RemoteAddr,
    /// Compare value (CAS) or addend (FAA).
    pub compare_add: u64,
    /// Swap value (CAS).
    pub swap: u64,
}

impl SendWr {
    fn with(wr_id: u64, opcode: WrOpcode, sg_list: &[Sge]) -> Self {
        Self {
            wr_id,
            opcode,
            sg_list: sg_list.to_vec(),
            flags: SendFlags::SIGNALED,
            imm_data: 0,
            remote: RemoteAddr::default(),
            compare_add: 0,
            swap: 0,
        }
    }

    /// Signaled two-sided send.
    pub fn send(wr_id: u64, sg_list: &[Sge]) -> Self {
        Self::with(wr_id, WrOpcode::Send, sg_list)
    }

    /// Signaled two-sided send carrying immediate data.
    pub fn send_with_imm(wr_id: u64, sg_list: &[Sge], imm: u32) -> Self {
        Self {
            imm_data: imm,
            ..Self::with(wr_id, WrOpcode::SendWithImm, sg_list)
        }
    }

    /// Signaled RDMA write.
    pub fn write(wr_id: u64, sg_list: &[Sge], remote: RemoteAddr) -> Self {
        Self {
            remote,
            ..Self::with(wr_id, WrOpcode::RdmaWrite, sg_list)
        }
    }

    /// Signaled RDMA write with immediate, consuming a receive at the peer.
    pub fn write_with_imm(wr_id: u64, sg_list: &[Sge], remote: RemoteAddr, imm: u32) -> Self {
        Self {
            remote,
            imm_data: imm,
            ..Self::with(wr_id, WrOpcode::RdmaWriteWithImm, sg_list)
        }
    }

    /// Signaled RDMA read.
    pub fn read(wr_id: u64, sg_list: &[Sge], remote: RemoteAddr) -> Self {
        Self {
            remote,
            ..Self::with(wr_id, WrOpcode::RdmaRead, sg_list)
        }
    }

    /// Signaled 8-byte compare-and-swap. The original value lands in `sge`.
    pub fn compare_swap(wr_id: u64, sge: Sge, remote: RemoteAddr, compare: u64, swap: u64) -> Self {
        Self {
            remote,
            compare_add: compare,
            swap,
            ..Self::with(wr_id, WrOpcode::AtomicCmpAndSwp, &[sge])
        }
    }

    /// Signaled 8-byte fetch-and-add. The original value lands in `sge`.
    pub fn fetch_add(wr_id: u64, sge: Sge, remote: RemoteAddr, add: u64) -> Self {
        Self {
            remote,
            compare_add: add,
            ..Self::with(wr_id, WrOpcode::AtomicFetchAndAdd, &[sge])
        }
    }

    /// Replace the send flags.
    pub fn flags(mut self, flags: SendFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Total number of bytes described by the scatter/gather list.
    pub fn total_len(&self) -> u64 {
        self.sg_list.iter().map(|s| s.length as u64).sum()
    }
}

/// A receive-side work request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sg_list: Vec<Sge>,
}

impl RecvWr {
    pub fn new(wr_id: u64, sg_list: &[Sge]) -> Self {
        Self {
            wr_id,
            sg_list: sg_list.to_vec(),
        }
    }

    /// Total capacity of the scatter/gather list.
    pub fn total_len(&self) -> u64 {
        self.sg_list.iter().map(|s| s.length as u64).sum()
    }
}
