use std::fmt;

use thiserror::Error;

/// Opcode of a completion queue entry.
///
/// Values follow `enum ibv_wc_opcode`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum WcOpcode {
    /// Send request.
    Send = 0,
    /// RDMA write request.
    RdmaWrite = 1,
    /// RDMA read request.
    RdmaRead = 2,
    /// RDMA compare-and-swap request.
    CompSwap = 3,
    /// RDMA fetch-and-add request.
    FetchAdd = 4,
    /// Memory window bind request.
    BindMw = 5,
    /// Receive request.
    Recv = 128,
    /// Receive request with immediate data.
    RecvRdmaImm = 129,
}

impl TryFrom<u32> for WcOpcode {
    type Error = u32;

    fn try_from(wc_opcode: u32) -> Result<Self, u32> {
        Ok(match wc_opcode {
            0 => WcOpcode::Send,
            1 => WcOpcode::RdmaWrite,
            2 => WcOpcode::RdmaRead,
            3 => WcOpcode::CompSwap,
            4 => WcOpcode::FetchAdd,
            5 => WcOpcode::BindMw,
            128 => WcOpcode::Recv,
            129 => WcOpcode::RecvRdmaImm,
            x => return Err(x),
        })
    }
}

/// Status of a completion queue entry.
///
/// Values follow `enum ibv_wc_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum WcStatus {
    /// The work request and all unsignaled work requests posted before it
    /// ended; their buffers may be reused.
    #[error("success")]
    Success = 0,

    /// A message exceeded the port's maximum message size, or a receive
    /// buffer was too small for the incoming message.
    #[error("local length error")]
    LocLenErr = 1,

    /// Internal QP consistency error, e.g. an opcode the QP's transport
    /// does not support.
    #[error("local QP operation error")]
    LocQpOpErr = 2,

    /// Unused; relevant only to RD QPs.
    #[error("local EE context operation error")]
    LocEecOpErr = 3,

    /// A scatter/gather entry does not reference a memory region valid for
    /// the requested operation.
    #[error("local protection error")]
    LocProtErr = 4,

    /// The work request was outstanding when the QP entered the error state.
    #[error("WR flush error")]
    WrFlushErr = 5,

    /// Binding a memory window failed.
    #[error("memory window bind error")]
    MwBindErr = 6,

    /// Unexpected transport opcode from the responder.
    #[error("bad response error")]
    BadRespErr = 7,

    /// Protection error on a local buffer targeted by a remote operation.
    #[error("local access error")]
    LocAccessErr = 8,

    /// The responder found the request invalid for its receive queue.
    #[error("remote invalid request error")]
    RemInvReqErr = 9,

    /// Protection error on the remote buffer of an RDMA or atomic operation.
    #[error("remote access error")]
    RemAccessErr = 10,

    /// The responder could not complete the operation.
    #[error("remote operation error")]
    RemOpErr = 11,

    /// No acknowledgement from the remote side; connection attributes are
    /// wrong or the remote QP is gone.
    #[error("transport retry counter exceeded")]
    RetryExcErr = 12,

    /// The remote side kept reporting no posted receive.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = 13,

    /// Unused; relevant only to RD QPs.
    #[error("local RDD violation error")]
    LocRddViolErr = 14,

    /// Unused; relevant only to RD QPs.
    #[error("remote invalid RD request")]
    RemInvRdReqErr = 15,

    /// The responder aborted the operation.
    #[error("remote aborted error")]
    RemAbortErr = 16,

    /// Unused; relevant only to RD QPs.
    #[error("invalid EE context number")]
    InvEecnErr = 17,

    /// Unused; relevant only to RD QPs.
    #[error("invalid EE context state error")]
    InvEecStateErr = 18,

    /// A fatal error that may not be recoverable.
    #[error("fatal error")]
    FatalErr = 19,

    /// A response timed out.
    #[error("response timeout error")]
    RespTimeoutErr = 20,

    /// Any other error.
    #[error("general error")]
    GeneralErr = 21,
}

impl TryFrom<u32> for WcStatus {
    type Error = u32;

    fn try_from(wc_status: u32) -> Result<Self, u32> {
        use WcStatus::*;
        const ALL: [WcStatus; 22] = [
            Success,
            LocLenErr,
            LocQpOpErr,
            LocEecOpErr,
            LocProtErr,
            WrFlushErr,
            MwBindErr,
            BadRespErr,
            LocAccessErr,
            RemInvReqErr,
            RemAccessErr,
            RemOpErr,
            RetryExcErr,
            RnrRetryExcErr,
            LocRddViolErr,
            RemInvRdReqErr,
            RemAbortErr,
            InvEecnErr,
            InvEecStateErr,
            FatalErr,
            RespTimeoutErr,
            GeneralErr,
        ];
        ALL.get(wc_status as usize).copied().ok_or(wc_status)
    }
}

/// Work completion flags, as in `enum ibv_wc_flags`.
pub mod wc_flags {
    pub const GRH: u32 = 1 << 0;
    pub const WITH_IMM: u32 = 1 << 1;
    pub const WITH_INV: u32 = 1 << 3;
}

/// Work completion entry.
///
/// This is the layout written by `rdmabridge_poll_cq`; status and opcode are
/// kept as raw integers and decoded on access.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Wc {
    pub wr_id: u64,
    pub status: u32,
    pub opcode: u32,
    pub vendor_err: u32,
    pub byte_len: u32,
    pub imm_data: u32,
    pub qp_num: u32,
    pub src_qp: u32,
    pub wc_flags: u32,
}

impl Wc {
    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    /// Get the completion status. Unknown driver codes decode as
    /// [`WcStatus::GeneralErr`].
    #[inline]
    pub fn status(&self) -> WcStatus {
        WcStatus::try_from(self.status).unwrap_or(WcStatus::GeneralErr)
    }

    /// Get the completion status as a `Result`.
    ///
    /// - If the status is success, return the number of bytes processed or transferred.
    /// - Otherwise, return an error.
    #[inline]
    pub fn result(&self) -> Result<usize, WcStatus> {
        match self.status() {
            WcStatus::Success => Ok(self.bytes()),
            e => Err(e),
        }
    }

    /// Get the opcode of the work request. `None` for unknown opcodes, which
    /// drivers may report on error completions.
    #[inline]
    pub fn opcode(&self) -> Option<WcOpcode> {
        WcOpcode::try_from(self.opcode).ok()
    }

    /// Get the number of bytes processed or transferred.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.byte_len as usize
    }

    /// Get the immediate data.
    #[inline]
    pub fn imm(&self) -> Option<u32> {
        (self.wc_flags & wc_flags::WITH_IMM != 0).then_some(self.imm_data)
    }

    /// Number of the QP this completion belongs to.
    #[inline]
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id())
            .field("status", &self.status())
            .field("opcode", &self.opcode())
            .field("byte_len", &self.byte_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_decode() {
        assert_eq!(WcStatus::try_from(5), Ok(WcStatus::WrFlushErr));
        assert_eq!(WcStatus::try_from(21), Ok(WcStatus::GeneralErr));
        assert_eq!(WcStatus::try_from(22), Err(22));

        let wc = Wc {
            status: 400,
            ..Default::default()
        };
        assert_eq!(wc.status(), WcStatus::GeneralErr);
        assert!(wc.result().is_err());
    }

    #[test]
    fn test_imm() {
        let mut wc = Wc {
            opcode: WcOpcode::Recv as u32,
            imm_data: 7,
            byte_len: 3,
            ..Default::default()
        };
        assert_eq!(wc.imm(), None);
        wc.wc_flags |= wc_flags::WITH_IMM;
        assert_eq!(wc.imm(), Some(7));
        assert_eq!(wc.result(), Ok(3));
        assert_eq!(wc.opcode(), Some(WcOpcode::Recv));
    }
}
