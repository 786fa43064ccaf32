use std::os::fd::RawFd;

use super::*;
use crate::driver::RawQpInit;
use crate::types::*;

impl Verbs {
    /// Create a completion channel under a context.
    pub fn create_comp_channel(&self, ctx: Handle) -> Result<Handle, VerbsError> {
        let raw_ctx = self.resolve(ctx, ResourceKind::Context)?;
        let raw = self.driver.create_comp_channel(raw_ctx)?;
        self.issue(ResourceKind::CompletionChannel, raw, &[ctx])
    }

    pub fn destroy_comp_channel(&self, channel: Handle) -> Result<(), VerbsError> {
        self.destroy(channel, ResourceKind::CompletionChannel, |d, raw| {
            d.destroy_comp_channel(raw)
        })
    }

    /// Descriptor that becomes readable when the channel has an event.
    /// It belongs to the channel; do not close it.
    pub fn comp_channel_fd(&self, channel: Handle) -> Result<RawFd, VerbsError> {
        let raw = self.resolve(channel, ResourceKind::CompletionChannel)?;
        Ok(self.driver.comp_channel_fd(raw)?)
    }

    /// Create a completion queue of at least `depth` entries.
    ///
    /// `channel` may be [`Handle::NULL`]; otherwise events of this CQ are
    /// delivered there, tagged with `cookie`. `vector` selects the
    /// completion vector.
    pub fn create_cq(
        &self,
        ctx: Handle,
        depth: u32,
        channel: Handle,
        cookie: u64,
        vector: i32,
    ) -> Result<Handle, VerbsError> {
        if depth == 0 {
            return Err(VerbsError::InvalidArgument("zero completion queue depth"));
        }
        let raw_ctx = self.resolve(ctx, ResourceKind::Context)?;
        let raw_channel = self.resolve_opt(channel, ResourceKind::CompletionChannel)?;
        let cq = self
            .driver
            .create_cq(raw_ctx, depth, raw_channel, cookie, vector)?;
        let handle = self.issue(ResourceKind::CompletionQueue, cq.raw, &[ctx, channel])?;
        self.details.insert(
            handle,
            Details::Cq {
                capacity: cq.capacity,
            },
        );
        Ok(handle)
    }

    /// Actual number of entries of a CQ, which may exceed the requested depth.
    pub fn cq_capacity(&self, cq: Handle) -> Result<u32, VerbsError> {
        self.resolve(cq, ResourceKind::CompletionQueue)?;
        match self.details.get(&cq).map(|d| *d) {
            Some(Details::Cq { capacity }) => Ok(capacity),
            _ => Err(VerbsError::InvalidHandle {
                kind: ResourceKind::CompletionQueue,
                handle: cq,
            }),
        }
    }

    pub fn destroy_cq(&self, cq: Handle) -> Result<(), VerbsError> {
        self.destroy(cq, ResourceKind::CompletionQueue, |d, raw| d.destroy_cq(raw))
    }

    /// Reap up to `wc.len()` completions without blocking. Returns how many
    /// entries were written.
    pub fn poll_cq(&self, cq: Handle, wc: &mut [Wc]) -> Result<usize, VerbsError> {
        let raw = self.resolve(cq, ResourceKind::CompletionQueue)?;
        Ok(self.driver.poll_cq(raw, wc)?)
    }

    /// Arm a CQ: its next completion (next solicited or failed completion if
    /// `solicited_only`) raises one event on its channel.
    pub fn req_notify_cq(&self, cq: Handle, solicited_only: bool) -> Result<(), VerbsError> {
        let raw = self.resolve(cq, ResourceKind::CompletionQueue)?;
        Ok(self.driver.req_notify_cq(raw, solicited_only)?)
    }

    /// Wait for the next event of a channel and return the CQ it concerns
    /// with that CQ's cookie.
    ///
    /// Blocks unless the channel descriptor was made non-blocking, in which
    /// case an empty channel fails with `EAGAIN`. Every event must be
    /// acknowledged with [`Verbs::ack_cq_events`] before the CQ is destroyed.
    pub fn get_cq_event(&self, channel: Handle) -> Result<(Handle, u64), VerbsError> {
        let raw = self.resolve(channel, ResourceKind::CompletionChannel)?;
        let event = self.driver.get_cq_event(raw)?;
        let cq = self
            .registry
            .lookup_raw(ResourceKind::CompletionQueue, event.cq)
            .ok_or(VerbsError::NullResource(ResourceKind::CompletionQueue))?;
        Ok((cq, event.cookie))
    }

    pub fn ack_cq_events(&self, cq: Handle, n: u32) -> Result<(), VerbsError> {
        let raw = self.resolve(cq, ResourceKind::CompletionQueue)?;
        self.driver.ack_cq_events(raw, n);
        Ok(())
    }

    pub fn create_srq(&self, pd: Handle, attr: &SrqInitAttr) -> Result<Handle, VerbsError> {
        let raw_pd = self.resolve(pd, ResourceKind::ProtectionDomain)?;
        let raw = self.driver.create_srq(raw_pd, attr)?;
        self.issue(ResourceKind::SharedReceiveQueue, raw, &[pd])
    }

    pub fn destroy_srq(&self, srq: Handle) -> Result<(), VerbsError> {
        self.destroy(srq, ResourceKind::SharedReceiveQueue, |d, raw| {
            d.destroy_srq(raw)
        })
    }

    /// Post receive requests to a shared receive queue.
    pub fn post_srq_recv(&self, srq: Handle, wrs: &[RecvWr]) -> Result<(), VerbsError> {
        let raw = self.resolve(srq, ResourceKind::SharedReceiveQueue)?;
        self.driver.post_srq_recv(raw, wrs).map_err(VerbsError::from)
    }

    /// Create a queue pair in the RESET state.
    pub fn create_qp(&self, pd: Handle, attr: &QpInitAttr) -> Result<Handle, VerbsError> {
        let qp_type = QpType::try_from(attr.qp_type)
            .map_err(|_| VerbsError::InvalidArgument("unsupported queue pair type"))?;
        let raw_pd = self.resolve(pd, ResourceKind::ProtectionDomain)?;
        let init = RawQpInit {
            send_cq: self.resolve(attr.send_cq, ResourceKind::CompletionQueue)?,
            recv_cq: self.resolve(attr.recv_cq, ResourceKind::CompletionQueue)?,
            srq: self.resolve_opt(attr.srq, ResourceKind::SharedReceiveQueue)?,
            qp_type,
            sq_sig_all: attr.sq_sig_all != 0,
            cap: attr.cap,
        };
        let qp = self.driver.create_qp(raw_pd, &init)?;
        let handle = self.issue(
            ResourceKind::QueuePair,
            qp.raw,
            &[pd, attr.send_cq, attr.recv_cq, attr.srq],
        )?;
        self.details.insert(
            handle,
            Details::Qp {
                qp_num: qp.qp_num,
                qp_type,
            },
        );
        Ok(handle)
    }

    /// Apply the attributes selected by `mask`, possibly changing state.
    pub fn modify_qp(&self, qp: Handle, attr: &QpAttr, mask: QpAttrMask) -> Result<(), VerbsError> {
        let raw = self.resolve(qp, ResourceKind::QueuePair)?;
        Ok(self.driver.modify_qp(raw, attr, mask)?)
    }

    fn qp_details(&self, qp: Handle) -> Result<(u32, QpType), VerbsError> {
        self.resolve(qp, ResourceKind::QueuePair)?;
        match self.details.get(&qp).map(|d| *d) {
            Some(Details::Qp { qp_num, qp_type }) => Ok((qp_num, qp_type)),
            _ => Err(VerbsError::InvalidHandle {
                kind: ResourceKind::QueuePair,
                handle: qp,
            }),
        }
    }

    /// Number peers use to address the queue pair.
    pub fn qp_num(&self, qp: Handle) -> Result<u32, VerbsError> {
        self.qp_details(qp).map(|(qp_num, _)| qp_num)
    }

    pub fn qp_type(&self, qp: Handle) -> Result<QpType, VerbsError> {
        self.qp_details(qp).map(|(_, qp_type)| qp_type)
    }

    pub fn qp_state(&self, qp: Handle) -> Result<QpState, VerbsError> {
        let raw = self.resolve(qp, ResourceKind::QueuePair)?;
        Ok(self.driver.query_qp_state(raw)?)
    }

    /// Endpoint information a peer needs to connect to this queue pair
    /// through local port `port_num`.
    pub fn endpoint(&self, qp: Handle, port_num: u8) -> Result<QpEndpoint, VerbsError> {
        let qp_num = self.qp_num(qp)?;
        let ctx = self.context_of(qp).ok_or(VerbsError::InvalidHandle {
            kind: ResourceKind::QueuePair,
            handle: qp,
        })?;
        let mut port = PortAttr::default();
        self.query_port(ctx, port_num, &mut port)?;
        let gid = self.query_gid(ctx, port_num, 0)?;
        Ok(QpEndpoint {
            qp_num,
            lid: port.lid,
            port_num,
            gid,
            mtu: port.active_mtu,
        })
    }

    /// Bring a RESET queue pair through INIT and RTR to RTS, connected to
    /// `remote`, granting the peer `access` to memory of this queue pair's
    /// protection domain.
    pub fn connect_qp(
        &self,
        qp: Handle,
        local: &QpEndpoint,
        remote: &QpEndpoint,
        access: Permission,
    ) -> Result<(), VerbsError> {
        const INIT_PSN: u32 = 0;
        let qp_type = self.qp_type(qp)?;
        let rc = qp_type == QpType::Rc;

        let init = QpAttr {
            qp_state: QpState::Init as u32,
            pkey_index: 0,
            port_num: local.port_num,
            qp_access_flags: access.bits(),
            ..Default::default()
        };
        let mask = QpAttrMask::STATE
            | QpAttrMask::PKEY_INDEX
            | QpAttrMask::PORT
            | QpAttrMask::ACCESS_FLAGS;
        self.modify_qp(qp, &init, mask)?;

        let mut rtr = QpAttr {
            qp_state: QpState::Rtr as u32,
            path_mtu: local.mtu.min(remote.mtu),
            dest_qp_num: remote.qp_num,
            rq_psn: INIT_PSN,
            dlid: remote.lid,
            port_num: local.port_num,
            // RoCE ports have no LID and must route by GID.
            is_global: (remote.lid == 0) as u8,
            dgid: remote.gid,
            sgid_index: 0,
            ..Default::default()
        };
        let mut mask = QpAttrMask::STATE
            | QpAttrMask::AV
            | QpAttrMask::PATH_MTU
            | QpAttrMask::DEST_QPN
            | QpAttrMask::RQ_PSN;
        if rc {
            rtr.max_dest_rd_atomic = 16;
            rtr.min_rnr_timer = 12;
            mask |= QpAttrMask::MAX_DEST_RD_ATOMIC | QpAttrMask::MIN_RNR_TIMER;
        }
        self.modify_qp(qp, &rtr, mask)?;

        let mut rts = QpAttr {
            qp_state: QpState::Rts as u32,
            sq_psn: INIT_PSN,
            ..Default::default()
        };
        let mut mask = QpAttrMask::STATE | QpAttrMask::SQ_PSN;
        if rc {
            rts.max_rd_atomic = 16;
            rts.timeout = 14;
            rts.retry_cnt = 6;
            // 7 means retry forever.
            rts.rnr_retry = 7;
            mask |= QpAttrMask::MAX_QP_RD_ATOMIC
                | QpAttrMask::TIMEOUT
                | QpAttrMask::RETRY_CNT
                | QpAttrMask::RNR_RETRY;
        }
        self.modify_qp(qp, &rts, mask)
    }

    pub fn destroy_qp(&self, qp: Handle) -> Result<(), VerbsError> {
        self.destroy(qp, ResourceKind::QueuePair, |d, raw| d.destroy_qp(raw))
    }

    /// Post send requests. Success means every request was accepted into the
    /// send queue; completions report the outcome. On rejection, requests
    /// before the rejected one stay posted.
    pub fn post_send(&self, qp: Handle, wrs: &[SendWr]) -> Result<(), VerbsError> {
        let raw = self.resolve(qp, ResourceKind::QueuePair)?;
        self.driver.post_send(raw, wrs).map_err(VerbsError::from)
    }

    /// Post receive requests. Same acceptance rules as [`Verbs::post_send`].
    pub fn post_recv(&self, qp: Handle, wrs: &[RecvWr]) -> Result<(), VerbsError> {
        let raw = self.resolve(qp, ResourceKind::QueuePair)?;
        self.driver.post_recv(raw, wrs).map_err(VerbsError::from)
    }
}
