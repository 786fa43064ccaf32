mod common;

use anyhow::Result;
use common::{status, Loopback};
use rdmabridge::prelude::*;

#[test]
fn test_sends_complete_in_order() -> Result<()> {
    let lo = Loopback::new(QpType::Rc)?;
    let mut src = *b"AAAABBBBCCCC";
    let mut dst = [0u8; 12];
    let smr = lo.reg(&mut src)?;
    let dmr = lo.reg(&mut dst)?;

    let recvs: Vec<RecvWr> = (0..3)
        .map(|i| RecvWr::new(10 + i, &[dmr.sge(4 * i, 4).unwrap()]))
        .collect();
    lo.verbs.post_recv(lo.b, &recvs)?;

    let sends: Vec<SendWr> = (0..3)
        .map(|i| SendWr::send(i, &[smr.sge(4 * i, 4).unwrap()]))
        .collect();
    lo.verbs.post_send(lo.a, &sends)?;

    let wcs = lo.poll()?;
    let a_num = lo.verbs.qp_num(lo.a)?;
    let sent: Vec<u64> = wcs
        .iter()
        .filter(|wc| wc.qp_num() == a_num)
        .map(|wc| wc.wr_id())
        .collect();
    let received: Vec<u64> = wcs
        .iter()
        .filter(|wc| wc.opcode() == Some(WcOpcode::Recv))
        .map(|wc| wc.wr_id())
        .collect();
    assert_eq!(sent, [0, 1, 2]);
    assert_eq!(received, [10, 11, 12]);
    assert!(wcs.iter().all(|wc| wc.status() == WcStatus::Success));
    assert_eq!(&dst, b"AAAABBBBCCCC");
    Ok(())
}

#[test]
fn test_rdma_write_and_read() -> Result<()> {
    let lo = Loopback::new(QpType::Rc)?;
    let mut local = *b"written remotely";
    let mut remote = [0u8; 16];
    let lmr = lo.reg(&mut local)?;
    let rmr = lo.reg(&mut remote)?;

    lo.verbs
        .post_send(lo.a, &[SendWr::write(1, &[lmr.whole()], rmr.remote(0).unwrap())])?;
    let wcs = lo.poll()?;
    assert_eq!(wcs.len(), 1);
    assert_eq!(wcs[0].opcode(), Some(WcOpcode::RdmaWrite));
    assert_eq!(wcs[0].result(), Ok(16));
    assert_eq!(&remote, b"written remotely");

    remote[..4].copy_from_slice(b"READ");
    lo.verbs
        .post_send(lo.a, &[SendWr::read(2, &[lmr.sge(0, 4).unwrap()], rmr.remote(0).unwrap())])?;
    let wcs = lo.poll()?;
    assert_eq!(wcs[0].opcode(), Some(WcOpcode::RdmaRead));
    assert_eq!(wcs[0].bytes(), 4);
    assert_eq!(&local[..4], b"READ");
    Ok(())
}

/// Register one 8-byte word.
fn reg_word(lo: &Loopback, word: &mut u64) -> Result<MrInfo> {
    let mr = unsafe {
        lo.verbs
            .reg_mr(lo.pd, (word as *mut u64).cast(), 8, Permission::default())?
    };
    Ok(lo.verbs.query_mr(mr)?)
}

#[test]
fn test_atomics() -> Result<()> {
    let lo = Loopback::new(QpType::Rc)?;
    let mut target = 5u64;
    let mut old = 0u64;
    let tmr = reg_word(&lo, &mut target)?;
    let omr = reg_word(&lo, &mut old)?;

    lo.verbs
        .post_send(lo.a, &[SendWr::fetch_add(1, omr.whole(), tmr.remote(0).unwrap(), 3)])?;
    let wcs = lo.poll()?;
    assert_eq!(wcs[0].opcode(), Some(WcOpcode::FetchAdd));
    assert_eq!(wcs[0].status(), WcStatus::Success);
    assert_eq!(unsafe { std::ptr::read_volatile(&old) }, 5);
    assert_eq!(unsafe { std::ptr::read_volatile(&target) }, 8);

    // A mismatched compare leaves the target alone.
    let wrs = [
        SendWr::compare_swap(2, omr.whole(), tmr.remote(0).unwrap(), 1, 100),
        SendWr::compare_swap(3, omr.whole(), tmr.remote(0).unwrap(), 8, 100),
    ];
    lo.verbs.post_send(lo.a, &wrs)?;
    let wcs = lo.poll()?;
    assert_eq!(wcs.len(), 2);
    assert!(wcs.iter().all(|wc| wc.opcode() == Some(WcOpcode::CompSwap)));
    assert_eq!(unsafe { std::ptr::read_volatile(&old) }, 8);
    assert_eq!(unsafe { std::ptr::read_volatile(&target) }, 100);
    Ok(())
}

#[test]
fn test_write_with_imm() -> Result<()> {
    let lo = Loopback::new(QpType::Rc)?;
    let mut local = [0x5au8; 32];
    let mut remote = [0u8; 32];
    let lmr = lo.reg(&mut local)?;
    let rmr = lo.reg(&mut remote)?;

    lo.verbs.post_recv(lo.b, &[RecvWr::new(7, &[])])?;
    let wr = SendWr::write_with_imm(1, &[lmr.whole()], rmr.remote(0).unwrap(), 0xdead_beef);
    lo.verbs.post_send(lo.a, &[wr])?;

    let wcs = lo.poll()?;
    let recv = wcs
        .iter()
        .find(|wc| wc.opcode() == Some(WcOpcode::RecvRdmaImm))
        .expect("receive completion");
    assert_eq!(recv.wr_id(), 7);
    assert_eq!(recv.imm(), Some(0xdead_beef));
    assert_eq!(recv.bytes(), 32);
    assert_eq!(recv.src_qp, lo.verbs.qp_num(lo.a)?);
    assert_eq!(remote, [0x5a; 32]);
    Ok(())
}

#[test]
fn test_send_waits_for_receiver() -> Result<()> {
    let lo = Loopback::new(QpType::Rc)?;
    let mut src = *b"late";
    let mut dst = [0u8; 4];
    let smr = lo.reg(&mut src)?;
    let dmr = lo.reg(&mut dst)?;

    lo.verbs
        .post_send(lo.a, &[SendWr::send_with_imm(1, &[smr.whole()], 9)])?;
    assert!(lo.poll()?.is_empty());
    assert_eq!(lo.verbs.qp_state(lo.a)?, QpState::Rts);

    lo.verbs.post_recv(lo.b, &[RecvWr::new(2, &[dmr.whole()])])?;
    let wcs = lo.poll()?;
    assert_eq!(wcs.len(), 2);
    assert_eq!(wcs[0].imm(), Some(9));
    assert_eq!(wcs[1].wr_id(), 1);
    assert_eq!(&dst, b"late");
    Ok(())
}

#[test]
fn test_error_flushes_queue() -> Result<()> {
    let lo = Loopback::new(QpType::Rc)?;
    let mut buf = [0u8; 16];
    let mr = lo.reg(&mut buf)?;
    lo.verbs.post_recv(
        lo.a,
        &[RecvWr::new(20, &[mr.whole()]), RecvWr::new(21, &[mr.whole()])],
    )?;

    lo.verbs
        .modify_qp(lo.a, &QpAttr::state(QpState::Error), QpAttrMask::STATE)?;
    assert_eq!(lo.verbs.qp_state(lo.a)?, QpState::Error);

    let wcs = lo.poll()?;
    assert_eq!(wcs.len(), 2);
    assert!(wcs.iter().all(|wc| wc.status() == WcStatus::WrFlushErr));
    assert_eq!(wcs[0].wr_id(), 20);

    // Requests posted in the error state are flushed right away.
    lo.verbs
        .post_send(lo.a, &[SendWr::send(30, &[mr.whole()])])?;
    let wcs = lo.poll()?;
    assert_eq!(wcs.len(), 1);
    assert_eq!(wcs[0].result(), Err(WcStatus::WrFlushErr));
    Ok(())
}

#[test]
fn test_qp_state_and_endpoint() -> Result<()> {
    let lo = Loopback::new(QpType::Uc)?;
    assert_eq!(lo.verbs.qp_state(lo.a)?, QpState::Rts);
    assert_eq!(lo.verbs.qp_type(lo.a)?, QpType::Uc);

    let ep = lo.verbs.endpoint(lo.b, 1)?;
    assert_eq!(ep.qp_num, lo.verbs.qp_num(lo.b)?);
    assert_eq!(ep.port_num, 1);
    assert_ne!(ep.lid, 0);
    assert!(lo.verbs.endpoint(lo.b, 2).is_err());

    // RTS cannot go back to RTR.
    let r = lo
        .verbs
        .modify_qp(lo.a, &QpAttr::state(QpState::Rtr), QpAttrMask::STATE);
    assert_eq!(status(r), libc::EINVAL);
    assert_eq!(lo.verbs.qp_state(lo.a)?, QpState::Rts);

    // Back to RESET and reconnect.
    lo.verbs
        .modify_qp(lo.a, &QpAttr::state(QpState::Reset), QpAttrMask::STATE)?;
    lo.verbs
        .modify_qp(lo.b, &QpAttr::state(QpState::Reset), QpAttrMask::STATE)?;
    common::connect(&lo.verbs, lo.a, lo.b)?;
    assert_eq!(lo.verbs.qp_state(lo.b)?, QpState::Rts);
    Ok(())
}

#[test]
fn test_bad_qp_type() -> Result<()> {
    let lo = Loopback::new(QpType::Rc)?;
    let attr = QpInitAttr {
        qp_type: 99,
        ..QpInitAttr::rc(lo.cq)
    };
    let mut result = VerbsResult::new();
    result.record(lo.verbs.create_qp(lo.pd, &attr));
    assert_eq!(result.status, STATUS_FAILURE);
    assert_eq!(result.handle, 0);
    Ok(())
}

#[test]
fn test_shared_receive_queue() -> Result<()> {
    let verbs = Verbs::new(SoftDriver::default());
    let ctx = verbs.open_device(0)?;
    let pd = verbs.alloc_pd(ctx)?;
    let cq = verbs.create_cq(ctx, 64, Handle::NULL, 0, 0)?;
    let srq = verbs.create_srq(pd, &SrqInitAttr::default())?;

    let a = verbs.create_qp(pd, &QpInitAttr::rc(cq))?;
    let b = verbs.create_qp(pd, &QpInitAttr::rc(cq).with_srq(srq))?;
    common::connect(&verbs, a, b)?;

    let mut src = *b"shared";
    let mut dst = [0u8; 6];
    let smr = verbs.query_mr(unsafe { verbs.reg_slice(pd, &mut src, Permission::default())? })?;
    let dmr = verbs.query_mr(unsafe { verbs.reg_slice(pd, &mut dst, Permission::default())? })?;

    // A QP attached to an SRQ has no receive queue of its own.
    let r = verbs.post_recv(b, &[RecvWr::new(1, &[dmr.whole()])]);
    assert!(matches!(r, Err(VerbsError::Post { index: 0, .. })));

    verbs.post_srq_recv(srq, &[RecvWr::new(2, &[dmr.whole()])])?;
    verbs.post_send(a, &[SendWr::send(3, &[smr.whole()])])?;
    let wcs = common::poll(&verbs, cq)?;
    assert_eq!(wcs.len(), 2);
    assert_eq!(wcs[0].wr_id(), 2);
    assert_eq!(wcs[0].qp_num(), verbs.qp_num(b)?);
    assert_eq!(&dst, b"shared");

    assert_eq!(status(verbs.destroy_srq(srq)), libc::EBUSY);
    verbs.destroy_qp(b)?;
    verbs.destroy_srq(srq)?;
    Ok(())
}

#[test]
fn test_cq_with_qp_is_busy() -> Result<()> {
    let lo = Loopback::new(QpType::Rc)?;
    let r = lo.verbs.destroy_cq(lo.cq);
    assert_eq!(status(r), libc::EBUSY);
    assert!(lo.verbs.cq_capacity(lo.cq)? >= 256);

    lo.verbs.destroy_qp(lo.a)?;
    lo.verbs.destroy_qp(lo.b)?;
    lo.verbs.destroy_cq(lo.cq)?;
    assert_eq!(status(lo.verbs.destroy_cq(lo.cq)), STATUS_FAILURE);
    assert!(lo.verbs.poll_cq(lo.cq, &mut [Wc::default()]).is_err());
    Ok(())
}

#[test]
fn test_post_list_partial_rejection() -> Result<()> {
    let attr = QpInitAttr::new(QpType::Rc, Handle::NULL, Handle::NULL).with_caps(QpCaps {
        max_recv_wr: 2,
        ..QpCaps::default()
    });
    let lo = Loopback::with_attr(attr)?;
    let wrs: Vec<RecvWr> = (0..3).map(|i| RecvWr::new(i, &[])).collect();
    match lo.verbs.post_recv(lo.b, &wrs) {
        Err(e @ VerbsError::Post { index: 2, .. }) => assert_eq!(e.status(), libc::ENOMEM),
        r => panic!("unexpected outcome {:?}", r),
    }

    // The two accepted requests are live and flush on error.
    lo.verbs
        .modify_qp(lo.b, &QpAttr::state(QpState::Error), QpAttrMask::STATE)?;
    assert_eq!(lo.poll()?.len(), 2);
    Ok(())
}

#[test]
fn test_completion_channel() -> Result<()> {
    let verbs = Verbs::new(SoftDriver::default());
    let ctx = verbs.open_device(0)?;
    let pd = verbs.alloc_pd(ctx)?;
    let channel = verbs.create_comp_channel(ctx)?;
    let cq = verbs.create_cq(ctx, 16, channel, 0xc00c1e, 0)?;
    let a = verbs.create_qp(pd, &QpInitAttr::rc(cq))?;
    let b = verbs.create_qp(pd, &QpInitAttr::rc(cq))?;
    common::connect(&verbs, a, b)?;

    let fd = verbs.comp_channel_fd(channel)?;
    rdmabridge::fd::set_flags(fd, libc::O_NONBLOCK)?;
    assert_eq!(status(verbs.get_cq_event(channel)), libc::EAGAIN);

    let mut buf = [0u8; 8];
    let mr = verbs.query_mr(unsafe { verbs.reg_slice(pd, &mut buf, Permission::default())? })?;

    // Unarmed: completions raise no event.
    verbs.post_send(a, &[SendWr::write(1, &[mr.whole()], mr.remote(0).unwrap())])?;
    assert_eq!(status(verbs.get_cq_event(channel)), libc::EAGAIN);
    assert_eq!(common::poll(&verbs, cq)?.len(), 1);

    verbs.req_notify_cq(cq, false)?;
    verbs.post_send(a, &[SendWr::write(2, &[mr.whole()], mr.remote(0).unwrap())])?;
    let (event_cq, cookie) = verbs.get_cq_event(channel)?;
    assert_eq!(event_cq, cq);
    assert_eq!(cookie, 0xc00c1e);
    // One event per arming.
    assert_eq!(status(verbs.get_cq_event(channel)), libc::EAGAIN);

    verbs.destroy_qp(a)?;
    verbs.destroy_qp(b)?;
    assert_eq!(status(verbs.destroy_cq(cq)), libc::EBUSY);
    verbs.ack_cq_events(cq, 1)?;
    assert_eq!(status(verbs.destroy_comp_channel(channel)), libc::EBUSY);
    verbs.destroy_cq(cq)?;
    verbs.destroy_comp_channel(channel)?;
    Ok(())
}

/// Whether `fd` has an event waiting, without consuming it.
fn readable(fd: i32) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    unsafe { libc::poll(&mut pfd, 1, 0) == 1 }
}

#[test]
fn test_destroy_cq_drops_its_events() -> Result<()> {
    let verbs = Verbs::new(SoftDriver::default());
    let ctx = verbs.open_device(0)?;
    let pd = verbs.alloc_pd(ctx)?;
    let channel = verbs.create_comp_channel(ctx)?;
    let doomed = verbs.create_cq(ctx, 16, channel, 1, 0)?;
    let kept = verbs.create_cq(ctx, 16, channel, 2, 0)?;
    let fd = verbs.comp_channel_fd(channel)?;

    let mut buf = [0u8; 8];
    let mr = verbs.query_mr(unsafe { verbs.reg_slice(pd, &mut buf, Permission::default())? })?;
    let write = |cq: Handle| -> Result<(Handle, Handle)> {
        let a = verbs.create_qp(pd, &QpInitAttr::rc(cq))?;
        let b = verbs.create_qp(pd, &QpInitAttr::rc(cq))?;
        common::connect(&verbs, a, b)?;
        verbs.req_notify_cq(cq, false)?;
        verbs.post_send(a, &[SendWr::write(1, &[mr.whole()], mr.remote(0).unwrap())])?;
        Ok((a, b))
    };

    let (ka, kb) = write(kept)?;
    let (a, b) = write(doomed)?;
    assert!(readable(fd));

    // The unfetched event dies with its CQ; the other CQ's event survives.
    verbs.destroy_qp(a)?;
    verbs.destroy_qp(b)?;
    verbs.destroy_cq(doomed)?;
    assert!(readable(fd));
    assert_eq!(verbs.get_cq_event(channel)?, (kept, 2));
    assert!(!readable(fd));
    rdmabridge::fd::set_flags(fd, libc::O_NONBLOCK)?;
    assert_eq!(status(verbs.get_cq_event(channel)), libc::EAGAIN);

    verbs.destroy_qp(ka)?;
    verbs.destroy_qp(kb)?;
    verbs.ack_cq_events(kept, 1)?;
    verbs.destroy_cq(kept)?;
    verbs.destroy_comp_channel(channel)?;
    Ok(())
}

#[test]
fn test_notify_without_channel() -> Result<()> {
    let lo = Loopback::new(QpType::Rc)?;
    assert_eq!(status(lo.verbs.req_notify_cq(lo.cq, false)), libc::EINVAL);
    Ok(())
}

#[test]
fn test_endpoint_exchange() -> Result<()> {
    let verbs = Verbs::new(SoftDriver::default());
    let ctx = verbs.open_device(0)?;
    let pd = verbs.alloc_pd(ctx)?;
    let cq = verbs.create_cq(ctx, 16, Handle::NULL, 0, 0)?;
    let a = verbs.create_qp(pd, &QpInitAttr::rc(cq))?;
    let b = verbs.create_qp(pd, &QpInitAttr::rc(cq))?;

    // Endpoints travel out of band, here as JSON.
    let ea = verbs.endpoint(a, 1)?;
    let eb = verbs.endpoint(b, 1)?;
    let wire_a = serde_json::to_string(&ea)?;
    let wire_b = serde_json::to_string(&eb)?;
    let peer_of_a: QpEndpoint = serde_json::from_str(&wire_b)?;
    let peer_of_b: QpEndpoint = serde_json::from_str(&wire_a)?;
    assert_eq!(peer_of_b, ea);

    verbs.connect_qp(a, &ea, &peer_of_a, Permission::default())?;
    verbs.connect_qp(b, &eb, &peer_of_b, Permission::default())?;
    assert_eq!(verbs.qp_state(a)?, QpState::Rts);
    assert_eq!(verbs.qp_state(b)?, QpState::Rts);
    Ok(())
}
