//! The C entry points, driven the way a C caller would drive them.

use std::ptr;

use rdmabridge::ffi::*;
use rdmabridge::prelude::*;

/// Resources of one loopback connection, as raw handles.
struct Session {
    ctx: u64,
    pd: u64,
    cq: u64,
    a: u64,
    b: u64,
}

fn ok(r: &VerbsResult) -> u64 {
    assert_eq!(r.status, 0, "call failed: {:?}", r);
    r.handle
}

unsafe fn session() -> Session {
    let mut r = VerbsResult::new();
    rdmabridge_open_device(0, &mut r);
    let ctx = ok(&r);
    rdmabridge_alloc_pd(ctx, &mut r);
    let pd = ok(&r);
    rdmabridge_create_cq(ctx, 64, 0, 0, 0, &mut r);
    let cq = ok(&r);

    let attr = QpInitAttr::rc(Handle::from_raw(cq));
    rdmabridge_create_qp(pd, &attr, &mut r);
    let a = ok(&r);
    rdmabridge_create_qp(pd, &attr, &mut r);
    let b = ok(&r);

    let mut ea = QpEndpoint::default();
    let mut eb = QpEndpoint::default();
    rdmabridge_get_endpoint(a, 1, &mut ea, &mut r);
    ok(&r);
    rdmabridge_get_endpoint(b, 1, &mut eb, &mut r);
    ok(&r);
    let access = Permission::default().bits();
    rdmabridge_connect_qp(a, &ea, &eb, access, &mut r);
    ok(&r);
    rdmabridge_connect_qp(b, &eb, &ea, access, &mut r);
    ok(&r);

    Session { ctx, pd, cq, a, b }
}

unsafe fn reg(pd: u64, buf: &mut [u8]) -> (u64, MrInfo) {
    let mut r = VerbsResult::new();
    rdmabridge_reg_mr(
        pd,
        buf.as_mut_ptr().cast(),
        buf.len() as u64,
        Permission::default().bits(),
        &mut r,
    );
    let mr = ok(&r);
    let mut info = MrInfo::default();
    rdmabridge_query_mr(mr, &mut info, &mut r);
    ok(&r);
    (mr, info)
}

unsafe fn teardown(s: Session, mrs: &[u64]) {
    let mut r = VerbsResult::new();
    for qp in [s.a, s.b] {
        rdmabridge_destroy_qp(qp, &mut r);
        ok(&r);
    }
    for &mr in mrs {
        rdmabridge_dereg_mr(mr, &mut r);
        ok(&r);
    }
    rdmabridge_destroy_cq(s.cq, &mut r);
    ok(&r);
    rdmabridge_dealloc_pd(s.pd, &mut r);
    ok(&r);
    rdmabridge_close_device(s.ctx, &mut r);
    ok(&r);
}

#[test]
fn test_linked_lists() {
    unsafe {
        let s = session();
        let mut src = *b"firstsecond";
        let mut dst = [0u8; 11];
        let (smr, sinfo) = reg(s.pd, &mut src);
        let (dmr, dinfo) = reg(s.pd, &mut dst);

        let rsges = [dinfo.sge(0, 5).unwrap(), dinfo.sge(5, 6).unwrap()];
        let recv1 = RawRecvWr {
            wr_id: 11,
            sg_list: &rsges[1],
            num_sge: 1,
            ..Default::default()
        };
        let recv0 = RawRecvWr {
            wr_id: 10,
            next: &recv1,
            sg_list: &rsges[0],
            num_sge: 1,
            ..Default::default()
        };
        let mut r = VerbsResult::new();
        rdmabridge_post_recv(s.b, &recv0, &mut r);
        ok(&r);

        let ssges = [sinfo.sge(0, 5).unwrap(), sinfo.sge(5, 6).unwrap()];
        let flags = SendFlags::SIGNALED.0;
        let send1 = RawSendWr {
            wr_id: 2,
            sg_list: &ssges[1],
            num_sge: 1,
            opcode: WrOpcode::SendWithImm as u32,
            send_flags: flags,
            imm_data: 77,
            ..Default::default()
        };
        let send0 = RawSendWr {
            wr_id: 1,
            next: &send1,
            sg_list: &ssges[0],
            num_sge: 1,
            send_flags: flags,
            ..Default::default()
        };
        rdmabridge_post_send(s.a, &send0, &mut r);
        ok(&r);

        let mut wc = [Wc::default(); 8];
        let n = rdmabridge_poll_cq(s.cq, wc.as_mut_ptr(), wc.len() as i32);
        assert_eq!(n, 4);
        let ids: Vec<u64> = wc[..4].iter().map(|wc| wc.wr_id()).collect();
        assert_eq!(ids, [10, 1, 11, 2]);
        assert_eq!(wc[2].imm(), Some(77));
        assert_eq!(&dst, b"firstsecond");

        teardown(s, &[smr, dmr]);
    }
}

#[test]
fn test_malformed_list_posts_nothing() {
    unsafe {
        let s = session();
        let bad = RawRecvWr {
            wr_id: 2,
            num_sge: 1,
            ..Default::default()
        };
        let good = RawRecvWr {
            wr_id: 1,
            next: &bad,
            ..Default::default()
        };
        let mut r = VerbsResult::new();
        rdmabridge_post_recv(s.b, &good, &mut r);
        assert_eq!(r.status, STATUS_FAILURE);

        // Nothing was queued, so an error transition flushes nothing.
        let attr = QpAttr::state(QpState::Error);
        rdmabridge_modify_qp(s.b, &attr, QpAttrMask::STATE.0, &mut r);
        ok(&r);
        assert_eq!(rdmabridge_poll_cq(s.cq, [Wc::default(); 4].as_mut_ptr(), 4), 0);
        assert_eq!(rdmabridge_get_qp_state(s.b, &mut r), QpState::Error as i32);

        teardown(s, &[]);
    }
}

#[test]
fn test_qp_queries() {
    unsafe {
        let s = session();
        let mut r = VerbsResult::new();
        assert_ne!(rdmabridge_get_qp_num(s.a, &mut r), 0);
        ok(&r);
        assert_eq!(rdmabridge_get_qp_state(s.a, &mut r), QpState::Rts as i32);

        assert_eq!(rdmabridge_get_qp_num(s.pd, &mut r), 0);
        assert_eq!(r.status, STATUS_FAILURE);
        assert_eq!(rdmabridge_get_qp_state(0, &mut r), -1);
        assert_eq!(r.status, STATUS_FAILURE);

        teardown(s, &[]);
    }
}

#[test]
fn test_poll_invalid_cq() {
    let mut wc = [Wc::default(); 2];
    unsafe {
        assert_eq!(rdmabridge_poll_cq(0, wc.as_mut_ptr(), 2), -STATUS_FAILURE);
        let s = session();
        assert_eq!(rdmabridge_poll_cq(s.cq, wc.as_mut_ptr(), -1), -STATUS_FAILURE);
        assert_eq!(rdmabridge_poll_cq(s.cq, ptr::null_mut(), 0), 0);
        teardown(s, &[]);
    }
}

#[test]
fn test_destroy_clears_handle() {
    unsafe {
        let mut r = VerbsResult::new();
        rdmabridge_open_device(0, &mut r);
        let ctx = ok(&r);
        rdmabridge_alloc_pd(ctx, &mut r);
        let pd = ok(&r);

        // Busy: the context stays open.
        rdmabridge_close_device(ctx, &mut r);
        assert_eq!(r.status, libc::EBUSY);

        rdmabridge_dealloc_pd(pd, &mut r);
        assert_eq!(r, VerbsResult::new());
        rdmabridge_close_device(ctx, &mut r);
        assert_eq!(r, VerbsResult::new());
    }
}

#[test]
fn test_completion_channel_fd() {
    unsafe {
        let mut r = VerbsResult::new();
        rdmabridge_open_device(0, &mut r);
        let ctx = ok(&r);
        rdmabridge_create_comp_channel(ctx, &mut r);
        let channel = ok(&r);
        let fd = rdmabridge_get_comp_channel_fd(channel, &mut r);
        ok(&r);
        assert!(fd >= 0);

        assert_eq!(rdmabridge_fd_set_flags(fd, libc::O_NONBLOCK), 0);
        assert_ne!(rdmabridge_fd_get_flags(fd) & libc::O_NONBLOCK, 0);

        rdmabridge_create_cq(ctx, 8, channel, 42, 0, &mut r);
        let cq = ok(&r);
        let mut cookie = 0u64;
        rdmabridge_get_cq_event(channel, &mut cookie, &mut r);
        assert_eq!(r.status, libc::EAGAIN);

        assert_eq!(rdmabridge_get_comp_channel_fd(cq, &mut r), -1);
        assert_eq!(r.status, STATUS_FAILURE);

        rdmabridge_destroy_cq(cq, &mut r);
        ok(&r);
        rdmabridge_destroy_comp_channel(channel, &mut r);
        ok(&r);
        rdmabridge_close_device(ctx, &mut r);
        ok(&r);
    }
}

#[test]
fn test_fd_helpers_on_pipe() {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let [rd, wr] = fds;

    assert_eq!(rdmabridge_fd_get_flags(rd) & libc::O_NONBLOCK, 0);
    assert_eq!(rdmabridge_fd_set_flags(rd, libc::O_NONBLOCK), 0);
    assert_ne!(rdmabridge_fd_get_flags(rd) & libc::O_NONBLOCK, 0);

    assert_eq!(rdmabridge_fd_close(rd), 0);
    assert_eq!(rdmabridge_fd_close(wr), 0);
    assert_eq!(rdmabridge_fd_close(-1), -1);
    assert_eq!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::EBADF)
    );
}
