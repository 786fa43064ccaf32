#![allow(dead_code)]

use anyhow::Result;
use rdmabridge::prelude::*;

/// Two connected queue pairs on one device, completing into one CQ.
pub struct Loopback {
    pub verbs: Verbs,
    pub ctx: Handle,
    pub pd: Handle,
    pub cq: Handle,
    pub a: Handle,
    pub b: Handle,
}

impl Loopback {
    pub fn new(qp_type: QpType) -> Result<Self> {
        Self::with_attr(QpInitAttr::new(qp_type, Handle::NULL, Handle::NULL))
    }

    /// `attr` minus its CQs, which are filled in here.
    pub fn with_attr(attr: QpInitAttr) -> Result<Self> {
        let verbs = Verbs::new(SoftDriver::default());
        let ctx = verbs.open_device(0)?;
        let pd = verbs.alloc_pd(ctx)?;
        let cq = verbs.create_cq(ctx, 256, Handle::NULL, 0, 0)?;
        let attr = QpInitAttr {
            send_cq: cq,
            recv_cq: cq,
            ..attr
        };
        let a = verbs.create_qp(pd, &attr)?;
        let b = verbs.create_qp(pd, &attr)?;
        connect(&verbs, a, b)?;
        Ok(Self {
            verbs,
            ctx,
            pd,
            cq,
            a,
            b,
        })
    }

    /// Register a buffer with full access.
    pub fn reg(&self, buf: &mut [u8]) -> Result<MrInfo> {
        let mr = unsafe { self.verbs.reg_slice(self.pd, buf, Permission::default())? };
        Ok(self.verbs.query_mr(mr)?)
    }

    pub fn poll(&self) -> Result<Vec<Wc>> {
        poll(&self.verbs, self.cq)
    }
}

/// Connect two RESET queue pairs to each other through port 1.
pub fn connect(verbs: &Verbs, a: Handle, b: Handle) -> Result<()> {
    let ea = verbs.endpoint(a, 1)?;
    let eb = verbs.endpoint(b, 1)?;
    verbs.connect_qp(a, &ea, &eb, Permission::default())?;
    verbs.connect_qp(b, &eb, &ea, Permission::default())?;
    Ok(())
}

/// Every completion currently queued on `cq`.
pub fn poll(verbs: &Verbs, cq: Handle) -> Result<Vec<Wc>> {
    let mut out = Vec::new();
    let mut wc = [Wc::default(); 16];
    loop {
        let n = verbs.poll_cq(cq, &mut wc)?;
        out.extend_from_slice(&wc[..n]);
        if n < wc.len() {
            return Ok(out);
        }
    }
}

/// Status a failed operation reports across the boundary.
pub fn status<T: std::fmt::Debug>(r: Result<T, VerbsError>) -> i32 {
    r.expect_err("operation should fail").status()
}
