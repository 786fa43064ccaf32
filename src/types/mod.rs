//! Value types shared by the managers, the drivers, and the C boundary.

mod attr;
mod perm;
mod qp;
mod wc;
mod wr;

pub use self::attr::*;
pub use self::perm::*;
pub use self::qp::*;
pub use self::wc::*;
pub use self::wr::*;

/// Description of a registered memory region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MrInfo {
    pub addr: u64,
    pub length: u64,
    pub lkey: u32,
    pub rkey: u32,
}

impl MrInfo {
    /// Scatter/gather entry covering `len` bytes at `offset` into the region.
    /// `None` if the range falls outside the region.
    pub fn sge(&self, offset: u64, len: u32) -> Option<Sge> {
        let end = offset.checked_add(len as u64)?;
        let addr = self.addr.checked_add(offset)?;
        (end <= self.length).then_some(Sge::new(addr, len, self.lkey))
    }

    /// Scatter/gather entry covering the whole region. Regions over 4 GiB
    /// are truncated to `u32::MAX` bytes.
    pub fn whole(&self) -> Sge {
        Sge::new(self.addr, self.length.min(u32::MAX as u64) as u32, self.lkey)
    }

    /// The region as a remote target at `offset`. `None` if `offset` lies
    /// past the end of the region.
    pub fn remote(&self, offset: u64) -> Option<RemoteAddr> {
        let addr = self.addr.checked_add(offset)?;
        (offset <= self.length).then_some(RemoteAddr {
            addr,
            rkey: self.rkey,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mr_info_ranges() {
        let info = MrInfo {
            addr: 0x1000,
            length: 64,
            lkey: 1,
            rkey: 2,
        };
        assert_eq!(info.sge(60, 4).map(|s| s.addr), Some(0x103c));
        assert!(info.sge(60, 5).is_none());
        assert!(info.sge(u64::MAX, 1).is_none());

        assert_eq!(info.remote(64).map(|r| r.addr), Some(0x1040));
        assert!(info.remote(65).is_none());
        assert!(info.remote(u64::MAX).is_none());

        let top = MrInfo {
            addr: u64::MAX - 3,
            length: u64::MAX,
            ..info
        };
        assert!(top.remote(8).is_none());
    }
}
