//! Device and port attributes.

use std::fmt;

/// Device attributes, filled in place by `query_device`.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DeviceAttr {
    /// NUL-terminated firmware version string.
    pub fw_ver: [u8; 64],
    pub node_guid: u64,
    pub sys_image_guid: u64,
    pub max_mr_size: u64,
    pub page_size_cap: u64,
    pub vendor_id: u32,
    pub vendor_part_id: u32,
    pub hw_ver: u32,
    pub max_qp: u32,
    pub max_qp_wr: u32,
    pub device_cap_flags: u32,
    pub max_sge: u32,
    pub max_cq: u32,
    pub max_cqe: u32,
    pub max_mr: u32,
    pub max_pd: u32,
    pub max_qp_rd_atom: u32,
    pub max_qp_init_rd_atom: u32,
    pub max_srq: u32,
    pub max_srq_wr: u32,
    pub max_srq_sge: u32,
    /// Value of `enum ibv_atomic_cap`.
    pub atomic_cap: u32,
    pub max_pkeys: u16,
    pub local_ca_ack_delay: u8,
    pub phys_port_cnt: u8,
}

impl DeviceAttr {
    /// `IBV_ATOMIC_NONE`.
    pub const ATOMIC_NONE: u32 = 0;
    /// `IBV_ATOMIC_HCA`.
    pub const ATOMIC_HCA: u32 = 1;

    /// Firmware version as a string.
    pub fn fw_ver(&self) -> String {
        let end = self.fw_ver.iter().position(|&b| b == 0).unwrap_or(64);
        String::from_utf8_lossy(&self.fw_ver[..end]).into_owned()
    }

    /// Store `s` as the firmware version, truncated to fit with its NUL.
    pub fn set_fw_ver(&mut self, s: &str) {
        self.fw_ver = [0; 64];
        let n = s.len().min(63);
        self.fw_ver[..n].copy_from_slice(&s.as_bytes()[..n]);
    }
}

impl Default for DeviceAttr {
    fn default() -> Self {
        Self {
            fw_ver: [0; 64],
            node_guid: 0,
            sys_image_guid: 0,
            max_mr_size: 0,
            page_size_cap: 0,
            vendor_id: 0,
            vendor_part_id: 0,
            hw_ver: 0,
            max_qp: 0,
            max_qp_wr: 0,
            device_cap_flags: 0,
            max_sge: 0,
            max_cq: 0,
            max_cqe: 0,
            max_mr: 0,
            max_pd: 0,
            max_qp_rd_atom: 0,
            max_qp_init_rd_atom: 0,
            max_srq: 0,
            max_srq_wr: 0,
            max_srq_sge: 0,
            atomic_cap: 0,
            max_pkeys: 0,
            local_ca_ack_delay: 0,
            phys_port_cnt: 0,
        }
    }
}

impl fmt::Debug for DeviceAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAttr")
            .field("fw_ver", &self.fw_ver())
            .field("node_guid", &format_args!("{:#018x}", self.node_guid))
            .field("max_qp", &self.max_qp)
            .field("max_qp_wr", &self.max_qp_wr)
            .field("max_cqe", &self.max_cqe)
            .field("phys_port_cnt", &self.phys_port_cnt)
            .finish_non_exhaustive()
    }
}

/// Port state, as in `enum ibv_port_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PortState {
    Nop = 0,
    Down = 1,
    Init = 2,
    Armed = 3,
    Active = 4,
    ActiveDefer = 5,
}

/// Path MTU, as in `enum ibv_mtu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum Mtu {
    Mtu256 = 1,
    Mtu512 = 2,
    Mtu1024 = 3,
    Mtu2048 = 4,
    Mtu4096 = 5,
}

impl Mtu {
    /// MTU in bytes.
    pub fn bytes(self) -> u32 {
        128 << (self as u32)
    }

    /// Largest MTU not exceeding `bytes`, if any.
    pub fn from_bytes(bytes: u32) -> Option<Self> {
        match bytes {
            4096.. => Some(Mtu::Mtu4096),
            2048.. => Some(Mtu::Mtu2048),
            1024.. => Some(Mtu::Mtu1024),
            512.. => Some(Mtu::Mtu512),
            256.. => Some(Mtu::Mtu256),
            _ => None,
        }
    }
}

impl TryFrom<u32> for Mtu {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        Ok(match value {
            1 => Mtu::Mtu256,
            2 => Mtu::Mtu512,
            3 => Mtu::Mtu1024,
            4 => Mtu::Mtu2048,
            5 => Mtu::Mtu4096,
            x => return Err(x),
        })
    }
}

/// Link layer values reported in [`PortAttr::link_layer`].
pub mod link_layer {
    pub const UNSPECIFIED: u8 = 0;
    pub const INFINIBAND: u8 = 1;
    pub const ETHERNET: u8 = 2;
}

/// Port attributes, filled in place by `query_port`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PortAttr {
    /// Value of [`PortState`].
    pub state: u32,
    /// Value of [`Mtu`].
    pub max_mtu: u32,
    /// Value of [`Mtu`].
    pub active_mtu: u32,
    pub gid_tbl_len: i32,
    pub port_cap_flags: u32,
    pub max_msg_sz: u32,
    pub lid: u16,
    pub sm_lid: u16,
    pub pkey_tbl_len: u16,
    pub active_width: u8,
    pub active_speed: u8,
    pub phys_state: u8,
    pub link_layer: u8,
    pub lmc: u8,
    pub max_vl_num: u8,
}

impl PortAttr {
    /// Whether the port state is `ACTIVE`.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.state == PortState::Active as u32
    }

    /// Active MTU, if the driver reported a known value.
    #[inline]
    pub fn active_mtu(&self) -> Option<Mtu> {
        Mtu::try_from(self.active_mtu).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mtu() {
        assert_eq!(Mtu::Mtu256.bytes(), 256);
        assert_eq!(Mtu::Mtu4096.bytes(), 4096);
        assert_eq!(Mtu::from_bytes(3000), Some(Mtu::Mtu2048));
        assert_eq!(Mtu::from_bytes(100), None);
    }

    #[test]
    fn test_fw_ver() {
        let mut attr = DeviceAttr::default();
        attr.set_fw_ver("1.2.3");
        assert_eq!(attr.fw_ver(), "1.2.3");
        attr.set_fw_ver(&"x".repeat(100));
        assert_eq!(attr.fw_ver().len(), 63);
    }
}
