use super::*;
use crate::types::{DeviceAttr, PortAttr};

impl Verbs {
    /// Number of devices currently present. `0` when the driver cannot list
    /// devices.
    pub fn device_count(&self) -> usize {
        match self.driver.device_list() {
            Ok(list) => list.len(),
            Err(e) => {
                log::debug!("cannot enumerate devices: {}", e);
                0
            }
        }
    }

    /// Names of the devices currently present, empty for unnamed ones.
    pub fn device_names(&self) -> Vec<String> {
        self.driver
            .device_list()
            .map(|list| {
                list.iter()
                    .map(|d| d.name.clone().unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Open the device at `index` of a fresh enumeration.
    ///
    /// Indices are only meaningful within one enumeration: devices may come
    /// and go between a [`Verbs::device_count`] and this call.
    pub fn open_device(&self, index: usize) -> Result<Handle, VerbsError> {
        let list = self.driver.device_list().map_err(VerbsError::Enumeration)?;
        let dev = list.get(index).ok_or(VerbsError::InvalidDeviceIndex {
            index,
            count: list.len(),
        })?;
        let raw = self.driver.open_device(dev)?;
        self.issue(ResourceKind::Context, raw, &[])
    }

    /// Close a device context. Its handle is revoked on success.
    pub fn close_device(&self, ctx: Handle) -> Result<(), VerbsError> {
        self.destroy(ctx, ResourceKind::Context, |d, raw| d.close_device(raw))
    }

    /// Name of the device behind a context, empty if the driver reports none
    /// or the handle is not a live context.
    pub fn device_name(&self, ctx: Handle) -> String {
        self.resolve(ctx, ResourceKind::Context)
            .ok()
            .and_then(|raw| self.driver.device_name(raw))
            .unwrap_or_default()
    }

    pub fn query_device(&self, ctx: Handle, attr: &mut DeviceAttr) -> Result<(), VerbsError> {
        let raw = self.resolve(ctx, ResourceKind::Context)?;
        Ok(self.driver.query_device(raw, attr)?)
    }

    pub fn query_port(
        &self,
        ctx: Handle,
        port_num: u8,
        attr: &mut PortAttr,
    ) -> Result<(), VerbsError> {
        let raw = self.resolve(ctx, ResourceKind::Context)?;
        Ok(self.driver.query_port(raw, port_num, attr)?)
    }

    /// GID at `index` of a port's GID table.
    pub fn query_gid(&self, ctx: Handle, port_num: u8, index: u8) -> Result<[u8; 16], VerbsError> {
        let raw = self.resolve(ctx, ResourceKind::Context)?;
        Ok(self.driver.query_gid(raw, port_num, index)?)
    }
}
