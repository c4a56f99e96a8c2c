//! [`LvmVolumeManager`] over the volume core, the LVM engine and the mounter

use crate::domain::ports::{LvmManagerRef, LvmVolumeManager, MounterRef};
use crate::error::{Error, Result};
use crate::lvm::{IgnoreNotFound, LogicalVolume, Selector, VolumeGroup};
use crate::volume::{LvmVolumeCore, VolumeId};
use async_trait::async_trait;
use std::sync::Arc;

pub struct VolumeManagerAdapter {
    core: Arc<LvmVolumeCore>,
    lvm: LvmManagerRef,
    mounter: MounterRef,
}

impl VolumeManagerAdapter {
    pub fn new(core: Arc<LvmVolumeCore>, lvm: LvmManagerRef, mounter: MounterRef) -> Self {
        Self { core, lvm, mounter }
    }
}

#[async_trait]
impl LvmVolumeManager for VolumeManagerAdapter {
    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let id: VolumeId = volume_id.parse().map_err(|e: Error| {
            Error::InvalidArgument(format!("failed to parse volume ID {}: {}", volume_id, e))
        })?;
        self.lvm
            .remove_logical_volume(&id.volume_group, &id.logical_volume)
            .await
            .ignore_not_found()?;
        Ok(())
    }

    fn get_volume_name(&self, volume_id: &str) -> Result<String> {
        self.core.get_volume_name(volume_id)
    }

    async fn get_node_device_path(&self, volume_id: &str) -> Result<String> {
        self.core.get_node_device_path(volume_id).await
    }

    async fn unmount_volume(&self, device_path: &str) -> Result<()> {
        self.mounter.cleanup_staging_dir(device_path).await
    }

    async fn list_logical_volumes(&self, select: Option<&Selector>) -> Result<Vec<LogicalVolume>> {
        Ok(self.lvm.list_logical_volumes(select).await?)
    }

    async fn list_volume_groups(&self, select: Option<&Selector>) -> Result<Vec<VolumeGroup>> {
        Ok(self.lvm.list_volume_groups(select).await?)
    }
}
