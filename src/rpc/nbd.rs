//! Exporting bdevs as kernel network block devices.

use serde::{Deserialize, Serialize};

use crate::ipc::{Client, RpcError};
use crate::rpc::is_unset;

/// A bdev exported through `/dev/nbdX`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NbdDisk {
    pub bdev_name: String,
    pub nbd_device: String,
}

pub type StartDiskArgs = NbdDisk;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GetDisksArgs {
    #[serde(skip_serializing_if = "is_unset")]
    pub nbd_device: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopDiskArgs {
    pub nbd_device: String,
}

impl Client {
    /// Export a bdev. Returns the path of the nbd device.
    pub async fn nbd_start_disk(&self, args: &StartDiskArgs) -> Result<String, RpcError> {
        self.call("nbd_start_disk", args).await
    }

    pub async fn nbd_get_disks(&self, args: &GetDisksArgs) -> Result<Vec<NbdDisk>, RpcError> {
        self.call("nbd_get_disks", args).await
    }

    pub async fn nbd_stop_disk(&self, args: &StopDiskArgs) -> Result<bool, RpcError> {
        self.call("nbd_stop_disk", args).await
    }
}
