//! Block device methods: listing, malloc and aio bdevs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ipc::{Client, RpcError};
use crate::rpc::is_unset;

/// I/O operations a bdev accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupportedIoTypes {
    pub read: bool,
    pub write: bool,
    pub unmap: bool,
    pub write_zeroes: bool,
    pub flush: bool,
    pub reset: bool,
    pub nvme_admin: bool,
    pub nvme_io: bool,
}

/// One entry of `bdev_get_bdevs`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bdev {
    pub name: String,
    pub product_name: String,
    pub uuid: String,
    pub block_size: u64,
    pub num_blocks: u64,
    pub claimed: bool,
    pub zoned: bool,
    pub supported_io_types: SupportedIoTypes,
    /// Driver-dependent details, left undecoded.
    pub driver_specific: Option<Value>,
}

impl Bdev {
    /// Capacity in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.block_size.saturating_mul(self.num_blocks)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GetBdevsArgs {
    /// Only this bdev; all bdevs when unset.
    #[serde(skip_serializing_if = "is_unset")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MallocCreateArgs {
    #[serde(skip_serializing_if = "is_unset")]
    pub name: Option<String>,
    pub block_size: u64,
    pub num_blocks: u64,
    #[serde(skip_serializing_if = "is_unset")]
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MallocDeleteArgs {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AioCreateArgs {
    pub name: String,
    pub filename: String,
    /// Let SPDK pick the block size when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AioDeleteArgs {
    pub name: String,
}

impl Client {
    pub async fn bdev_get_bdevs(&self, args: &GetBdevsArgs) -> Result<Vec<Bdev>, RpcError> {
        self.call("bdev_get_bdevs", args).await
    }

    /// Create a RAM-backed bdev. Returns its name.
    pub async fn bdev_malloc_create(&self, args: &MallocCreateArgs) -> Result<String, RpcError> {
        self.call("bdev_malloc_create", args).await
    }

    pub async fn bdev_malloc_delete(&self, args: &MallocDeleteArgs) -> Result<bool, RpcError> {
        self.call("bdev_malloc_delete", args).await
    }

    /// Create a bdev on top of a file or block device using Linux AIO.
    /// Returns its name.
    pub async fn bdev_aio_create(&self, args: &AioCreateArgs) -> Result<String, RpcError> {
        self.call("bdev_aio_create", args).await
    }

    pub async fn bdev_aio_delete(&self, args: &AioDeleteArgs) -> Result<bool, RpcError> {
        self.call("bdev_aio_delete", args).await
    }
}
