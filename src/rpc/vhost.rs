//! vhost controllers.
//!
//! `vhost_get_controllers` describes each controller's backend in a
//! `backend_specific` object keyed by backend kind. The binding re-parses
//! the known kinds into [`BackendSpecific`] variants after the generic
//! decode; anything it does not recognize is kept as raw JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ipc::{Client, RpcError};
use crate::rpc::{is_false, is_unset};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateBlkControllerArgs {
    /// Controller name; also the name of its socket.
    pub ctrlr: String,
    /// Backing bdev.
    pub dev_name: String,
    #[serde(skip_serializing_if = "is_false")]
    pub readonly: bool,
    #[serde(skip_serializing_if = "is_unset")]
    pub cpumask: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteControllerArgs {
    pub ctrlr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GetControllersArgs {
    #[serde(skip_serializing_if = "is_unset")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VhostBlkBackend {
    pub bdev: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VhostScsiLun {
    pub id: i32,
    pub bdev_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VhostScsiBackend {
    pub target_name: String,
    pub id: i32,
    pub scsi_dev_num: u32,
    pub luns: Vec<VhostScsiLun>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VhostNvmeBackend {
    pub nsid: u32,
    pub bdev: String,
}

/// Backend description of one controller, by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendSpecific {
    /// `block`
    Block(VhostBlkBackend),
    /// `scsi`
    Scsi(Vec<VhostScsiBackend>),
    /// `namespaces`
    Nvme(Vec<VhostNvmeBackend>),
    /// Unknown kind or unexpected shape.
    Other(Value),
}

impl BackendSpecific {
    /// Known kinds always yield their typed variant, default-filled where the
    /// shape is off; only unknown kinds stay raw.
    fn parse(kind: &str, value: Value) -> Self {
        match kind {
            "block" => {
                let empty = Map::new();
                let map = value.as_object().unwrap_or(&empty);
                BackendSpecific::Block(VhostBlkBackend {
                    bdev: string_field(map, "bdev"),
                    readonly: bool_field(map, "readonly"),
                })
            }
            "scsi" => BackendSpecific::Scsi(
                objects(array(&value)).map(parse_scsi_target).collect(),
            ),
            "namespaces" => BackendSpecific::Nvme(
                objects(array(&value))
                    .map(|ns| VhostNvmeBackend {
                        nsid: number_field(ns, "nsid") as u32,
                        bdev: string_field(ns, "bdev"),
                    })
                    .collect(),
            ),
            _ => BackendSpecific::Other(value),
        }
    }
}

fn parse_scsi_target(target: &Map<String, Value>) -> VhostScsiBackend {
    let empty = Map::new();
    // A LUN that is not an object still takes its slot, zero-valued.
    let luns = target
        .get("luns")
        .map(array)
        .unwrap_or_default()
        .iter()
        .map(|lun| {
            let lun = lun.as_object().unwrap_or(&empty);
            VhostScsiLun {
                id: number_field(lun, "id") as i32,
                bdev_name: string_field(lun, "bdev_name"),
            }
        })
        .collect();

    VhostScsiBackend {
        target_name: string_field(target, "target_name"),
        id: number_field(target, "id") as i32,
        scsi_dev_num: number_field(target, "scsi_dev_num") as u32,
        luns,
    }
}

fn array(value: &Value) -> &[Value] {
    value.as_array().map(Vec::as_slice).unwrap_or_default()
}

fn objects(values: &[Value]) -> impl Iterator<Item = &Map<String, Value>> {
    values.iter().filter_map(Value::as_object)
}

fn string_field(map: &Map<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn bool_field(map: &Map<String, Value>, key: &str) -> bool {
    map.get(key).and_then(Value::as_bool).unwrap_or(false)
}

// JSON numbers may arrive as floats; truncate like the error codes.
fn number_field(map: &Map<String, Value>, key: &str) -> f64 {
    map.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

/// Wire shape before the backend is typed.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawController {
    ctrlr: String,
    cpumask: String,
    delay_base_us: u64,
    iops_threshold: u64,
    /// SPDK may send `null` here.
    backend_specific: Option<Map<String, Value>>,
}

/// One entry of `vhost_get_controllers`.
#[derive(Debug, Clone, PartialEq)]
pub struct Controller {
    pub ctrlr: String,
    pub cpumask: String,
    pub delay_base_us: u64,
    pub iops_threshold: u64,
    pub backend_specific: BTreeMap<String, BackendSpecific>,
}

impl Controller {
    /// The vhost-blk backend, if this is a block controller.
    pub fn block(&self) -> Option<&VhostBlkBackend> {
        match self.backend_specific.get("block") {
            Some(BackendSpecific::Block(blk)) => Some(blk),
            _ => None,
        }
    }
}

impl From<RawController> for Controller {
    fn from(raw: RawController) -> Self {
        let backend_specific = raw
            .backend_specific
            .unwrap_or_default()
            .into_iter()
            .map(|(kind, value)| {
                let backend = BackendSpecific::parse(&kind, value);
                (kind, backend)
            })
            .collect();

        Controller {
            ctrlr: raw.ctrlr,
            cpumask: raw.cpumask,
            delay_base_us: raw.delay_base_us,
            iops_threshold: raw.iops_threshold,
            backend_specific,
        }
    }
}

impl Client {
    pub async fn vhost_create_blk_controller(
        &self,
        args: &CreateBlkControllerArgs,
    ) -> Result<bool, RpcError> {
        self.call("vhost_create_blk_controller", args).await
    }

    pub async fn vhost_delete_controller(
        &self,
        args: &DeleteControllerArgs,
    ) -> Result<bool, RpcError> {
        self.call("vhost_delete_controller", args).await
    }

    pub async fn vhost_get_controllers(
        &self,
        args: &GetControllersArgs,
    ) -> Result<Vec<Controller>, RpcError> {
        let raw: Vec<RawController> = self.call("vhost_get_controllers", args).await?;
        Ok(raw.into_iter().map(Controller::from).collect())
    }
}
