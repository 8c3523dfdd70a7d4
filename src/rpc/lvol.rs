//! Logical volume stores and logical volumes.
//!
//! Several methods address a store by either its UUID or its name. The
//! bindings check that choice locally and fail with
//! [`RpcError::InvalidParams`] without contacting SPDK.

use serde::{Deserialize, Serialize};

use crate::ipc::{Client, RpcError};
use crate::rpc::{invalid_params, is_false, is_unset};

/// How SPDK clears the data region of a new store or volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearMethod {
    None,
    /// SPDK's default when unset.
    Unmap,
    WriteZeroes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateLvstoreArgs {
    pub bdev_name: String,
    pub lvs_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_sz: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clear_method: Option<ClearMethod>,
}

/// Selects a store by UUID or by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LvstoreSelector {
    #[serde(skip_serializing_if = "is_unset")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "is_unset")]
    pub lvs_name: Option<String>,
}

impl LvstoreSelector {
    pub fn by_uuid(uuid: impl Into<String>) -> Self {
        Self {
            uuid: Some(uuid.into()),
            lvs_name: None,
        }
    }

    pub fn by_name(lvs_name: impl Into<String>) -> Self {
        Self {
            uuid: None,
            lvs_name: Some(lvs_name.into()),
        }
    }

    fn is_both(&self) -> bool {
        !is_unset(&self.uuid) && !is_unset(&self.lvs_name)
    }

    fn is_neither(&self) -> bool {
        is_unset(&self.uuid) && is_unset(&self.lvs_name)
    }

    fn require_exactly_one(&self) -> Result<(), RpcError> {
        if self.is_both() || self.is_neither() {
            return Err(invalid_params("exactly one of uuid or lvs_name is required"));
        }
        Ok(())
    }
}

pub type DeleteLvstoreArgs = LvstoreSelector;

/// Leave both unset to list every store.
pub type GetLvstoresArgs = LvstoreSelector;

/// One entry of `bdev_lvol_get_lvstores`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lvstore {
    pub uuid: String,
    pub base_bdev: String,
    pub free_clusters: u64,
    pub cluster_size: u64,
    pub total_data_clusters: u64,
    pub block_size: u64,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateLvolArgs {
    pub lvol_name: String,
    /// Size in bytes.
    pub size: u64,
    #[serde(skip_serializing_if = "is_false")]
    pub thin_provision: bool,
    /// Store to create the volume in; exactly one must be set.
    #[serde(flatten)]
    pub lvstore: LvstoreSelector,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clear_method: Option<ClearMethod>,
}

/// Arguments for methods that take a single lvol name or alias.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LvolNameArgs {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotArgs {
    pub lvol_name: String,
    pub snapshot_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CloneArgs {
    pub snapshot_name: String,
    pub clone_name: String,
}

impl Client {
    /// Create a store on `bdev_name`. Returns the store UUID.
    pub async fn bdev_lvol_create_lvstore(
        &self,
        args: &CreateLvstoreArgs,
    ) -> Result<String, RpcError> {
        self.call("bdev_lvol_create_lvstore", args).await
    }

    pub async fn bdev_lvol_delete_lvstore(
        &self,
        args: &DeleteLvstoreArgs,
    ) -> Result<bool, RpcError> {
        args.require_exactly_one()?;
        self.call("bdev_lvol_delete_lvstore", args).await
    }

    pub async fn bdev_lvol_get_lvstores(
        &self,
        args: &GetLvstoresArgs,
    ) -> Result<Vec<Lvstore>, RpcError> {
        if args.is_both() {
            return Err(invalid_params("uuid and lvs_name are mutually exclusive"));
        }
        self.call("bdev_lvol_get_lvstores", args).await
    }

    /// Create a logical volume. Returns its UUID.
    pub async fn bdev_lvol_create(&self, args: &CreateLvolArgs) -> Result<String, RpcError> {
        args.lvstore.require_exactly_one()?;
        self.call("bdev_lvol_create", args).await
    }

    pub async fn bdev_lvol_delete(&self, args: &LvolNameArgs) -> Result<bool, RpcError> {
        self.call("bdev_lvol_delete", args).await
    }

    /// Snapshot a volume. Returns the snapshot UUID.
    pub async fn bdev_lvol_snapshot(&self, args: &SnapshotArgs) -> Result<String, RpcError> {
        self.call("bdev_lvol_snapshot", args).await
    }

    /// Create a writable clone of a snapshot. Returns the clone UUID.
    pub async fn bdev_lvol_clone(&self, args: &CloneArgs) -> Result<String, RpcError> {
        self.call("bdev_lvol_clone", args).await
    }

    pub async fn bdev_lvol_set_read_only(&self, args: &LvolNameArgs) -> Result<bool, RpcError> {
        self.call("bdev_lvol_set_read_only", args).await
    }

    /// Copy the parent's clusters into the volume and detach it.
    pub async fn bdev_lvol_decouple_parent(&self, args: &LvolNameArgs) -> Result<bool, RpcError> {
        self.call("bdev_lvol_decouple_parent", args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::testing::{mock_engine, mock_result, only_request};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_delete_lvstore_rejects_both_and_neither() {
        let (client, requests) = mock_result(json!(true));

        let both = LvstoreSelector {
            uuid: Some("a6c4f2e0-1d7b-4c51-9fd4-0e1f2a3b4c5d".into()),
            lvs_name: Some("lvs0".into()),
        };
        let err = client.bdev_lvol_delete_lvstore(&both).await.unwrap_err();
        assert!(err.to_string().starts_with("invalid parameters"));

        let neither = LvstoreSelector {
            uuid: Some(String::new()),
            lvs_name: None,
        };
        let err = client.bdev_lvol_delete_lvstore(&neither).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidParams(_)));

        assert!(requests.lock().unwrap().is_empty());
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_delete_lvstore_by_name() {
        let (client, requests) = mock_result(json!(true));

        let deleted = client
            .bdev_lvol_delete_lvstore(&LvstoreSelector::by_name("lvs0"))
            .await
            .unwrap();
        assert!(deleted);
        assert_eq!(only_request(&requests)["params"], json!({"lvs_name": "lvs0"}));
    }

    #[tokio::test]
    async fn test_get_lvstores() {
        let (client, requests) = mock_result(json!([{
            "uuid": "a6c4f2e0-1d7b-4c51-9fd4-0e1f2a3b4c5d",
            "base_bdev": "Malloc0",
            "free_clusters": 31,
            "cluster_size": 4194304,
            "total_data_clusters": 31,
            "block_size": 4096,
            "name": "lvs0"
        }]));

        let stores = client
            .bdev_lvol_get_lvstores(&GetLvstoresArgs::default())
            .await
            .unwrap();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].name, "lvs0");
        assert_eq!(stores[0].cluster_size, 4194304);
        assert!(only_request(&requests).get("params").is_none());

        let both = LvstoreSelector {
            uuid: Some("u".into()),
            lvs_name: Some("n".into()),
        };
        let err = client.bdev_lvol_get_lvstores(&both).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_create_lvstore_clear_method() {
        let (client, requests) = mock_result(json!("a6c4f2e0-1d7b-4c51-9fd4-0e1f2a3b4c5d"));

        let args = CreateLvstoreArgs {
            bdev_name: "Malloc0".into(),
            lvs_name: "lvs0".into(),
            cluster_sz: None,
            clear_method: Some(ClearMethod::WriteZeroes),
        };
        client.bdev_lvol_create_lvstore(&args).await.unwrap();

        assert_eq!(
            only_request(&requests)["params"],
            json!({"bdev_name": "Malloc0", "lvs_name": "lvs0", "clear_method": "write_zeroes"})
        );
    }

    #[tokio::test]
    async fn test_create_lvol_flattens_store_selector() {
        let (client, requests) = mock_result(json!("0b9a6d1c-0000-4000-8000-000000000001"));

        let args = CreateLvolArgs {
            lvol_name: "vol0".into(),
            size: 1 << 30,
            thin_provision: true,
            lvstore: LvstoreSelector::by_name("lvs0"),
            clear_method: None,
        };
        client.bdev_lvol_create(&args).await.unwrap();

        assert_eq!(
            only_request(&requests)["params"],
            json!({"lvol_name": "vol0", "size": 1073741824u64, "thin_provision": true, "lvs_name": "lvs0"})
        );
    }

    #[tokio::test]
    async fn test_create_lvol_requires_store() {
        let (client, requests) = mock_result(json!("x"));

        let args = CreateLvolArgs {
            lvol_name: "vol0".into(),
            size: 4096,
            ..Default::default()
        };
        let err = client.bdev_lvol_create(&args).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidParams(_)));
        assert!(requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_clone_and_decouple() {
        let (client, requests) = mock_engine(|request| match request["method"].as_str() {
            Some("bdev_lvol_snapshot") => json!({"result": "snap-uuid"}),
            Some("bdev_lvol_clone") => json!({"result": "clone-uuid"}),
            _ => json!({"result": true}),
        });

        let snapshot = client
            .bdev_lvol_snapshot(&SnapshotArgs {
                lvol_name: "lvs0/vol0".into(),
                snapshot_name: "snap0".into(),
            })
            .await
            .unwrap();
        let clone = client
            .bdev_lvol_clone(&CloneArgs {
                snapshot_name: "lvs0/snap0".into(),
                clone_name: "clone0".into(),
            })
            .await
            .unwrap();
        let decoupled = client
            .bdev_lvol_decouple_parent(&LvolNameArgs {
                name: "lvs0/clone0".into(),
            })
            .await
            .unwrap();

        assert_eq!(snapshot, "snap-uuid");
        assert_eq!(clone, "clone-uuid");
        assert!(decoupled);

        let methods: Vec<Value> = requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r["method"].clone())
            .collect();
        assert_eq!(
            methods,
            vec![
                json!("bdev_lvol_snapshot"),
                json!("bdev_lvol_clone"),
                json!("bdev_lvol_decouple_parent")
            ]
        );
    }

    #[tokio::test]
    async fn test_lvol_delete_structured_error() {
        let (client, _) = mock_engine(|_| {
            json!({"error": {"code": -19, "message": "No such device"}})
        });

        let err = client
            .bdev_lvol_delete(&LvolNameArgs { name: "nope".into() })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "code: -19 msg: No such device");
        assert!(err.is_json_error(-19));

        let err = client
            .bdev_lvol_set_read_only(&LvolNameArgs { name: "nope".into() })
            .await
            .unwrap_err();
        assert!(crate::ipc::is_json_error(&err, 0));
    }

    // ==================== Property Tests ====================

    mod proptest_lvol {
        use super::*;
        use crate::rpc::testing::block_on;
        use proptest::prelude::*;

        fn optional_name() -> impl Strategy<Value = Option<String>> {
            prop::option::of("[a-z0-9]{0,8}")
        }

        fn clear_method() -> impl Strategy<Value = Option<ClearMethod>> {
            prop::option::of(prop_oneof![
                Just(ClearMethod::None),
                Just(ClearMethod::Unmap),
                Just(ClearMethod::WriteZeroes),
            ])
        }

        fn is_set(value: &Option<String>) -> bool {
            value.as_deref().is_some_and(|v| !v.is_empty())
        }

        proptest! {
            /// A store selector goes out only when exactly one side is set;
            /// otherwise nothing reaches the engine
            #[test]
            fn delete_lvstore_sends_only_valid_selectors(
                uuid in optional_name(),
                lvs_name in optional_name(),
            ) {
                let selector = LvstoreSelector {
                    uuid: uuid.clone(),
                    lvs_name: lvs_name.clone(),
                };
                let (result, sent) = block_on(async {
                    let (client, requests) = mock_result(json!(true));
                    let result = client.bdev_lvol_delete_lvstore(&selector).await;
                    let sent = requests.lock().unwrap().clone();
                    (result, sent)
                });

                if is_set(&uuid) != is_set(&lvs_name) {
                    prop_assert!(result.unwrap());
                    prop_assert_eq!(sent.len(), 1);
                    let params = sent[0]["params"].as_object().unwrap();
                    prop_assert_eq!(params.len(), 1);
                    prop_assert_eq!(params.contains_key("uuid"), is_set(&uuid));
                } else {
                    prop_assert!(matches!(result, Err(RpcError::InvalidParams(_))));
                    prop_assert!(sent.is_empty());
                }
            }

            /// Create arguments arrive flattened, with unset fields left out
            #[test]
            fn create_lvol_args_reach_engine(
                lvol_name in "[a-z][a-z0-9]{0,8}",
                size in any::<u64>(),
                thin_provision in any::<bool>(),
                by_uuid in any::<bool>(),
                store in "[a-z0-9]{1,8}",
                clear in clear_method(),
            ) {
                let lvstore = if by_uuid {
                    LvstoreSelector::by_uuid(store.clone())
                } else {
                    LvstoreSelector::by_name(store.clone())
                };
                let args = CreateLvolArgs {
                    lvol_name: lvol_name.clone(),
                    size,
                    thin_provision,
                    lvstore,
                    clear_method: clear,
                };
                let request = block_on(async {
                    let (client, requests) = mock_result(json!("uuid-1"));
                    client.bdev_lvol_create(&args).await.unwrap();
                    only_request(&requests)
                });

                let mut expected = json!({"lvol_name": lvol_name, "size": size});
                expected[if by_uuid { "uuid" } else { "lvs_name" }] = json!(store);
                if thin_provision {
                    expected["thin_provision"] = json!(true);
                }
                if let Some(clear) = clear {
                    expected["clear_method"] = serde_json::to_value(clear).unwrap();
                }
                prop_assert_eq!(&request["params"], &expected);
            }
        }
    }
}
