//! Typed bindings for the SPDK method catalogue.
//!
//! Each binding is an argument record, a result type and one call into
//! [`Client::invoke`]. They are grouped by method family:
//!
//! - `bdev` - malloc/aio block devices and `bdev_get_bdevs`
//! - `lvol` - logical volume stores and logical volumes
//! - `nbd` - network block device exports
//! - `vhost` - vhost-blk controllers and `vhost_get_controllers`
//!
//! Optional fields are left out of the request when unset. An argument
//! record with nothing set is sent without a `params` member at all.

pub mod bdev;
pub mod lvol;
pub mod nbd;
pub mod vhost;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::ipc::{Client, RpcError};

impl Client {
    /// Invoke `method` with a binding's argument record.
    pub(crate) async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(args).map_err(RpcError::Encode)?;
        let params = match params {
            Value::Object(ref map) if map.is_empty() => None,
            Value::Null => None,
            other => Some(other),
        };
        self.invoke(method, params.as_ref()).await
    }
}

/// `skip_serializing_if` for optional strings: unset and empty both omit.
pub(crate) fn is_unset(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, str::is_empty)
}

pub(crate) fn is_false(value: &bool) -> bool {
    !*value
}

/// Reject an argument record before anything is sent.
pub(crate) fn invalid_params(detail: impl Into<String>) -> RpcError {
    RpcError::InvalidParams(detail.into())
}


#[cfg(test)]
mod tests {
    use super::testing::{mock_result, only_request};
    use super::*;
    use serde_json::json;

    #[derive(Serialize, Default)]
    struct Args {
        #[serde(skip_serializing_if = "is_unset")]
        name: Option<String>,
        #[serde(skip_serializing_if = "is_false")]
        readonly: bool,
    }

    #[tokio::test]
    async fn test_empty_args_omit_params() {
        let (client, requests) = mock_result(json!([]));

        let result: Vec<Value> = client.call("bdev_get_bdevs", &Args::default()).await.unwrap();
        assert!(result.is_empty());

        let request = only_request(&requests);
        assert!(request.get("params").is_none());
        assert_eq!(request["method"], "bdev_get_bdevs");
        assert_eq!(request["id"], 1);
    }

    #[tokio::test]
    async fn test_empty_string_counts_as_unset() {
        let (client, requests) = mock_result(json!(true));

        let args = Args {
            name: Some(String::new()),
            readonly: true,
        };
        let _: bool = client.call("m", &args).await.unwrap();

        assert_eq!(only_request(&requests)["params"], json!({"readonly": true}));
    }

    #[test]
    fn test_is_unset() {
        assert!(is_unset(&None));
        assert!(is_unset(&Some(String::new())));
        assert!(!is_unset(&Some("lvs0".into())));
    }
}
