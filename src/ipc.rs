//! JSON-RPC transport for the SPDK control socket.
//!
//! This module provides the Rust-side boundary for talking to a running SPDK
//! application over its Unix domain socket using a lightly customized
//! JSON-RPC 2.0 dialect.
//!
//! # Architecture
//!
//! ```text
//!  caller ──► Client::invoke ──► mpsc queue ──► writer task ──► socket
//!                 ▲                                              │
//!                 │ oneshot per call                             ▼
//!             Registry ◄── envelope::parse_error_field ◄ ResponseReader (reader task)
//! ```
//!
//! One background task owns the read half of the socket and routes every
//! decoded response to the waiter registered under its id, so responses may
//! arrive in any order. Another owns the write half and writes queued
//! requests one at a time; a caller that gives up never cuts a request short.
//!
//! # Protocol
//!
//! Envelopes are bare JSON objects separated by whitespace (one per line on
//! the way out):
//!
//! ```text
//! {"jsonrpc":"2.0","method":"bdev_get_bdevs","id":1}
//! {"jsonrpc":"2.0","method":"bdev_malloc_create","params":{"block_size":4096,"num_blocks":10240},"id":2}
//! ```
//!
//! `params` is a single value rather than an array, and is left out entirely
//! when the caller has none.
//!
//! # Usage
//!
//! ```ignore
//! use spdkctrl::ipc::Client;
//! use serde_json::json;
//!
//! let client = Client::connect("/var/tmp/spdk.sock").await?;
//! let name: String = client
//!     .invoke("bdev_malloc_create", Some(&json!({"block_size": 4096, "num_blocks": 10240})))
//!     .await?;
//! ```

mod client;
mod envelope;
mod framing;
mod registry;

pub use client::{Client, RpcError};
pub use envelope::{
    is_json_error, parse_json_error, ERROR_INTERNAL_ERROR, ERROR_INVALID_PARAMS,
    ERROR_INVALID_REQUEST, ERROR_INVALID_STATE, ERROR_METHOD_NOT_FOUND, ERROR_PARSE_ERROR,
};
pub use framing::{encode_request, is_connection_closed, ResponseEnvelope, ResponseReader};
