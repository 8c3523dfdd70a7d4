//! spdkctrl Library
//!
//! Control library for the SPDK storage application:
//!
//! - `ipc` - JSON-RPC client for SPDK's Unix control socket
//! - `rpc` - Typed bindings for the bdev, lvol, nbd and vhost methods
//! - `app` - Supervisor that starts and stops the SPDK process
//! - `logging` - `tracing` subscriber setup for binaries
//!
//! # IPC Module
//!
//! `ipc::Client` owns one connection and may be shared between tasks; the
//! bindings in `rpc` are methods on it:
//!
//! ```ignore
//! use spdkctrl::ipc::Client;
//! use spdkctrl::rpc::bdev::MallocCreateArgs;
//!
//! let client = Client::connect("/var/tmp/spdk.sock").await?;
//! let name = client
//!     .bdev_malloc_create(&MallocCreateArgs { block_size: 4096, num_blocks: 10240, ..Default::default() })
//!     .await?;
//! ```

pub mod app;
pub mod ipc;
pub mod logging;
pub mod rpc;
