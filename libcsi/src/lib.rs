//! # libcsi: CSI driver for cloud block volumes
//!
//! `libcsi` implements a [Container Storage Interface][csi] plugin that
//! provisions network block volumes through the Hetzner Cloud API, attaches
//! them to servers and mounts them for workloads on the node.  Requests
//! reach the plugin as JSON over a local unix socket.  It follows the RK8s
//! conventions (Tokio async runtime, `tracing` for observability,
//! `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] and its standardized [`Code`](error::Code). |
//! | [`message`] | [`CsiMessage`] protocol envelope and [`CsiRequest`](message::CsiRequest). |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery and health. |
//! | [`controller`] | [`CsiController`] trait: create, delete, attach, detach. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage. |
//! | [`transport`] | Unix-socket client/server. |
//! | [`config`] | Driver tunables. |
//! | [`cloud`] | Cloud volume API client and an in-memory fake. |
//! | [`waiter`] | Polls cloud actions to completion under a deadline. |
//! | [`retry`] | Bounded backoff for transient cloud failures. |
//! | [`lock`] | Per-key lock registry. |
//! | [`mount`] | Device discovery, formatting and mounting. |
//! | [`backend`] | The controller and node services and the combined [`Driver`](backend::Driver). |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod cloud;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod lock;
pub mod message;
pub mod mount;
pub mod node;
pub mod retry;
pub mod transport;
pub mod types;
pub mod waiter;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::Driver;
pub use config::DriverConfig;
pub use controller::CsiController;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;
