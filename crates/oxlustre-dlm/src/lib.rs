//! Distributed lock manager for OxLustre.
//!
//! Two halves share this crate:
//!
//! - [`LockServer`]: a lock namespace. Owns resources, grants locks in strict
//!   FIFO order, sends blocking callbacks and evicts clients that ignore them.
//! - [`LockClient`]: the per-client lock table. Caches granted locks after
//!   release, matches new requests against them, and cancels unused locks
//!   lazily (on callback or LRU overflow).
//!
//! They talk through the [`LockService`] trait, so a client can sit on top of
//! anything that implements the namespace side.
//!
//! # Example
//!
//! ```
//! use oxlustre_dlm::{
//!     ClientId, InodeBits, LockClient, LockFlags, LockMode, LockServer, Policy, ResourceId,
//!     DEFAULT_ACK_TIMEOUT,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let server = LockServer::new("mds", DEFAULT_ACK_TIMEOUT);
//! let client = LockClient::connect(ClientId::random(), Arc::new(server), 128);
//!
//! let resource = ResourceId([1, 0, 0]);
//! let policy = Policy::InodeBits(InodeBits::UPDATE);
//! let handle = client
//!     .acquire(resource, LockMode::Pr, policy, LockFlags::empty(), None)
//!     .await
//!     .unwrap();
//! client.release(handle).unwrap();
//!
//! // Served from the cache without another enqueue
//! assert!(client.test_lock(resource, LockMode::Pr, &policy));
//! # }
//! ```

pub mod client;
pub mod error;
pub mod metrics;
pub mod mode;
pub mod policy;
pub mod resource;
pub mod server;
pub mod service;

pub use client::{AstSink, ClientLock, LockClient, LockHandle, LockNotice, LockState, NoticeReason, ScopedLock};
pub use error::{DlmError, DlmResult};
pub use metrics::{LockMetrics, LockMetricsSnapshot};
pub use mode::LockMode;
pub use policy::{EOF, Extent, InodeBits, Policy};
pub use resource::{ClientId, LockCookie, ResourceId};
pub use server::{DEFAULT_ACK_TIMEOUT, LockServer};
pub use service::{EnqueueRequest, Grant, LockFlags, LockService, ServerEvent};
