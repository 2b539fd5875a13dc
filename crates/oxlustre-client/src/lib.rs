//! Filesystem client core for OxLustre.
//!
//! A [`Session`] is one mounted filesystem. It talks to a metadata service
//! through [`mdc::MdcClient`] and to the storage targets through
//! [`lov::LovClient`], which fans each operation out over the stripes of a
//! file. Cached inode attributes are trusted only while a lock from
//! [`oxlustre_dlm`] protects them:
//!
//! - [`inode`]: the inode cache and its merge rules
//! - [`revalidate`]: lock-coherent attribute revalidation and glimpses
//! - [`dispatch`]: the POSIX-shaped operations (`lookup`, `setattr`, `read`, ...)
//! - [`obd`]: the device capability trait every backend implements
//!
//! # Example
//!
//! ```
//! use oxlustre_client::{ClientConfig, LockServices, MountTargets, OpenFlags, Session};
//! use oxlustre_sim::{SimConfig, TestCluster};
//! use bytes::Bytes;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cluster = TestCluster::start(SimConfig::default());
//! let session = Session::mount(
//!     ClientConfig::local(),
//!     cluster.transport(),
//!     MountTargets {
//!         metadata: cluster.metadata_endpoint(),
//!         storage: cluster.storage_endpoints(),
//!     },
//!     LockServices {
//!         metadata: cluster.metadata_locks(),
//!         data: cluster.data_locks(),
//!     },
//! )
//! .await?;
//!
//! let root = session.root();
//! let fd = session
//!     .open_at(root, "hello.txt", OpenFlags::RDWR | OpenFlags::CREATE, 0o644)
//!     .await?;
//! session.write(fd, 0, Bytes::from_static(b"Hello, Lustre!")).await?;
//! let data = session.read(fd, 0, 64).await?;
//! assert_eq!(&data[..], b"Hello, Lustre!");
//! session.close(fd).await?;
//!
//! session.unmount().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod file;
pub mod inode;
pub mod lov;
pub mod mdc;
pub mod obd;
pub mod osc;
pub mod revalidate;
pub mod session;
pub mod single_flight;
pub mod stats;

pub use config::{ClientConfig, Credentials};
pub use dispatch::{Fcntl, Ioctl, NAME_MAX};
pub use error::{ClientError, ClientResult, ErrorCategory, PartialFailure, StripeFailure};
pub use file::{FileTable, OpenFile, OpenFlags};
pub use inode::{FileAttr, Inode, InodeCache, InodeStatus};
pub use obd::{CreateSpec, ExportHandle, IoOp, ObdOps, Prepared};
pub use session::{LockServices, MountTargets, Session};
pub use stats::{ClientStats, ClientStatsSnapshot};
