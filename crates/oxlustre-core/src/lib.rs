//! Core types of the OxLustre filesystem client.
//!
//! This crate holds everything both the client and the services agree on:
//!
//! - [`fid`]: identity of metadata objects and storage objects
//! - [`attr`]: wire attributes with validity masks, and attribute diffs
//! - [`stripe`]: stripe metadata, its blob format and the striping math
//! - [`statfs`]: usage reports and their aggregation
//! - [`protocol`]: request/reply messages and their codec
//! - [`transport`]: the transport seam and the RPC client with resend policy

pub mod attr;
pub mod error;
pub mod fid;
pub mod protocol;
pub mod statfs;
pub mod stripe;
pub mod transport;

pub use attr::{AttrValid, FileType, SetAttr, SetAttrValid, WireAttrs};
pub use error::{CodecError, RpcError, TransportError};
pub use fid::{Fid, ObjectId};
pub use protocol::{DirEntry, MdBody, Opcode, Reply, Request};
pub use statfs::{ObdStatfs, StatVfs};
pub use stripe::{StripeError, StripeExtent, StripeIo, StripeMd, StripeObject};
pub use transport::{Endpoint, ImportEvent, ImportState, RetryPolicy, RpcClient, ServiceKind, Transport};
