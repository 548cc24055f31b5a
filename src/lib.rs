#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `defs` assembles a peer-to-peer distributed file storage node. A file
//! is split into fixed-size segments, extended with Reed-Solomon parity,
//! dispersed across peers chosen from a Kademlia-style k-bucket table, and
//! later recovered from any sufficient subset of holders by an authorized
//! requester.
//!
//! The heavy lifting lives in the workspace crates; this crate wires them
//! together:
//!
//! - [`protocol`]: length-framed wire transport with checksums, sequence
//!   tracking, heartbeats, flow control and bounded send queues.
//! - [`routing`]: XOR-metric k-bucket table with per-CPL diversity
//!   filtering.
//! - [`engine`]: erasure-coded dispersal and recovery drivers plus the
//!   serving side.
//! - [`pool`]: the process-wide task registry with bitmap progress.
//!
//! # Example
//!
//! ```no_run
//! use defs::{Node, NodeConfig};
//! use bytes::Bytes;
//!
//! # async fn run() -> Result<(), defs::NodeError> {
//! let node = Node::start(NodeConfig::default()).await?;
//! let manifest = node
//!     .upload("task-1", "file-1", b"hello world", Bytes::new(), Bytes::new())
//!     .await?;
//! let bytes = node.download("task-2", &manifest, Bytes::new()).await?;
//! assert_eq!(&bytes[..], b"hello world");
//! # Ok(())
//! # }
//! ```

mod error;
mod node;

pub use crate::error::NodeError;
pub use crate::node::{Node, NodeConfig};

pub use engine::{
    AclAuthorizer, AllowAll, Authorizer, Downloader, DownloadConfig, EngineError, FileManifest,
    MemorySegmentStore, ParityPlan, SegmentService, SegmentStore, TcpDialer, Uploader,
    UploadConfig,
};
pub use identity::{DhtId, Mode, NodeId};
pub use pool::TaskPool;
pub use protocol::{Connection, ConnectionConfig, ProtocolError};
pub use routing::{RoutingTable, TableConfig};
