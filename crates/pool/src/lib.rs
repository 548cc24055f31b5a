#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `pool` is the process-wide memory of in-flight transfers: every upload
//! and download registers here at submission, reports per-segment progress
//! through a bitmap, and is purged on completion or cancellation. The
//! transfer drivers poll this registry for pause/cancel flags and record
//! which peers hold which segments.
//!
//! # Design
//!
//! - One outer reader/writer lock guards the task map; each task has its
//!   own inner mutex, taken only after the outer lock is released.
//! - Upload completion means every bit set (each segment has a holder);
//!   download completion means `data_segments` bits set, in any positions,
//!   which is exactly the Reed-Solomon recovery threshold.
//! - Bits are monotonic: only an explicit download reset clears them.
//!
//! # Invariants
//!
//! - Task ids are unique across uploads and downloads.
//! - A segment status never moves backwards out of `Completed`.
//! - `incomplete_pieces` for a download lists parity segments after data
//!   segments.

mod bitmap;
mod download;
mod error;
mod pool;
mod segment;
mod upload;

pub use crate::bitmap::Bitmap;
pub use crate::download::DownloadTask;
pub use crate::error::{PoolError, PoolResult};
pub use crate::pool::TaskPool;
pub use crate::segment::{SegmentMeta, SegmentState, SegmentStatus};
pub use crate::upload::UploadTask;
