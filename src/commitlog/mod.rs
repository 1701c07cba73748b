//! Commit Log Module
//!
//! Segmented, append-only record log. Records are framed into a store
//! file with an 8-byte length prefix and located through a fixed-width
//! memory-mapped index, one (store, index) pair per segment.

mod index;
mod log;
mod record;
mod segment;
mod store;

pub use index::Index;
pub(crate) use log::read_frame;
pub use log::{Log, LogReader};
pub use record::Record;
pub use segment::Segment;
pub use store::Store;

pub use crate::config::SegmentConfig;
