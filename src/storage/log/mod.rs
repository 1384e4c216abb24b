//! Segmented log storage of one replication group.
//!
//! # Module Structure
//!
//! - `entry`: in-memory offset window and the double write buffer
//! - `segment`: data/idx segment file pairs and their record format
//! - `meta`: the crash-safe `meta` file (log meta, hard state, version window)
//! - `store`: the `LogStore` with its flush worker and read path
//! - `manager`: recovery and retention of segments

mod entry;
mod manager;
mod meta;
mod segment;
mod store;


pub use entry::{EntryPosition, LogBuffer, OffsetIndex};
pub use meta::{META_FILE_NAME, META_TMP_FILE_NAME, MetaFile, PersistedMeta};
pub use segment::{LogSegment, OPEN_SEGMENT_END, SegmentName};
pub use store::{FlushSignal, LogStore, LogStoreOptions};
