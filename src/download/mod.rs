mod error;
mod fetch;
mod job;
mod planner;
mod segment;
mod writer;

pub use error::{MetadataError, SegmentError, TransferError};
pub use job::{Job, Metadata, Outcome};
pub use planner::plan;
pub use segment::Segment;

use std::path::PathBuf;

use url::Url;

pub const DEFAULT_THREAD_NUM: usize = 6;
pub const DEFAULT_CHUNK_SIZE: u64 = 16 << 20; // 16 MiB
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    Quiet,
    Text,
    Json,
}

/// Explicit per-job configuration; there is no process-wide state.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub url: Url,
    pub output_dir: PathBuf,
    /// Upper bound on concurrently in-flight segment fetches.
    pub thread_num: usize,
    /// Maximum byte length of one segment.
    pub chunk_size: u64,
    /// Fetch attempts per segment before the transfer is declared failed.
    pub max_attempts: usize,
    pub proxy: Option<Url>,
    pub progress: ProgressMode,
}
