//! Concurrent byte-range downloader: plans a file into segments, fetches
//! them through a bounded worker pool and reassembles them strictly in
//! order, with a single-stream fallback for servers without range support.

pub mod cli;
pub mod download;
pub mod progress;
pub mod util;
