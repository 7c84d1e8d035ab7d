use std::io;

use reqwest::StatusCode;
use thiserror::Error;

/// Failure of the HEAD probe. Always fatal for the current attempt.
///
/// Unknown size, zero size and missing range support are deliberately not
/// represented here: they select the single-stream fallback and are carried
/// in [`Metadata`](crate::download::Metadata) instead.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata request timed out")]
    Timeout,
    #[error("metadata request returned status {0}")]
    Status(StatusCode),
    #[error("metadata request failed: {0}")]
    Transport(#[source] reqwest::Error),
}

/// One failed fetch of one segment. Transient until the worker's retry
/// budget is exhausted, at which point it becomes the cause inside
/// [`TransferError::Segment`].
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("unexpected status {status}")]
    Status { status: StatusCode },
    #[error("stream error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("short body: expected {expected} bytes, got {got}")]
    ShortBody { expected: u64, got: u64 },
    #[error("server sent more than the requested {expected} bytes")]
    Overrun { expected: u64 },
    #[error("cancelled")]
    Cancelled,
}

/// First fatal cause of a transfer attempt, as observed by the controller.
/// Cancellation is typed so it is never confused with an ordinary failure.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("download cancelled")]
    Cancelled,
    #[error("segment {index} failed after {attempts} attempts: {cause}")]
    Segment {
        index: usize,
        attempts: usize,
        #[source]
        cause: SegmentError,
    },
    #[error("write to output file failed: {0}")]
    Write(#[source] io::Error),
    #[error("request failed: {0}")]
    Http(#[source] reqwest::Error),
    #[error("download failed with status {0}")]
    Status(StatusCode),
    #[error("worker task panicked: {0}")]
    WorkerPanic(String),
}
