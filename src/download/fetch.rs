use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, warn};
use reqwest::{header, Client, StatusCode, Url};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::download::error::SegmentError;
use crate::download::segment::SegmentSlot;
use crate::progress::ProgressSink;

/// Shared context for every fetch worker of one attempt.
#[derive(Clone)]
pub struct FetchContext {
    pub client: Client,
    pub url: Url,
    pub limiter: Arc<Semaphore>,
    pub cancel: CancellationToken,
    pub max_attempts: usize,
    pub progress: Arc<dyn ProgressSink>,
}

/// How one worker ended. A permanent failure has already been signalled to
/// the writer through the slot by the time this is returned.
#[derive(Debug, Clone, Copy)]
pub enum FetchOutcome {
    Completed(usize),
    Failed(usize),
    Cancelled,
}

/// Downloads one segment into memory, gated by the limiter.
///
/// The limiter permit is held across every retry of this worker: retries
/// are a property of the worker, not new admissions. Queued acquisitions
/// unblock with `Cancelled` when the token fires.
pub async fn run(ctx: FetchContext, slot: SegmentSlot) -> FetchOutcome {
    let permit = tokio::select! {
        _ = ctx.cancel.cancelled() => return FetchOutcome::Cancelled,
        permit = ctx.limiter.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return FetchOutcome::Cancelled,
        },
    };
    let _permit = permit;

    let segment = slot.segment;
    let mut buf = Vec::with_capacity(segment.len() as usize);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match fetch_once(&ctx, &slot, &mut buf).await {
            Ok(()) => {
                let index = segment.index;
                slot.complete(buf);
                ctx.progress.segment_fetched();
                return FetchOutcome::Completed(index);
            }
            Err(SegmentError::Cancelled) => return FetchOutcome::Cancelled,
            Err(err) if attempt < ctx.max_attempts => {
                // Invariant: an incomplete segment's buffer is always empty.
                buf.clear();
                warn!(
                    "segment {} attempt {attempt} failed: {err}; retrying",
                    segment.index
                );
                let backoff = Duration::from_secs(attempt as u64);
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return FetchOutcome::Cancelled,
                    _ = sleep(backoff) => {}
                }
            }
            Err(err) => {
                let index = segment.index;
                warn!("segment {index} failed permanently after {attempt} attempts: {err}");
                slot.fail(attempt, err);
                return FetchOutcome::Failed(index);
            }
        }
    }
}

/// One ranged GET streamed into `buf`. The server must answer with
/// 206 Partial Content and exactly the requested byte count.
async fn fetch_once(
    ctx: &FetchContext,
    slot: &SegmentSlot,
    buf: &mut Vec<u8>,
) -> Result<(), SegmentError> {
    let segment = slot.segment;
    let request = ctx
        .client
        .get(ctx.url.clone())
        .header(header::RANGE, segment.range_header());

    let response = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(SegmentError::Cancelled),
        response = request.send() => response.map_err(SegmentError::Transport)?,
    };
    if response.status() != StatusCode::PARTIAL_CONTENT {
        return Err(SegmentError::Status {
            status: response.status(),
        });
    }

    let expected = segment.len();
    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(SegmentError::Cancelled),
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(chunk)) => {
                if buf.len() as u64 + chunk.len() as u64 > expected {
                    return Err(SegmentError::Overrun { expected });
                }
                buf.extend_from_slice(&chunk);
            }
            Some(Err(err)) => return Err(SegmentError::Transport(err)),
            None => break,
        }
    }
    if (buf.len() as u64) != expected {
        return Err(SegmentError::ShortBody {
            expected,
            got: buf.len() as u64,
        });
    }
    debug!("segment {} fetched ({expected} bytes)", segment.index);
    Ok(())
}
