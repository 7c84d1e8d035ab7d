use std::sync::Arc;

use log::debug;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::download::error::TransferError;
use crate::download::segment::{SegmentHandle, SegmentSignal};
use crate::progress::ProgressSink;

/// Drains completion signals strictly in ascending index order and appends
/// each buffer to `file`.
///
/// Sequential appends are correct because segments are visited in order
/// against a freshly created file, no matter in which order the fetchers
/// finish. Each buffer is dropped immediately after it lands on disk, so
/// memory stays bounded by the in-flight fetches plus the completed
/// segments the writer has not reached yet.
pub async fn drain(
    handles: Vec<SegmentHandle>,
    mut file: File,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressSink>,
) -> Result<(), TransferError> {
    for handle in handles {
        let index = handle.segment.index;
        let signal = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            signal = handle.wait() => signal,
        };
        match signal {
            Some(SegmentSignal::Filled(buf)) => {
                file.write_all(&buf).await.map_err(TransferError::Write)?;
                progress.bytes_written(buf.len() as u64);
                debug!("segment {index} flushed ({} bytes)", buf.len());
            }
            Some(SegmentSignal::Failed(failure)) => {
                return Err(TransferError::Segment {
                    index: failure.index,
                    attempts: failure.attempts,
                    cause: failure.cause,
                });
            }
            // Producer dropped without signalling: its task was cancelled.
            None => return Err(TransferError::Cancelled),
        }
    }
    file.flush().await.map_err(TransferError::Write)?;
    file.sync_all().await.map_err(TransferError::Write)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::error::SegmentError;
    use crate::download::segment::{split, Segment};
    use crate::progress::NoopSink;
    use std::time::Duration;
    use tokio::time::sleep;

    fn pairs(lens: &[usize]) -> (Vec<crate::download::segment::SegmentSlot>, Vec<SegmentHandle>) {
        let mut start = 0u64;
        let mut slots = Vec::new();
        let mut handles = Vec::new();
        for (index, len) in lens.iter().enumerate() {
            let segment = Segment {
                index,
                start,
                end: start + *len as u64 - 1,
            };
            let (slot, handle) = split(segment);
            slots.push(slot);
            handles.push(handle);
            start += *len as u64;
        }
        (slots, handles)
    }

    #[tokio::test]
    async fn writes_in_index_order_regardless_of_completion_order() {
        let lens = [3usize, 5, 2, 7, 1, 4];
        let (slots, handles) = pairs(&lens);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let file = File::create(&path).await.unwrap();

        let mut expected = Vec::new();
        for (index, len) in lens.iter().enumerate() {
            expected.extend(std::iter::repeat(index as u8).take(*len));
        }

        // Complete in reverse order with staggered latency.
        for (i, slot) in slots.into_iter().enumerate().rev() {
            let delay = Duration::from_millis(((lens.len() - i) * 10) as u64);
            let payload = vec![i as u8; lens[i]];
            tokio::spawn(async move {
                sleep(delay).await;
                slot.complete(payload);
            });
        }

        let cancel = CancellationToken::new();
        drain(handles, file, cancel, Arc::new(NoopSink))
            .await
            .unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, expected);
    }

    #[tokio::test]
    async fn failed_signal_surfaces_segment_error() {
        let (mut slots, handles) = pairs(&[2, 2, 2]);

        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("out.bin")).await.unwrap();

        let failing = slots.remove(1);
        slots.remove(0).complete(vec![0, 0]);
        failing.fail(
            3,
            SegmentError::ShortBody {
                expected: 2,
                got: 0,
            },
        );
        // Third slot never completes; the writer must stop at the failure
        // before reaching it.
        let trailing = slots.remove(0);

        let cancel = CancellationToken::new();
        let err = drain(handles, file, cancel, Arc::new(NoopSink))
            .await
            .unwrap_err();
        match err {
            TransferError::Segment {
                index, attempts, ..
            } => {
                assert_eq!(index, 1);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        drop(trailing);
    }

    #[tokio::test]
    async fn cancellation_stops_the_drain() {
        let (slots, handles) = pairs(&[2, 2]);

        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("out.bin")).await.unwrap();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let err = drain(handles, file, cancel, Arc::new(NoopSink))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        drop(slots);
    }

    #[tokio::test]
    async fn dropped_producer_counts_as_cancellation() {
        let (slots, handles) = pairs(&[2]);
        drop(slots);

        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("out.bin")).await.unwrap();

        let err = drain(handles, file, CancellationToken::new(), Arc::new(NoopSink))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }
}
