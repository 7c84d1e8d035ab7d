use tokio::sync::oneshot;

use crate::download::error::SegmentError;

/// One contiguous inclusive byte range of the target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Terminal fetch signal for one segment. The success variant carries the
/// fully accumulated buffer, so an incomplete segment never exposes bytes.
#[derive(Debug)]
pub enum SegmentSignal {
    Filled(Vec<u8>),
    Failed(SegmentFailure),
}

/// Permanent failure of one segment after its retry budget ran out.
#[derive(Debug)]
pub struct SegmentFailure {
    pub index: usize,
    pub attempts: usize,
    pub cause: SegmentError,
}

/// Producer half of a segment's completion handoff; owned by exactly one
/// fetch worker. `complete` and `fail` consume the slot, so at most one
/// signal is ever produced.
pub struct SegmentSlot {
    pub segment: Segment,
    signal: oneshot::Sender<SegmentSignal>,
}

/// Consumer half; owned by the ordered writer.
pub struct SegmentHandle {
    pub segment: Segment,
    signal: oneshot::Receiver<SegmentSignal>,
}

/// Creates the single-producer/single-consumer pair for one segment.
pub fn split(segment: Segment) -> (SegmentSlot, SegmentHandle) {
    let (tx, rx) = oneshot::channel();
    (
        SegmentSlot {
            segment,
            signal: tx,
        },
        SegmentHandle {
            segment,
            signal: rx,
        },
    )
}

impl SegmentSlot {
    /// Hands the fully downloaded buffer to the writer.
    pub fn complete(self, buf: Vec<u8>) {
        debug_assert_eq!(buf.len() as u64, self.segment.len());
        // The writer may already be gone when the attempt is unwinding.
        let _ = self.signal.send(SegmentSignal::Filled(buf));
    }

    /// Reports permanent failure after `attempts` exhausted tries.
    pub fn fail(self, attempts: usize, cause: SegmentError) {
        let failure = SegmentFailure {
            index: self.segment.index,
            attempts,
            cause,
        };
        let _ = self.signal.send(SegmentSignal::Failed(failure));
    }
}

impl SegmentHandle {
    /// Waits for the segment's terminal signal. `None` means the producer
    /// dropped without signalling, which only happens when its task was
    /// cancelled.
    pub async fn wait(self) -> Option<SegmentSignal> {
        self.signal.await.ok()
    }
}
