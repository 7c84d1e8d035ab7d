use crate::download::segment::Segment;

/// Partitions `[0, size)` into inclusive byte ranges of at most
/// `chunk_size` bytes each.
///
/// Produces `ceil(size / chunk_size)` segments, minimum one. Segment `i`
/// spans `[chunk_size * i, chunk_size * (i + 1) - 1]`; the last segment's
/// end is clamped to `size - 1`. Pure and deterministic.
pub fn plan(size: u64, chunk_size: u64) -> Vec<Segment> {
    let chunk_size = chunk_size.max(1);
    let count = ((size + chunk_size - 1) / chunk_size).max(1);
    let mut segments = Vec::with_capacity(count as usize);
    for i in 0..count {
        let start = chunk_size * i;
        let end = if i == count - 1 {
            size.saturating_sub(1)
        } else {
            chunk_size * (i + 1) - 1
        };
        segments.push(Segment {
            index: i as usize,
            start,
            end,
        });
    }
    segments
}
