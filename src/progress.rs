//! Progress reporting decoupled from the transfer core.
//!
//! The core only bumps [`ProgressSink`] counters; a spawned reporter task
//! owns the rendering, so the sink can never block a fetcher or the writer.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::download::ProgressMode;

const PROGRESS_TICK: Duration = Duration::from_millis(250);

/// Observational event sink fed by the transfer core.
///
/// Implementations must not block: the writer and the fetch workers call
/// these from their hot paths.
pub trait ProgressSink: Send + Sync {
    /// A segment's fetch finished successfully.
    fn segment_fetched(&self);
    /// `n` more bytes were flushed to the output file.
    fn bytes_written(&self, n: u64);
}

/// Sink that discards all events.
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn segment_fetched(&self) {}
    fn bytes_written(&self, _n: u64) {}
}

#[derive(Default)]
struct Counters {
    bytes_written: AtomicU64,
    segments_fetched: AtomicUsize,
}

impl ProgressSink for Counters {
    fn segment_fetched(&self) {
        self.segments_fetched.fetch_add(1, Ordering::Relaxed);
    }

    fn bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressFinish {
    Success,
    Failure,
}

/// Handle to the rendering task. Stopping is explicit via
/// [`ProgressReporter::finish`]; dropping aborts the task so an unwinding
/// attempt leaves no stray ticker behind.
pub struct ProgressReporter {
    stop_tx: Option<oneshot::Sender<ProgressFinish>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    /// Spawns the reporter for `mode` and returns it together with the
    /// sink handed to the transfer core. Quiet mode spawns nothing.
    pub fn spawn(
        mode: ProgressMode,
        total_bytes: Option<u64>,
        total_segments: Option<usize>,
    ) -> (Option<Self>, Arc<dyn ProgressSink>) {
        match mode {
            ProgressMode::Quiet => (None, Arc::new(NoopSink)),
            ProgressMode::Text => {
                let counters = Arc::new(Counters::default());
                let reporter = Self::spawn_text(total_bytes, counters.clone());
                (Some(reporter), counters)
            }
            ProgressMode::Json => {
                let counters = Arc::new(Counters::default());
                let reporter = Self::spawn_json(total_bytes, total_segments, counters.clone());
                (Some(reporter), counters)
            }
        }
    }

    pub async fn finish(mut self, finish: ProgressFinish) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(finish);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    fn spawn_text(total_bytes: Option<u64>, counters: Arc<Counters>) -> Self {
        let bar = match total_bytes {
            Some(total) => {
                let bar = ProgressBar::new(total);
                bar.set_style(
                    ProgressStyle::with_template(
                        "{bar:32.cyan/blue} {bytes}/{total_bytes} {bytes_per_sec} eta {eta}",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::with_template("{spinner} {bytes} {bytes_per_sec}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                bar
            }
        };

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(PROGRESS_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        bar.set_position(counters.bytes_written.load(Ordering::Relaxed));
                    }
                    result = &mut stop_rx => {
                        bar.set_position(counters.bytes_written.load(Ordering::Relaxed));
                        match result.unwrap_or(ProgressFinish::Failure) {
                            ProgressFinish::Success => bar.finish(),
                            ProgressFinish::Failure => bar.abandon(),
                        }
                        break;
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    fn spawn_json(
        total_bytes: Option<u64>,
        total_segments: Option<usize>,
        counters: Arc<Counters>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(PROGRESS_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let start = Instant::now();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        emit(JsonProgressEvent::progress(
                            &counters, total_bytes, total_segments, start,
                        ));
                    }
                    result = &mut stop_rx => {
                        let finish = result.unwrap_or(ProgressFinish::Failure);
                        emit(JsonProgressEvent::finish(
                            &counters, total_bytes, total_segments, start, finish,
                        ));
                        break;
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn emit(event: JsonProgressEvent) {
    if let Ok(serialized) = serde_json::to_string(&event) {
        println!("{serialized}");
    }
}

#[derive(Serialize)]
struct JsonProgressEvent {
    event: &'static str,
    timestamp_ms: u128,
    elapsed_ms: u128,
    bytes_written: u64,
    total_bytes: Option<u64>,
    fraction: Option<f64>,
    bytes_per_second: f64,
    segments_fetched: usize,
    total_segments: Option<usize>,
}

impl JsonProgressEvent {
    fn progress(
        counters: &Counters,
        total_bytes: Option<u64>,
        total_segments: Option<usize>,
        start: Instant,
    ) -> Self {
        Self::build("progress", counters, total_bytes, total_segments, start)
    }

    fn finish(
        counters: &Counters,
        total_bytes: Option<u64>,
        total_segments: Option<usize>,
        start: Instant,
        finish: ProgressFinish,
    ) -> Self {
        let event = match finish {
            ProgressFinish::Success => "complete",
            ProgressFinish::Failure => "failed",
        };
        Self::build(event, counters, total_bytes, total_segments, start)
    }

    fn build(
        event: &'static str,
        counters: &Counters,
        total_bytes: Option<u64>,
        total_segments: Option<usize>,
        start: Instant,
    ) -> Self {
        let bytes_written = counters.bytes_written.load(Ordering::Relaxed);
        let segments_fetched = counters.segments_fetched.load(Ordering::Relaxed);
        let elapsed = start.elapsed();
        let fraction = total_bytes.map(|total| {
            if total == 0 {
                1.0
            } else {
                (bytes_written as f64 / total as f64).min(1.0)
            }
        });
        let bytes_per_second = if elapsed.as_secs_f64() > f64::EPSILON {
            bytes_written as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        JsonProgressEvent {
            event,
            timestamp_ms,
            elapsed_ms: elapsed.as_millis(),
            bytes_written,
            total_bytes,
            fraction,
            bytes_per_second,
            segments_fetched,
            total_segments,
        }
    }
}
