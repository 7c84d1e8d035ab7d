use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use reqwest::{header, Client, Url};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::download::error::{MetadataError, TransferError};
use crate::download::fetch::{self, FetchContext, FetchOutcome};
use crate::download::planner::plan;
use crate::download::segment::{self, Segment};
use crate::download::writer;
use crate::download::JobConfig;
use crate::progress::{ProgressFinish, ProgressReporter, ProgressSink};
use crate::util::{format_bytes, hyperlink, unique_file_path};

/// The HEAD probe gets its own short timeout, independent of the transfer.
const HEAD_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period after a successful transfer so the progress UI can settle.
const SETTLE_DELAY: Duration = Duration::from_millis(400);

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";

/// One download task: owns the HTTP client and drives an attempt through
/// init, transfer and cleanup.
pub struct Job {
    config: JobConfig,
    client: Client,
}

/// Resolved file metadata from the HEAD probe.
///
/// `size: None` means the server reported no `Content-Length`; together
/// with `size == Some(0)` and `accepts_ranges == false` these select the
/// single-stream fallback rather than failing the job.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub final_url: Url,
    pub file_name: String,
    pub size: Option<u64>,
    pub accepts_ranges: bool,
}

impl Metadata {
    fn wants_segmented_transfer(&self) -> bool {
        self.accepts_ranges && matches!(self.size, Some(n) if n > 0)
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = match self.size {
            Some(size) => format_bytes(size),
            None => "[unknown]".to_string(),
        };
        write!(
            f,
            "fileName: {}, size: {}, url: {}",
            self.file_name, size, self.final_url
        )
    }
}

/// Terminal state of one download attempt.
#[derive(Debug)]
pub enum Outcome {
    Completed(PathBuf),
    Cancelled,
    Failed(anyhow::Error),
}

impl Job {
    pub fn new(config: JobConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("*/*"));
        headers.insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("no-cache"),
        );
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(10));
        if let Some(proxy) = &config.proxy {
            builder = builder
                .proxy(reqwest::Proxy::all(proxy.as_str()).context("invalid proxy URL")?);
        }
        let client = builder.build().context("failed to build HTTP client")?;
        Ok(Self { config, client })
    }

    /// Runs the job to completion. Each attempt gets a fresh cancellation
    /// token wired to the OS interrupt; a fatal (non-cancellation) error
    /// prompts for a retry from scratch. Returns the final path on
    /// success, `None` when cancelled.
    pub async fn run(&self) -> Result<Option<PathBuf>> {
        loop {
            let cancel = CancellationToken::new();
            let _interrupt = InterruptGuard::install(cancel.clone());
            match self.attempt(cancel).await {
                Outcome::Completed(path) => {
                    info!("downloaded file: {}", hyperlink(&path));
                    return Ok(Some(path));
                }
                Outcome::Cancelled => {
                    warn!("download cancelled");
                    return Ok(None);
                }
                Outcome::Failed(err) => {
                    error!("download failed: {err:#}");
                    if !confirm_retry().await? {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// One full init -> transfer -> cleanup pass. All state (segments,
    /// output file, progress) is fresh; every spawned task observes
    /// `cancel` and none of them outlives the attempt.
    pub async fn attempt(&self, cancel: CancellationToken) -> Outcome {
        // The init phase observes the token just like the transfer phase:
        // an interrupt during the HEAD probe must surface as `Cancelled`,
        // never as a failure that would reach the retry prompt.
        let meta = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            meta = self.resolve_metadata() => match meta {
                Ok(meta) => meta,
                Err(err) => {
                    cancel.cancel();
                    return Outcome::Failed(
                        anyhow::Error::new(err).context("failed to resolve file metadata"),
                    );
                }
            },
        };
        info!("{meta}");

        let path = unique_file_path(self.config.output_dir.join(&meta.file_name));
        let file = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            file = File::create(&path) => match file {
                Ok(file) => file,
                Err(err) => {
                    cancel.cancel();
                    return Outcome::Failed(
                        anyhow::Error::new(err).context(format!("failed to create {path:?}")),
                    );
                }
            },
        };

        let planned = meta
            .wants_segmented_transfer()
            .then(|| plan(meta.size.unwrap_or(0), self.config.chunk_size));
        let (reporter, sink) = ProgressReporter::spawn(
            self.config.progress,
            meta.size,
            planned.as_ref().map(Vec::len),
        );

        let result = match planned {
            Some(segments) => {
                self.run_segmented(meta.final_url.clone(), segments, file, cancel.clone(), sink)
                    .await
            }
            None => {
                if meta.size.is_none() {
                    info!("unknown file size, downloading in a single stream");
                } else if !meta.accepts_ranges {
                    info!("server does not support range requests, downloading in a single stream");
                }
                self.run_single_stream(meta.final_url.clone(), file, cancel.clone(), sink)
                    .await
            }
        };

        match &result {
            Ok(()) => {
                sleep(SETTLE_DELAY).await;
                if let Some(reporter) = reporter {
                    reporter.finish(ProgressFinish::Success).await;
                }
            }
            Err(_) => {
                cancel.cancel();
                if let Some(reporter) = reporter {
                    reporter.finish(ProgressFinish::Failure).await;
                }
            }
        }

        let kept = cleanup(&path, meta.size).await;
        match result {
            Ok(()) => match kept {
                Some(path) => Outcome::Completed(path),
                None => Outcome::Failed(anyhow::anyhow!(
                    "downloaded file size does not match the expected {} bytes",
                    meta.size.unwrap_or(0)
                )),
            },
            Err(TransferError::Cancelled) => Outcome::Cancelled,
            Err(err) => Outcome::Failed(err.into()),
        }
    }

    /// HEAD probe: resolves the post-redirect URL, file name, size and
    /// range support.
    pub async fn resolve_metadata(&self) -> Result<Metadata, MetadataError> {
        let response = self
            .client
            .head(self.config.url.clone())
            .timeout(HEAD_TIMEOUT)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    MetadataError::Timeout
                } else {
                    MetadataError::Transport(err)
                }
            })?;
        if !response.status().is_success() {
            return Err(MetadataError::Status(response.status()));
        }

        let final_url = response.url().clone();
        let file_name = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_disposition)
            .unwrap_or_else(|| crate::util::file_name_from_url(&final_url));
        let size = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let accepts_ranges = response
            .headers()
            .get(header::ACCEPT_RANGES)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase().contains("bytes"))
            .unwrap_or(false);
        debug!(
            "HEAD {final_url}: status {}, length {size:?}, ranges {accepts_ranges}",
            response.status()
        );

        Ok(Metadata {
            final_url,
            file_name,
            size,
            accepts_ranges,
        })
    }

    /// Concurrent multi-segment path: a limiter-gated fetch pool fills
    /// segment buffers while a single writer drains them in index order.
    async fn run_segmented(
        &self,
        url: Url,
        segments: Vec<Segment>,
        file: File,
        cancel: CancellationToken,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<(), TransferError> {
        debug!(
            "planned {} segments of at most {}",
            segments.len(),
            format_bytes(self.config.chunk_size)
        );

        let mut slots = Vec::with_capacity(segments.len());
        let mut handles = Vec::with_capacity(segments.len());
        for seg in segments {
            let (slot, handle) = segment::split(seg);
            slots.push(slot);
            handles.push(handle);
        }

        let ctx = FetchContext {
            client: self.client.clone(),
            url,
            limiter: Arc::new(Semaphore::new(self.config.thread_num.max(1))),
            cancel: cancel.clone(),
            max_attempts: self.config.max_attempts.max(1),
            progress: progress.clone(),
        };

        let mut pool: JoinSet<FetchOutcome> = JoinSet::new();
        for slot in slots {
            pool.spawn(fetch::run(ctx.clone(), slot));
        }

        let mut writer_task = tokio::spawn(writer::drain(handles, file, cancel.clone(), progress));

        // The writer result is the authoritative first cause; the pool is
        // only watched for panics. A writer error cancels the remaining
        // fetch work immediately, then both sides are drained so nothing
        // outlives the attempt.
        let mut pool_done = false;
        let mut panic_err: Option<TransferError> = None;
        let mut writer_result: Option<Result<(), TransferError>> = None;
        loop {
            tokio::select! {
                joined = pool.join_next(), if !pool_done => {
                    match joined {
                        None => pool_done = true,
                        Some(Ok(FetchOutcome::Completed(index))) => {
                            debug!("segment {index} worker done");
                        }
                        Some(Ok(FetchOutcome::Failed(index))) => {
                            debug!("segment {index} worker gave up");
                        }
                        Some(Ok(FetchOutcome::Cancelled)) => {}
                        Some(Err(err)) => {
                            cancel.cancel();
                            if panic_err.is_none() {
                                panic_err = Some(TransferError::WorkerPanic(err.to_string()));
                            }
                        }
                    }
                }
                joined = &mut writer_task, if writer_result.is_none() => {
                    let result = match joined {
                        Ok(result) => result,
                        Err(err) => Err(TransferError::WorkerPanic(err.to_string())),
                    };
                    if result.is_err() {
                        cancel.cancel();
                    }
                    writer_result = Some(result);
                }
                else => break,
            }
        }

        let writer_result =
            writer_result.unwrap_or_else(|| Err(TransferError::WorkerPanic("writer lost".into())));
        match (writer_result, panic_err) {
            (Ok(()), None) => Ok(()),
            (Ok(()), Some(err)) => Err(err),
            // A panic was the first cause; the writer only saw its fallout.
            (Err(TransferError::Cancelled), Some(err)) => Err(err),
            (Err(err), _) => Err(err),
        }
    }

    /// Fallback path: one unranged GET copied straight to the file. No
    /// per-chunk retry; any failure aborts the attempt.
    async fn run_single_stream(
        &self,
        url: Url,
        mut file: File,
        cancel: CancellationToken,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<(), TransferError> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            response = self.client.get(url).send() => {
                response.map_err(TransferError::Http)?
            }
        };
        if !response.status().is_success() {
            return Err(TransferError::Status(response.status()));
        }

        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    file.write_all(&chunk).await.map_err(TransferError::Write)?;
                    progress.bytes_written(chunk.len() as u64);
                }
                Some(Err(err)) => return Err(TransferError::Http(err)),
                None => break,
            }
        }
        file.flush().await.map_err(TransferError::Write)?;
        file.sync_all().await.map_err(TransferError::Write)?;
        Ok(())
    }
}

/// Closes out an attempt's file: deletes it when its on-disk size differs
/// from the expected size (skipped when the size was unknown), otherwise
/// returns the path as the result.
async fn cleanup(path: &Path, expected: Option<u64>) -> Option<PathBuf> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(err) => {
            debug!("failed to stat {path:?} during cleanup: {err}");
            return None;
        }
    };
    if let Some(expected) = expected {
        if meta.len() != expected {
            debug!(
                "removing incomplete file {path:?} ({} of {} bytes)",
                meta.len(),
                expected
            );
            if let Err(err) = tokio::fs::remove_file(path).await {
                warn!("failed to remove incomplete file {path:?}: {err}");
            }
            return None;
        }
    }
    Some(path.to_path_buf())
}

/// Maps the OS interrupt onto the current attempt's token. Aborted on drop
/// so a finished attempt stops listening and the next one starts fresh.
struct InterruptGuard {
    handle: JoinHandle<()>,
}

impl InterruptGuard {
    fn install(cancel: CancellationToken) -> Self {
        let handle = tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        warn!("interrupt received, stopping");
                        cancel.cancel();
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
        Self { handle }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn confirm_retry() -> Result<bool> {
    let input = tokio::task::spawn_blocking(|| {
        use std::io::Write;
        print!("{} ", "Retry? (y/n):".bold());
        let _ = std::io::stdout().flush();
        let mut input = String::new();
        std::io::stdin().read_line(&mut input).map(|_| input)
    })
    .await
    .context("retry prompt task failed")?
    .context("failed to read retry answer")?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn parse_content_disposition(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename=") {
            let trimmed = rest.trim_matches('"');
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}
