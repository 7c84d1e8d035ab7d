use std::convert::TryFrom;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};
use reqwest::Url;

use crate::download::{JobConfig, ProgressMode, DEFAULT_MAX_ATTEMPTS, DEFAULT_THREAD_NUM};
use crate::util::{ensure_dir, parse_byte_size};

#[derive(Parser, Debug, Clone)]
#[command(name = "rangeget", author, version, about = "Concurrent byte-range downloader", long_about = None)]
pub struct Cli {
    /// Download URL
    #[arg(value_name = "url")]
    pub url: String,

    /// Destination directory
    #[arg(short = 'd', long = "dir", value_name = "path")]
    pub dir: Option<PathBuf>,

    /// Maximum concurrent segment downloads
    #[arg(
        short = 't',
        long = "threads",
        value_name = "int",
        default_value_t = DEFAULT_THREAD_NUM
    )]
    pub threads: usize,

    /// Segment size (e.g. 4096, 512K, 16MiB)
    #[arg(long = "chunk-size", value_name = "bytes", default_value = "16MiB")]
    pub chunk_size: String,

    /// Fetch attempts per segment before giving up
    #[arg(
        long = "max-attempts",
        value_name = "int",
        default_value_t = DEFAULT_MAX_ATTEMPTS
    )]
    pub max_attempts: usize,

    /// Proxy URL
    #[arg(short = 'p', long = "proxy", value_name = "url")]
    pub proxy: Option<String>,

    /// Quiet mode
    #[arg(short = 'q', long = "quiet", action = ArgAction::SetTrue, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Verbose mode
    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Stream progress as newline-delimited JSON
    #[arg(long = "json", action = ArgAction::SetTrue)]
    pub json: bool,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

impl TryFrom<Cli> for JobConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let url = Url::parse(&cli.url).with_context(|| format!("invalid URL: {}", cli.url))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(anyhow!("unsupported URL scheme: {}", url.scheme()));
        }

        let output_dir = cli.dir.unwrap_or_else(|| PathBuf::from("."));
        ensure_dir(&output_dir)?;

        let chunk_size = parse_byte_size(&cli.chunk_size).context("invalid --chunk-size")?;

        let proxy = match cli.proxy {
            Some(proxy) => {
                Some(Url::parse(&proxy).with_context(|| format!("invalid proxy URL: {proxy}"))?)
            }
            None => None,
        };

        let progress = if cli.json {
            ProgressMode::Json
        } else if cli.quiet {
            ProgressMode::Quiet
        } else {
            ProgressMode::Text
        };

        Ok(JobConfig {
            url,
            output_dir,
            thread_num: cli.threads.max(1),
            chunk_size,
            max_attempts: cli.max_attempts.max(1),
            proxy,
            progress,
        })
    }
}
