use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use reqwest::Url;

const DEFAULT_FILENAME: &str = "download.bin";

/// Last non-empty path segment of `url`, or `download.bin`.
pub fn file_name_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| {
            segments
                .filter(|s| !s.is_empty())
                .last()
                .map(|s| s.to_string())
        })
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string())
}

/// First path not already present on disk: the path itself, else
/// `name(1).ext`, `name(2).ext`, and so on.
pub fn unique_file_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_string);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(DEFAULT_FILENAME)
        .to_string();

    let mut n = 1u32;
    loop {
        let name = match &ext {
            Some(ext) => format!("{stem}({n}).{ext}"),
            None => format!("{stem}({n})"),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// OSC 8 terminal hyperlink for a local file path. `file://` URIs need an
/// absolute path, so relative paths are resolved first.
pub fn hyperlink(path: &Path) -> String {
    let target = path.canonicalize().unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|dir| dir.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    });
    let display = target.display();
    format!("\x1b]8;;file://{display}\x1b\\{display}\x1b]8;;\x1b\\")
}

pub fn format_bytes(value: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut val = value as f64;
    let mut unit = 0usize;
    while val >= 1024.0 && unit < UNITS.len() - 1 {
        val /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", value, UNITS[unit])
    } else {
        format!("{val:.2} {}", UNITS[unit])
    }
}

/// Parses a human byte size such as `4096`, `512K`, `16MiB` or `1.5G`.
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let normalized = input.trim();
    if normalized.is_empty() {
        return Err(anyhow!("byte size cannot be empty"));
    }

    let mut number_part = String::new();
    let mut suffix_part = String::new();
    for ch in normalized.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            number_part.push(ch);
        } else {
            suffix_part.push(ch);
        }
    }

    let value: f64 = number_part
        .parse()
        .map_err(|_| anyhow!("invalid numeric value in byte size: {normalized}"))?;

    let multiplier = match suffix_part.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kb" => 1_000.0,
        "ki" | "kib" => 1024.0,
        "m" | "mb" => 1_000_000.0,
        "mi" | "mib" => 1_048_576.0,
        "g" | "gb" => 1_000_000_000.0,
        "gi" | "gib" => 1_073_741_824.0,
        other => return Err(anyhow!("unsupported byte-size suffix: {other}")),
    };

    let bytes = (value * multiplier).round();
    if bytes <= 0.0 {
        return Err(anyhow!("byte size must be positive"));
    }
    Ok(bytes as u64)
}

/// Makes sure `path` exists and is a directory.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path).with_context(|| format!("failed to create directory {path:?}"))?;
    } else if !path.is_dir() {
        return Err(anyhow!("{path:?} exists and is not a directory"));
    }
    Ok(())
}
