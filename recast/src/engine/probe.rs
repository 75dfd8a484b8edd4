//! ffprobe-backed metadata prober.

use std::path::Path;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::media::{MediaMetadata, MediaProber};

pub struct FfprobeProber {
    binary_path: String,
}

impl FfprobeProber {
    pub fn new() -> Self {
        Self::with_binary("ffprobe")
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
        }
    }
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaProber for FfprobeProber {
    fn probe(&self, path: &Path) -> Result<MediaMetadata> {
        let output = process_utils::std_command(&self.binary_path)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .map_err(|e| Error::validation(format!("ffprobe failed to run: {e}")))?;

        if !output.status.success() {
            let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::validation(format!("unreadable media: {detail}")));
        }

        parse_ffprobe_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse ffprobe JSON output into metadata, enforcing the validation criteria:
/// a positive duration and at least one video stream.
fn parse_ffprobe_output(raw: &str) -> Result<MediaMetadata> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| Error::validation(format!("malformed ffprobe output: {e}")))?;

    let duration_secs = value
        .get("format")
        .and_then(|f| f.get("duration"))
        .and_then(Value::as_str)
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| Error::validation("missing duration"))?;
    if duration_secs <= 0.0 {
        return Err(Error::validation("zero-length media"));
    }

    let video = value
        .get("streams")
        .and_then(Value::as_array)
        .and_then(|streams| {
            streams
                .iter()
                .find(|s| s.get("codec_type").and_then(Value::as_str) == Some("video"))
        })
        .ok_or_else(|| Error::validation("no video stream"))?;

    let width = video.get("width").and_then(Value::as_u64).unwrap_or(0) as u32;
    let height = video.get("height").and_then(Value::as_u64).unwrap_or(0) as u32;

    Ok(MediaMetadata {
        duration_secs,
        width,
        height,
    })
}
