//! FFmpeg-backed transcoding engine.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CommandSpec, EngineError, TranscodeEngine};
use crate::events::ProgressReporter;

/// Grace period for reaping a killed ffmpeg process.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Trailing stderr lines kept for error reporting.
const STDERR_TAIL: usize = 8;

pub struct FfmpegEngine {
    binary_path: String,
    version: Option<String>,
}

impl FfmpegEngine {
    pub fn new() -> Self {
        Self::with_binary("ffmpeg")
    }

    /// Create with a custom binary path.
    pub fn with_binary(path: impl Into<String>) -> Self {
        let binary_path = path.into();
        let version = Self::detect_version(&binary_path);
        Self {
            binary_path,
            version,
        }
    }

    /// Detect ffmpeg version.
    fn detect_version(path: &str) -> Option<String> {
        process_utils::std_command(path)
            .arg("-version")
            .output()
            .ok()
            .and_then(|output| {
                String::from_utf8(output.stdout)
                    .ok()
                    .and_then(|s| s.lines().next().map(|l| l.to_string()))
            })
    }

    /// Build the full ffmpeg argument list for one spec.
    fn build_args(spec: &CommandSpec) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-i".to_string(),
            spec.input.to_string_lossy().to_string(),
        ];
        args.extend(spec.args.iter().cloned());
        args.push(spec.output.to_string_lossy().to_string());
        args
    }

    /// Parse the `time=HH:MM:SS.ms` field from an ffmpeg progress line.
    fn parse_out_time(line: &str) -> Option<f64> {
        let time_start = line.find("time=")?;
        let time_str = line[time_start + 5..].trim_start();
        let time_part = match time_str.find(' ') {
            Some(end) => &time_str[..end],
            None => time_str,
        };
        Self::parse_time(time_part)
    }

    /// Parse time string (HH:MM:SS.ms) to seconds.
    fn parse_time(time_str: &str) -> Option<f64> {
        let parts: Vec<&str> = time_str.split(':').collect();
        if parts.len() != 3 {
            return None;
        }

        let hours: f64 = parts[0].parse().ok()?;
        let minutes: f64 = parts[1].parse().ok()?;
        let seconds: f64 = parts[2].parse().ok()?;

        Some(hours * 3600.0 + minutes * 60.0 + seconds)
    }
}

impl Default for FfmpegEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    async fn invoke(
        &self,
        spec: &CommandSpec,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<PathBuf, EngineError> {
        if !self.is_available() {
            return Err(EngineError::Unavailable(self.binary_path.clone()));
        }

        let args = Self::build_args(spec);
        debug!(input = %spec.input.display(), output = %spec.output.display(), "starting ffmpeg");

        let mut cmd = process_utils::tokio_command(&self.binary_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // The retry layer's watchdog drops this future on deadline;
            // kill-on-drop guarantees the process dies with it.
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| EngineError::Spawn(e.to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Spawn("stderr not captured".to_string()))?;
        let mut lines = BufReader::new(stderr).lines();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(input = %spec.input.display(), "terminating ffmpeg invocation");
                    let _ = process_utils::kill_and_wait(&mut child, KILL_GRACE).await;
                    return Err(EngineError::Cancelled);
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(secs) = Self::parse_out_time(&line)
                                && let Some(total) = spec.duration_hint.filter(|d| *d > 0.0)
                            {
                                progress.report((secs / total).min(1.0) as f32);
                            }
                            if tail.len() == STDERR_TAIL {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("error reading ffmpeg stderr: {e}");
                            break;
                        }
                    }
                }
            }
        }

        let status = child.wait().await.map_err(|e| EngineError::Failed {
            code: None,
            detail: e.to_string(),
        })?;
        if status.success() {
            progress.report(1.0);
            Ok(spec.output.clone())
        } else {
            Err(EngineError::Failed {
                code: status.code(),
                detail: tail.into_iter().collect::<Vec<_>>().join("; "),
            })
        }
    }

    fn is_available(&self) -> bool {
        self.version.is_some()
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> CommandSpec {
        CommandSpec {
            input: PathBuf::from("/in/clip.mkv"),
            output: PathBuf::from("/out/clip.mp4"),
            args: vec!["-c:v".into(), "libx264".into()],
            duration_hint: Some(20.0),
        }
    }

    #[test]
    fn build_args_keeps_spec_args_between_input_and_output() {
        let args = FfmpegEngine::build_args(&spec());
        let input_pos = args.iter().position(|a| a == "/in/clip.mkv").unwrap();
        let codec_pos = args.iter().position(|a| a == "libx264").unwrap();
        assert!(input_pos < codec_pos);
        assert_eq!(args.last().unwrap(), "/out/clip.mp4");
        assert_eq!(args[0], "-y");
    }

    #[test]
    fn parse_time_handles_valid_and_invalid() {
        assert_eq!(FfmpegEngine::parse_time("00:00:10.50"), Some(10.5));
        assert_eq!(FfmpegEngine::parse_time("01:30:00.00"), Some(5400.0));
        assert_eq!(FfmpegEngine::parse_time("invalid"), None);
        assert_eq!(FfmpegEngine::parse_time("10.5"), None);
    }

    #[test]
    fn parse_out_time_from_progress_line() {
        let line = "frame=  100 fps=25 q=-1.0 size=     512kB time=00:00:04.00 bitrate=1048.6kbits/s speed=1.00x";
        assert_eq!(FfmpegEngine::parse_out_time(line), Some(4.0));
        assert_eq!(FfmpegEngine::parse_out_time("frame=  100 fps=25"), None);
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let engine = FfmpegEngine::with_binary("definitely-not-ffmpeg-zzz");
        assert!(!engine.is_available());
        assert!(engine.version().is_none());
    }
}
