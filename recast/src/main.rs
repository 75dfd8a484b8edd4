use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use recast::config::AppConfig;
use recast::engine::{CommandSpec, FfmpegEngine, FfprobeProber, TranscodeEngine};
use recast::events::{EventBus, PipelineEvent};
use recast::media::{self, MediaItem};
use recast::monitor::{ResourceMonitor, SysinfoProbe};
use recast::orchestrator::{
    ActiveTaskRegistry, AdmissionGate, CommandPlanner, PipelineConfig, PipelineController,
    PipelineOutcome, StageExecutor, StageSpec,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recast=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    tokio::fs::create_dir_all(&config.output_dir).await?;

    let engine = Arc::new(FfmpegEngine::with_binary(&config.ffmpeg_binary));
    if !engine.is_available() {
        anyhow::bail!("ffmpeg not found at '{}'", config.ffmpeg_binary);
    }
    info!(version = ?engine.version(), "transcoding engine ready");
    let prober = Arc::new(FfprobeProber::with_binary(&config.ffprobe_binary));

    let monitor = Arc::new(ResourceMonitor::new(config.monitor.clone()));
    let registry = Arc::new(ActiveTaskRegistry::new());
    let gate = AdmissionGate::new(monitor.clone(), registry.clone(), config.admission.clone());
    monitor.start(Box::new(SysinfoProbe::new(
        &config.output_dir,
        config.monitor.cpu_sample_window(),
    )));

    let events = EventBus::new();
    spawn_console_reporter(&events);

    let items = media::scan_directory(&config.input_dir).await?;
    if items.is_empty() {
        anyhow::bail!(
            "no media files found in '{}'",
            config.input_dir.display()
        );
    }
    info!(count = items.len(), dir = %config.input_dir.display(), "scanned input directory");

    // Rough preflight: transcoding rarely grows the input set.
    let mut input_bytes = 0u64;
    for item in &items {
        if let Ok(meta) = tokio::fs::metadata(&item.path).await {
            input_bytes += meta.len();
        }
    }
    if !monitor.check_free_space(input_bytes) {
        warn!(
            required = input_bytes,
            "output volume may not have enough free space"
        );
    }

    let stages = build_stages(&config);
    let executor = StageExecutor::new(
        engine,
        gate.clone(),
        registry,
        config.retry.clone(),
        events.clone(),
    );
    let pipeline_config = PipelineConfig::new(config.output_dir.clone())
        .with_heartbeat_ms(config.heartbeat_ms)
        .with_cleanup_on_exit(config.cleanup_on_exit);
    let controller =
        PipelineController::new(stages, executor, prober, events.clone(), pipeline_config);

    let outcome = controller.run(items).await;
    monitor.stop().await;

    match outcome? {
        PipelineOutcome::Completed(items) => {
            info!(items = items.len(), "all stages completed");
            Ok(())
        }
        PipelineOutcome::Failed(reason) => anyhow::bail!("pipeline failed: {reason}"),
        PipelineOutcome::Aborted => {
            // Exit with the breach that latched the gate, not a generic message.
            if let Some(event) = gate.critical_event() {
                return Err(recast::Error::ResourceExhaustion {
                    resource: event.resource,
                    value: event.value,
                    threshold: event.threshold,
                }
                .into());
            }
            anyhow::bail!("pipeline aborted after a critical resource breach")
        }
    }
}

fn spawn_console_reporter(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(PipelineEvent::Progress { percent, state, .. }) => {
                    info!(target: "recast::progress", "{percent:5.1}% {state:?}");
                }
                Ok(PipelineEvent::StageStarted { stage, items }) => {
                    info!(target: "recast::progress", "stage '{stage}' started ({items} items)");
                }
                Ok(PipelineEvent::ItemFailed {
                    stage,
                    item,
                    attempts,
                    ..
                }) => {
                    warn!(target: "recast::progress", "'{item}' failed in '{stage}' after {attempts} attempt(s)");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn build_stages(config: &AppConfig) -> Vec<StageSpec> {
    config
        .stages
        .iter()
        .map(|settings| {
            let planner: Arc<dyn CommandPlanner> = match settings.name.as_str() {
                "thumbnail" => Arc::new(ThumbnailPlanner),
                _ => Arc::new(TranscodePlanner),
            };
            let stage = StageSpec::new(
                settings.name.clone(),
                settings.weight,
                settings.concurrency,
                planner,
            );
            // Thumbnails are auxiliary; the transcoded file stays the item's
            // path for any stage after this one.
            if settings.name == "thumbnail" {
                stage.side_output()
            } else {
                stage
            }
        })
        .collect()
}

fn file_stem(item: &MediaItem) -> String {
    item.path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| item.id.to_string())
}

/// H.264 target transcode.
struct TranscodePlanner;

impl CommandPlanner for TranscodePlanner {
    fn plan(&self, item: &MediaItem, dest_dir: &Path) -> CommandSpec {
        CommandSpec {
            input: item.path.clone(),
            output: dest_dir.join(format!("{}.mp4", file_stem(item))),
            args: [
                "-c:v",
                "libx264",
                "-preset",
                "medium",
                "-crf",
                "23",
                "-c:a",
                "aac",
                "-movflags",
                "+faststart",
            ]
            .map(String::from)
            .to_vec(),
            duration_hint: item.metadata().map(|m| m.duration_secs),
        }
    }
}

/// Representative-frame thumbnail extraction.
struct ThumbnailPlanner;

impl CommandPlanner for ThumbnailPlanner {
    fn plan(&self, item: &MediaItem, dest_dir: &Path) -> CommandSpec {
        CommandSpec {
            input: item.path.clone(),
            output: dest_dir.join(format!("{}.jpg", file_stem(item))),
            args: ["-vf", "thumbnail,scale=640:-2", "-frames:v", "1"]
                .map(String::from)
                .to_vec(),
            duration_hint: None,
        }
    }
}
