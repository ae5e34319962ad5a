use clap::Parser;
use stage_orchestrator::retry::RetryConfig;
use stage_orchestrator::server::{init_logging, periodic_logging, startup};
use stage_orchestrator::stage_client::StageMode;
use stage_orchestrator::state::{
    AppState, DEFAULT_MAX_UPLOAD_BYTES, OrchestratorConfig, StageConfig,
};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "stage-orchestrator")]
#[command(about = "Streaming pipeline orchestrator for the room design and tour services")]
#[command(long_about = r#"
Streaming pipeline orchestrator for the room design and tour services

Examples:
  # Design pipeline against streaming analysis and generation services
  stage-orchestrator --analysis-url http://127.0.0.1:8009 --analysis-mode streaming \
    --generation-url http://127.0.0.1:8005 --generation-mode streaming

  # Tour pipeline with a custom ffmpeg and opt-in retries
  stage-orchestrator --ffmpeg-path /usr/local/bin/ffmpeg --max-retries 2
"#)]
struct CliArgs {
    /// Host address to bind the server
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port number to bind the server
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Log level
    #[arg(long, default_value = "info", value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: String,

    /// Interval in seconds between pipeline stats log lines
    #[arg(long, default_value_t = 60)]
    log_interval: u64,

    /// Base URL of the room analysis service
    #[arg(long, default_value = "http://localhost:8009")]
    analysis_url: String,

    /// Path of the analysis endpoint (defaults per mode)
    #[arg(long)]
    analysis_path: Option<String>,

    #[arg(long, value_enum, default_value_t = StageMode::Buffered)]
    analysis_mode: StageMode,

    /// Timeout in seconds for the analysis stage
    #[arg(long, default_value_t = 300)]
    analysis_timeout: u64,

    /// Base URL of the image generation service
    #[arg(long, default_value = "http://localhost:8005")]
    generation_url: String,

    #[arg(long)]
    generation_path: Option<String>,

    #[arg(long, value_enum, default_value_t = StageMode::Buffered)]
    generation_mode: StageMode,

    #[arg(long, default_value_t = 300)]
    generation_timeout: u64,

    /// Base URL of the narration service
    #[arg(long, default_value = "http://localhost:8006")]
    narration_url: String,

    #[arg(long)]
    narration_path: Option<String>,

    #[arg(long, value_enum, default_value_t = StageMode::Buffered)]
    narration_mode: StageMode,

    #[arg(long, default_value_t = 300)]
    narration_timeout: u64,

    /// Base URL of the video generation service
    #[arg(long, default_value = "http://localhost:8007")]
    video_url: String,

    #[arg(long)]
    video_path: Option<String>,

    #[arg(long, value_enum, default_value_t = StageMode::Buffered)]
    video_mode: StageMode,

    #[arg(long, default_value_t = 600)]
    video_timeout: u64,

    /// ffmpeg binary used to mux narration and video
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg_path: String,

    /// ffprobe binary used to measure the narration length
    #[arg(long, default_value = "ffprobe")]
    ffprobe_path: String,

    /// Timeout in seconds for the mux command
    #[arg(long, default_value_t = 600)]
    mux_timeout: u64,

    /// Timeout in seconds for connecting to a stage service
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Minimum milliseconds between forwarded progress events of one stage
    #[arg(long, default_value_t = 0)]
    progress_interval_ms: u64,

    /// Retries per stage call; 0 disables retrying
    #[arg(long, default_value_t = 0)]
    max_retries: u32,

    #[arg(long, default_value_t = 500)]
    initial_backoff_ms: u64,

    #[arg(long, default_value_t = 5000)]
    max_backoff_ms: u64,

    #[arg(long, default_value_t = 2.0)]
    backoff_multiplier: f32,

    #[arg(long, default_value_t = 0.1)]
    jitter_factor: f32,

    /// Largest accepted image in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    max_upload_bytes: usize,
}

fn stage_config(
    url: &str,
    path: &Option<String>,
    mode: StageMode,
    timeout: u64,
    buffered_path: &str,
) -> StageConfig {
    let path = path.clone().unwrap_or_else(|| match mode {
        StageMode::Buffered => buffered_path.to_string(),
        StageMode::Streaming => format!("{}/stream", buffered_path),
    });
    StageConfig {
        url: url.to_string(),
        path,
        mode,
        timeout,
    }
}

impl CliArgs {
    fn to_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            host: self.host.clone(),
            port: self.port,
            log_level: self.log_level.clone(),
            log_interval: self.log_interval,
            analysis: stage_config(
                &self.analysis_url,
                &self.analysis_path,
                self.analysis_mode,
                self.analysis_timeout,
                "/analyze",
            ),
            generation: stage_config(
                &self.generation_url,
                &self.generation_path,
                self.generation_mode,
                self.generation_timeout,
                "/process-image",
            ),
            narration: stage_config(
                &self.narration_url,
                &self.narration_path,
                self.narration_mode,
                self.narration_timeout,
                "/narrate",
            ),
            video: stage_config(
                &self.video_url,
                &self.video_path,
                self.video_mode,
                self.video_timeout,
                "/generate",
            ),
            ffmpeg_path: self.ffmpeg_path.clone(),
            ffprobe_path: self.ffprobe_path.clone(),
            mux_timeout: self.mux_timeout,
            connect_timeout: self.connect_timeout,
            progress_interval_ms: self.progress_interval_ms,
            retry: RetryConfig {
                max_retries: self.max_retries,
                initial_backoff_ms: self.initial_backoff_ms,
                max_backoff_ms: self.max_backoff_ms,
                backoff_multiplier: self.backoff_multiplier,
                jitter_factor: self.jitter_factor,
            },
            max_upload_bytes: self.max_upload_bytes,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli_args = CliArgs::parse();
    let config = cli_args.to_config();
    init_logging(&config.log_level);

    let app_state = AppState::new(config.clone())?;
    log::info!(
        "Stages: analysis={} generation={} narration={} video={}",
        config.analysis.url,
        config.generation.url,
        config.narration.url,
        config.video.url
    );

    actix_web::rt::System::new().block_on(async move {
        tokio::select! {
            _ = periodic_logging(app_state.clone()) => Ok(()),
            res = startup(config, app_state) => res.map_err(anyhow::Error::from),
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down");
                Ok(())
            }
        }
    })
}
