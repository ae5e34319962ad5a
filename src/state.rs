use std::{sync::Arc, time::Duration};

use actix_web::{HttpResponse, http::header::CACHE_CONTROL};
use anyhow::Context;

use crate::emitter::{JsonEmitter, SseEmitter};
use crate::error::PipelineError;
use crate::io_struct::{PipelineKind, PipelineReqInput};
use crate::muxer::FfmpegMuxer;
use crate::pipeline::{Orchestrator, StageEndpoints};
use crate::retry::RetryConfig;
use crate::stage_client::{HttpStageClient, StageEndpoint, StageId, StageMode};
use crate::stats::DecodeStats;

/// 16 MiB, the upload cap of the upstream services.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct StageConfig {
    pub url: String,
    pub path: String,
    pub mode: StageMode,
    /// Seconds.
    pub timeout: u64,
}

impl StageConfig {
    pub fn endpoint(&self, stage: StageId) -> anyhow::Result<StageEndpoint> {
        let parsed = reqwest::Url::parse(&self.url)
            .with_context(|| format!("Invalid {} stage url: {}", stage, self.url))?;
        anyhow::ensure!(
            matches!(parsed.scheme(), "http" | "https"),
            "{} stage url must be http or https: {}",
            stage,
            self.url
        );
        anyhow::ensure!(self.timeout > 0, "{} stage timeout must be positive", stage);
        Ok(StageEndpoint {
            stage,
            url: self.url.clone(),
            path: self.path.clone(),
            mode: self.mode,
            timeout: Duration::from_secs(self.timeout),
        })
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_interval: u64,
    pub analysis: StageConfig,
    pub generation: StageConfig,
    pub narration: StageConfig,
    pub video: StageConfig,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub mux_timeout: u64,
    pub connect_timeout: u64,
    pub progress_interval_ms: u64,
    pub retry: RetryConfig,
    pub max_upload_bytes: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub stats: Arc<DecodeStats>,
    pub max_upload_bytes: usize,
    pub log_interval: u64,
}

impl AppState {
    pub fn new(config: OrchestratorConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(config.mux_timeout > 0, "mux timeout must be positive");
        anyhow::ensure!(config.max_upload_bytes > 0, "max upload size must be positive");
        anyhow::ensure!(
            config.retry.backoff_multiplier >= 1.0,
            "retry backoff multiplier must be at least 1.0"
        );

        let endpoints = StageEndpoints {
            analysis: config.analysis.endpoint(StageId::Analysis)?,
            generation: config.generation.endpoint(StageId::Generation)?,
            narration: config.narration.endpoint(StageId::Narration)?,
            video: config.video.endpoint(StageId::Video)?,
        };
        // per-stage timeouts are applied on each request
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .build()?;
        let muxer = FfmpegMuxer::new(&config.ffmpeg_path, Duration::from_secs(config.mux_timeout))
            .with_ffprobe(&config.ffprobe_path);

        let orchestrator = Orchestrator::new(
            Arc::new(HttpStageClient::new(client)),
            Arc::new(muxer),
            endpoints,
        )
        .with_retry(config.retry)
        .with_progress_interval(Duration::from_millis(config.progress_interval_ms));

        Ok(Self::with_orchestrator(
            orchestrator,
            config.max_upload_bytes,
            config.log_interval,
        ))
    }

    pub fn with_orchestrator(
        orchestrator: Orchestrator,
        max_upload_bytes: usize,
        log_interval: u64,
    ) -> Self {
        let stats = orchestrator.stats().clone();
        AppState {
            orchestrator: Arc::new(orchestrator),
            stats,
            max_upload_bytes,
            log_interval,
        }
    }

    /// Run to completion and answer with one JSON document.
    pub async fn run_buffered(
        &self,
        kind: PipelineKind,
        input: PipelineReqInput,
    ) -> Result<HttpResponse, PipelineError> {
        let request = input.into_request(kind, self.max_upload_bytes)?;
        let emitter = JsonEmitter::new(&request.request_id);
        self.orchestrator.run(&request, &emitter).await?;
        let document = emitter.into_document().ok_or_else(|| {
            PipelineError::Aggregation("run finished without a terminal record".to_string())
        })?;
        Ok(HttpResponse::Ok().json(document))
    }

    /// Validate, then answer with an event stream fed by a background run.
    /// Failures after this point travel in-band.
    pub fn run_streaming(
        &self,
        kind: PipelineKind,
        input: PipelineReqInput,
    ) -> Result<HttpResponse, PipelineError> {
        let request = input.into_request(kind, self.max_upload_bytes)?;
        let (emitter, rx) = SseEmitter::channel(&request.request_id);
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            // the outcome has already been written to the stream
            let _ = orchestrator.run(&request, &emitter).await;
        });
        Ok(HttpResponse::Ok()
            .content_type("text/event-stream")
            .insert_header((CACHE_CONTROL, "no-cache"))
            .streaming(rx))
    }
}
