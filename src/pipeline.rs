//! Run state machine.
//!
//! One [`Orchestrator`] is shared by every request; a run owns nothing beyond
//! its request, its sink and a scratch directory. Stage order, derivation
//! between stages and the final merge all live here.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Map, Value, json};
use tokio::time::{self, Instant};

use crate::emitter::ProgressSink;
use crate::error::{PipelineError, StageError};
use crate::io_struct::{
    BinaryAttachment, NormalizedProgress, PipelineKind, PipelineRequest, PipelineResult,
    StageOutput, extension_for,
};
use crate::muxer::{MuxJob, Muxer};
use crate::retry::{BackoffCalculator, RetryConfig, is_retryable};
use crate::sse::SseDecoder;
use crate::stage_client::{
    FormPart, FrameStream, StageEndpoint, StageId, StagePayload, StageResponse, StageTransport,
};
use crate::stats::DecodeStats;
use crate::translator::{ProgressPacer, StageTracker, Step, translate_event, translate_response};

#[derive(Debug, Clone)]
pub struct StageEndpoints {
    pub analysis: StageEndpoint,
    pub generation: StageEndpoint,
    pub narration: StageEndpoint,
    pub video: StageEndpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Running(StageId),
    Done(StageId),
    Aggregating,
    Completed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Init => f.write_str("init"),
            RunState::Running(stage) => write!(f, "running({})", stage),
            RunState::Done(stage) => write!(f, "done({})", stage),
            RunState::Aggregating => f.write_str("aggregating"),
            RunState::Completed => f.write_str("completed"),
            RunState::Failed => f.write_str("failed"),
        }
    }
}

/// Per-run context handed to every step. Concurrent branches share it, so the
/// state sits behind a lock.
struct Run<'a> {
    request: &'a PipelineRequest,
    sink: &'a dyn ProgressSink,
    state: Mutex<RunState>,
}

impl<'a> Run<'a> {
    fn new(request: &'a PipelineRequest, sink: &'a dyn ProgressSink) -> Self {
        Run {
            request,
            sink,
            state: Mutex::new(RunState::Init),
        }
    }

    fn id(&self) -> &str {
        &self.request.request_id
    }

    fn transition(&self, next: RunState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        log::info!("[{}] {} -> {}", self.id(), *state, next);
        *state = next;
    }

    fn emit(&self, progress: NormalizedProgress) -> Result<(), PipelineError> {
        if self.sink.emit(&progress) {
            Ok(())
        } else {
            Err(PipelineError::ClientDisconnected)
        }
    }
}

pub struct Orchestrator {
    transport: Arc<dyn StageTransport>,
    muxer: Arc<dyn Muxer>,
    endpoints: StageEndpoints,
    retry: RetryConfig,
    progress_interval: Duration,
    stats: Arc<DecodeStats>,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<dyn StageTransport>,
        muxer: Arc<dyn Muxer>,
        endpoints: StageEndpoints,
    ) -> Self {
        Orchestrator {
            transport,
            muxer,
            endpoints,
            retry: RetryConfig::default(),
            progress_interval: Duration::ZERO,
            stats: Arc::new(DecodeStats::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_stats(mut self, stats: Arc<DecodeStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<DecodeStats> {
        &self.stats
    }

    pub fn endpoints(&self) -> &StageEndpoints {
        &self.endpoints
    }

    /// Drive one request to its terminal record. Exactly one `completed` or
    /// `error` record reaches the sink unless the client went away first.
    pub async fn run(
        &self,
        request: &PipelineRequest,
        sink: &dyn ProgressSink,
    ) -> Result<PipelineResult, PipelineError> {
        self.stats.run_started();
        let run = Run::new(request, sink);
        log::info!("[{}] Starting {} pipeline", run.id(), request.kind.as_str());

        let outcome = match run.emit(NormalizedProgress::started(run.id(), request.kind)) {
            Ok(()) => {
                let flow = async {
                    match request.kind {
                        PipelineKind::Design => self.design(&run).await,
                        PipelineKind::Tour => self.tour(&run).await,
                    }
                };
                // dropping `flow` aborts the stage calls, the mux child and the workspace
                tokio::select! {
                    outcome = flow => outcome,
                    _ = sink.closed() => Err(PipelineError::ClientDisconnected),
                }
            }
            Err(e) => Err(e),
        };

        let outcome = outcome.and_then(|result| {
            run.transition(RunState::Completed);
            run.emit(NormalizedProgress::completed(result.clone()))?;
            Ok(result)
        });

        match &outcome {
            Ok(_) => {
                self.stats.run_completed();
                log::info!("[{}] Pipeline completed", run.id());
            }
            Err(PipelineError::ClientDisconnected) => {
                self.stats.run_cancelled();
                log::warn!("[{}] Client disconnected, abandoning run", run.id());
            }
            Err(e) => {
                run.transition(RunState::Failed);
                self.stats.run_failed();
                log::error!("[{}] Pipeline failed: {}", run.id(), e);
                // the client may already be gone; nothing left to stop
                sink.emit(&NormalizedProgress::failed(e));
            }
        }
        outcome
    }

    async fn design(&self, run: &Run<'_>) -> Result<PipelineResult, PipelineError> {
        let req = run.request;
        let analysis = self
            .run_stage(
                run,
                &self.endpoints.analysis,
                StagePayload::Multipart(vec![
                    FormPart::file("image", req.image.clone(), &req.filename, &req.image_mime),
                    FormPart::text("preferences", req.preferences.clone()),
                ]),
                false,
            )
            .await?;

        let inputs = derive_generation_inputs(&analysis.data)?;
        log::info!(
            "[{}] Derived {} products for generation",
            run.id(),
            inputs.product_names.len()
        );

        let generation = self
            .run_stage(
                run,
                &self.endpoints.generation,
                StagePayload::Multipart(vec![
                    FormPart::file("file", req.image.clone(), &req.filename, &req.image_mime),
                    FormPart::text("product_names", Value::from(inputs.product_names).to_string()),
                    FormPart::text("image_urls", Value::from(inputs.image_urls).to_string()),
                    FormPart::text("style", req.style.as_str()),
                    FormPart::text("custom_prompt", req.custom_prompt.clone()),
                ]),
                true,
            )
            .await?;

        run.transition(RunState::Aggregating);
        aggregate_design(req, analysis, generation)
    }

    async fn tour(&self, run: &Run<'_>) -> Result<PipelineResult, PipelineError> {
        let req = run.request;
        let workspace = tempfile::Builder::new().prefix("tour-").tempdir()?;
        let image = || {
            StagePayload::Multipart(vec![FormPart::file(
                "image",
                req.image.clone(),
                &req.filename,
                &req.image_mime,
            )])
        };

        let (narration, video) = tokio::try_join!(
            self.run_stage(run, &self.endpoints.narration, image(), true),
            self.run_stage(run, &self.endpoints.video, image(), true),
        )?;

        let audio = media_of(StageId::Narration, &narration)?;
        let clip = media_of(StageId::Video, &video)?;
        let job = MuxJob {
            audio: workspace
                .path()
                .join(format!("narration.{}", extension_for(&audio.0))),
            video: workspace.path().join(format!("video.{}", extension_for(&clip.0))),
            output: workspace.path().join("tour.mp4"),
        };
        tokio::fs::write(&job.audio, &audio.1).await?;
        tokio::fs::write(&job.video, &clip.1).await?;

        if run.sink.is_closed() {
            return Err(PipelineError::ClientDisconnected);
        }
        run.transition(RunState::Running(StageId::Mux));
        run.emit(NormalizedProgress::progress(
            StageId::Mux,
            "Combining narration and video",
            None,
        ))?;
        self.muxer.mux(&job).await?;
        let muxed = Bytes::from(tokio::fs::read(&job.output).await?);
        run.transition(RunState::Done(StageId::Mux));
        run.emit(NormalizedProgress::stage_completed(
            StageId::Mux,
            "mux stage completed",
            Some(json!({"size": muxed.len()})),
        ))?;

        run.transition(RunState::Aggregating);
        aggregate_tour(req, narration, video, muxed)
    }

    async fn run_stage(
        &self,
        run: &Run<'_>,
        endpoint: &StageEndpoint,
        payload: StagePayload,
        expects_attachment: bool,
    ) -> Result<StageOutput, PipelineError> {
        let stage = endpoint.stage;
        if run.sink.is_closed() {
            return Err(PipelineError::ClientDisconnected);
        }
        run.transition(RunState::Running(stage));
        run.emit(NormalizedProgress::progress(
            stage,
            format!("Starting {} stage", stage),
            None,
        ))?;

        let (response, deadline) = self.establish(run, endpoint, &payload).await?;
        let consume = self.consume(run, stage, response, expects_attachment);
        let output = match time::timeout_at(deadline, consume).await {
            Ok(output) => output?,
            Err(_) => return Err(timed_out(endpoint).into()),
        };
        if expects_attachment && output.attachment.is_none() {
            return Err(StageError::incomplete(stage, "stage returned no media").into());
        }

        run.transition(RunState::Done(stage));
        run.emit(NormalizedProgress::stage_completed(
            stage,
            format!("{} stage completed", stage),
            Some(completion_details(&output)),
        ))?;
        Ok(output)
    }

    /// Get a response from the stage, retrying per policy. Nothing has been
    /// read from a response that gets retried.
    async fn establish(
        &self,
        run: &Run<'_>,
        endpoint: &StageEndpoint,
        payload: &StagePayload,
    ) -> Result<(StageResponse, Instant), StageError> {
        let mut attempt = 0;
        loop {
            let deadline = Instant::now() + endpoint.timeout;
            let call = self.transport.call(endpoint.call(payload.clone()));
            let result = match time::timeout_at(deadline, call).await {
                Ok(result) => result,
                Err(_) => Err(timed_out(endpoint)),
            };
            match result {
                Ok(response) => return Ok((response, deadline)),
                Err(e) if attempt < self.retry.max_retries && is_retryable(&e) => {
                    let delay = BackoffCalculator::calculate_delay(&self.retry, attempt);
                    attempt += 1;
                    log::warn!(
                        "[{}] {} (attempt {}/{}), retrying in {:?}",
                        run.id(),
                        e,
                        attempt,
                        self.retry.max_retries + 1,
                        delay
                    );
                    time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn consume(
        &self,
        run: &Run<'_>,
        stage: StageId,
        response: StageResponse,
        expects_attachment: bool,
    ) -> Result<StageOutput, PipelineError> {
        match response {
            StageResponse::Buffered(resp) => Ok(translate_response(stage, &resp)?),
            StageResponse::Streaming(frames) => {
                self.read_stream(run, stage, frames, expects_attachment).await
            }
        }
    }

    /// Decode and translate a stage stream until its result is complete. The
    /// stream is dropped on return, which closes the upstream connection.
    async fn read_stream(
        &self,
        run: &Run<'_>,
        stage: StageId,
        mut frames: FrameStream,
        expects_attachment: bool,
    ) -> Result<StageOutput, PipelineError> {
        let mut decoder = SseDecoder::new();
        let mut tracker = StageTracker::new(stage, expects_attachment);
        let mut pacer = ProgressPacer::new(self.progress_interval);

        let outcome = 'read: loop {
            let frame = match frames.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break Err(PipelineError::from(e)),
                None => {
                    decoder.finish();
                    break Ok(None);
                }
            };
            for event in decoder.push(&frame) {
                match tracker.feed(translate_event(stage, &event)) {
                    Step::Forward(progress) => {
                        if pacer.admit() {
                            if let Err(e) = run.emit(progress) {
                                break 'read Err(e);
                            }
                        }
                    }
                    Step::Done(output) => break 'read Ok(Some(output)),
                    Step::Failed(e) => break 'read Err(e.into()),
                    Step::Continue => {}
                }
            }
        };

        let dropped = decoder.dropped() + tracker.violations();
        if dropped > 0 {
            log::warn!("[{}] Dropped {} messages from {} stage", run.id(), dropped, stage);
            self.stats.record_dropped(stage, dropped);
        }
        match outcome {
            Ok(Some(output)) => Ok(output),
            Ok(None) => Err(tracker.finish().into()),
            Err(e) => Err(e),
        }
    }
}

fn timed_out(endpoint: &StageEndpoint) -> StageError {
    StageError::timeout(endpoint.stage, format!("no result within {:?}", endpoint.timeout))
}

fn completion_details(output: &StageOutput) -> Value {
    let mut details = match &output.data {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other.clone());
            map
        }
    };
    if let Some(attachment) = &output.attachment {
        details.insert(
            "attachment".to_string(),
            json!({
                "mime_type": attachment.mime_type,
                "encoded_size": attachment.encoded_len(),
            }),
        );
    }
    Value::Object(details)
}

fn media_of(stage: StageId, output: &StageOutput) -> Result<(String, Bytes), StageError> {
    let attachment = output
        .attachment
        .as_ref()
        .ok_or_else(|| StageError::incomplete(stage, "stage returned no media"))?;
    let bytes = attachment
        .to_bytes()
        .map_err(|e| StageError::upstream(stage, format!("media is not valid base64: {}", e)))?;
    Ok((attachment.mime_type.clone(), bytes))
}

/// Parallel name/URL lists fed to the generation stage.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationInputs {
    pub product_names: Vec<String>,
    pub image_urls: Vec<String>,
}

/// Pull `{title, thumbnail}` pairs out of the analysis result. Products whose
/// thumbnail is unusable are skipped.
pub fn derive_generation_inputs(analysis: &Value) -> Result<GenerationInputs, StageError> {
    let products = analysis
        .get("product_recommendations")
        .and_then(Value::as_array)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            StageError::no_usable_input(StageId::Generation, "No product recommendations found")
        })?;

    let mut inputs = GenerationInputs {
        product_names: Vec::new(),
        image_urls: Vec::new(),
    };
    for (i, product) in products.iter().enumerate() {
        let Some(thumbnail) = product
            .get("thumbnail")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| usable_thumbnail(t))
        else {
            continue;
        };
        let title = product
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Product {}", i + 1));
        inputs.product_names.push(title);
        inputs.image_urls.push(thumbnail.to_string());
    }

    if inputs.image_urls.is_empty() {
        return Err(StageError::no_usable_input(
            StageId::Generation,
            "No valid thumbnails in product recommendations",
        ));
    }
    Ok(inputs)
}

fn usable_thumbnail(url: &str) -> bool {
    !url.is_empty()
        && !url.eq_ignore_ascii_case("n/a")
        && (url.starts_with("http://") || url.starts_with("https://") || url.starts_with("data:"))
}

pub fn aggregate_design(
    request: &PipelineRequest,
    analysis: StageOutput,
    generation: StageOutput,
) -> Result<PipelineResult, PipelineError> {
    let Value::Object(mut fields) = analysis.data else {
        return Err(PipelineError::Aggregation(
            "analysis output is not a JSON object".to_string(),
        ));
    };
    if !fields
        .get("product_recommendations")
        .is_some_and(Value::is_array)
    {
        return Err(PipelineError::Aggregation(
            "analysis output has no product_recommendations list".to_string(),
        ));
    }
    let image = generation.attachment.ok_or_else(|| {
        PipelineError::Aggregation("generation output carries no image".to_string())
    })?;

    fields.remove("success");
    // the stage's own summary is replaced by ours
    fields.remove("summary");
    fields.insert("style".to_string(), Value::from(request.style.as_str()));
    if !generation.data.is_null() {
        fields.insert("generation".to_string(), generation.data);
    }
    let summary = design_summary(&fields);

    Ok(PipelineResult {
        request_id: request.request_id.clone(),
        kind: PipelineKind::Design,
        success: true,
        fields,
        summary,
        attachments: vec![("generated_image".to_string(), image)],
    })
}

pub fn design_summary(fields: &Map<String, Value>) -> Value {
    let room = fields.get("room_analysis");
    let prefs = fields.get("user_preferences");
    let products = fields
        .get("product_recommendations")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let text = |obj: Option<&Value>, key: &str| {
        obj.and_then(|o| o.get(key))
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string()
    };
    let budget = prefs
        .and_then(|p| p.get("budget_amount"))
        .and_then(Value::as_f64);
    let estimated_total: f64 = products
        .iter()
        .filter_map(|p| p.get("price_value").and_then(Value::as_f64))
        .sum();
    let mut categories: Vec<&str> = products
        .iter()
        .filter_map(|p| p.get("category").and_then(Value::as_str))
        .filter(|c| !c.is_empty())
        .collect();
    categories.sort_unstable();
    categories.dedup();

    json!({
        "room_type": text(room, "room_type"),
        "current_style": text(room, "current_style"),
        "budget": budget.unwrap_or(0.0),
        "budget_currency": prefs
            .and_then(|p| p.get("budget_currency"))
            .and_then(Value::as_str)
            .unwrap_or("USD"),
        "num_recommendations": products.len(),
        "estimated_total": cents(estimated_total),
        "remaining_budget": budget.map(|b| cents(b - estimated_total)),
        "categories": categories,
    })
}

fn cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

pub fn aggregate_tour(
    request: &PipelineRequest,
    narration: StageOutput,
    video: StageOutput,
    muxed: Bytes,
) -> Result<PipelineResult, PipelineError> {
    let (Some(audio), Some(clip)) = (&narration.attachment, &video.attachment) else {
        return Err(PipelineError::Aggregation(
            "tour stages returned no media".to_string(),
        ));
    };
    if muxed.is_empty() {
        return Err(PipelineError::Aggregation("muxed tour is empty".to_string()));
    }

    let summary = json!({
        "narration": {"mime_type": audio.mime_type, "encoded_size": audio.encoded_len()},
        "video": {"mime_type": clip.mime_type, "encoded_size": clip.encoded_len()},
        "tour_size": muxed.len(),
    });
    let mut fields = Map::new();
    fields.insert("narration".to_string(), narration.data);
    fields.insert("video".to_string(), video.data);

    Ok(PipelineResult {
        request_id: request.request_id.clone(),
        kind: PipelineKind::Tour,
        success: true,
        fields,
        summary,
        attachments: vec![(
            "tour_video".to_string(),
            BinaryAttachment::raw("video/mp4", muxed),
        )],
    })
}
