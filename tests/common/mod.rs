// These modules are used by several test binaries
#![allow(dead_code)]

pub mod mock_stage;

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use serde_json::{Value, json};
use stage_orchestrator::emitter::{ProgressSink, render_frames};
use stage_orchestrator::error::StageError;
use stage_orchestrator::io_struct::{NormalizedProgress, PipelineKind, PipelineRequest, Style};
use stage_orchestrator::muxer::{MuxJob, Muxer};
use stage_orchestrator::pipeline::{Orchestrator, StageEndpoints};
use stage_orchestrator::sse::encode_event;
use stage_orchestrator::stage_client::{
    BufferedResponse, StageCall, StageEndpoint, StageId, StageMode, StageResponse, StageTransport,
};

pub const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

/// Scripted answer of the in-memory transport.
#[derive(Clone)]
pub enum Reply {
    Buffered(BufferedResponse),
    /// Frames delivered as-is, then end of stream.
    Sse(Vec<Bytes>),
    /// Frames delivered, then the stream stays open forever.
    SseHang(Vec<Bytes>),
    Fail(StageError),
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Stage transport that answers from per-stage scripts. The last reply of a
/// script repeats.
#[derive(Default)]
pub struct FakeTransport {
    replies: Mutex<HashMap<StageId, VecDeque<Reply>>>,
    delays: Mutex<HashMap<StageId, Duration>>,
    calls: Mutex<Vec<StageCall>>,
    streams_dropped: Arc<AtomicUsize>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, stage: StageId, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .push_back(reply);
        self
    }

    pub fn delay(self, stage: StageId, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(stage, delay);
        self
    }

    pub fn calls(&self, stage: StageId) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.stage == stage)
            .count()
    }

    pub fn recorded(&self, stage: StageId) -> Vec<StageCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.stage == stage)
            .cloned()
            .collect()
    }

    pub fn streams_dropped(&self) -> usize {
        self.streams_dropped.load(Ordering::SeqCst)
    }

    fn next_reply(&self, stage: StageId) -> Reply {
        let mut replies = self.replies.lock().unwrap();
        let script = replies
            .get_mut(&stage)
            .unwrap_or_else(|| panic!("no reply scripted for {} stage", stage));
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap()
        }
    }
}

#[async_trait]
impl StageTransport for FakeTransport {
    async fn call(&self, call: StageCall) -> Result<StageResponse, StageError> {
        let stage = call.stage;
        self.calls.lock().unwrap().push(call);
        let delay = self.delays.lock().unwrap().get(&stage).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_reply(stage) {
            Reply::Buffered(resp) => Ok(StageResponse::Buffered(resp)),
            Reply::Fail(err) => Err(err),
            Reply::Sse(frames) => {
                let guard = DropCounter(self.streams_dropped.clone());
                let frames = stream::iter(frames).map(move |f| {
                    let _ = &guard;
                    Ok(f)
                });
                Ok(StageResponse::Streaming(Box::pin(frames)))
            }
            Reply::SseHang(frames) => {
                let guard = DropCounter(self.streams_dropped.clone());
                let frames = stream::iter(frames)
                    .chain(stream::pending())
                    .map(move |f| {
                        let _ = &guard;
                        Ok(f)
                    });
                Ok(StageResponse::Streaming(Box::pin(frames)))
            }
        }
    }
}

/// Writes the concatenated inputs as the muxed output.
#[derive(Default)]
pub struct FakeMuxer {
    pub jobs: Mutex<Vec<MuxJob>>,
    pub fail_with: Option<StageError>,
}

#[async_trait]
impl Muxer for FakeMuxer {
    async fn mux(&self, job: &MuxJob) -> Result<(), StageError> {
        self.jobs.lock().unwrap().push(job.clone());
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        let mut out = tokio::fs::read(&job.video).await.unwrap();
        out.extend(tokio::fs::read(&job.audio).await.unwrap());
        tokio::fs::write(&job.output, out).await.unwrap();
        Ok(())
    }
}

impl FakeMuxer {
    pub fn workspaces(&self) -> Vec<PathBuf> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter_map(|j| j.output.parent().map(PathBuf::from))
            .collect()
    }
}

/// Sink that keeps every rendered frame, optionally going away after `limit`
/// records.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<Value>>,
    accepted: AtomicUsize,
    limit: Option<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn closing_after(limit: usize) -> Self {
        RecordingSink {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn frames(&self) -> Vec<Value> {
        self.frames.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.frames()
            .iter()
            .map(|f| f["status"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn errors(&self) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f["status"] == "error")
            .collect()
    }
}

#[async_trait]
impl ProgressSink for RecordingSink {
    fn emit(&self, progress: &NormalizedProgress) -> bool {
        if self.is_closed() {
            return false;
        }
        self.accepted.fetch_add(1, Ordering::SeqCst);
        self.frames
            .lock()
            .unwrap()
            .extend(render_frames(progress, "req_test"));
        true
    }

    fn is_closed(&self) -> bool {
        self.limit
            .is_some_and(|limit| self.accepted.load(Ordering::SeqCst) >= limit)
    }
}

pub fn endpoint(stage: StageId, mode: StageMode, timeout: Duration) -> StageEndpoint {
    StageEndpoint {
        stage,
        url: format!("http://{}.test", stage),
        path: "/".to_string(),
        mode,
        timeout,
    }
}

pub fn endpoints(mode: StageMode, timeout: Duration) -> StageEndpoints {
    StageEndpoints {
        analysis: endpoint(StageId::Analysis, mode, timeout),
        generation: endpoint(StageId::Generation, mode, timeout),
        narration: endpoint(StageId::Narration, mode, timeout),
        video: endpoint(StageId::Video, mode, timeout),
    }
}

pub fn orchestrator(transport: Arc<FakeTransport>, muxer: Arc<FakeMuxer>) -> Orchestrator {
    Orchestrator::new(
        transport,
        muxer,
        endpoints(StageMode::Streaming, Duration::from_secs(5)),
    )
}

pub fn request(kind: PipelineKind) -> PipelineRequest {
    PipelineRequest {
        request_id: "req_test".to_string(),
        kind,
        image: Bytes::from_static(PNG),
        image_mime: "image/png".to_string(),
        filename: "room.png".to_string(),
        preferences: "budget 500 scandinavian style".to_string(),
        style: Style::Scandinavian,
        custom_prompt: "Incorporate these products naturally into this room scene".to_string(),
    }
}

pub fn analysis_result(products: Value) -> Value {
    json!({
        "success": true,
        "room_analysis": {"room_type": "living room", "current_style": "minimal"},
        "design_critique": {"overall_assessment": "bare walls"},
        "user_preferences": {"budget_amount": 500.0, "budget_currency": "USD"},
        "product_recommendations": products,
    })
}

pub fn two_products() -> Value {
    json!([
        {
            "title": "Oak side table",
            "thumbnail": "https://img.test/table.jpg",
            "price_value": 89.0,
            "category": "furniture",
        },
        {
            "title": "Wool throw",
            "thumbnail": "https://img.test/throw.jpg",
            "price_value": 35.5,
            "category": "textiles",
        },
    ])
}

/// SSE wire bytes of `messages`, one frame per message.
pub fn sse_frames(messages: &[Value]) -> Vec<Bytes> {
    messages.iter().map(encode_event).collect()
}

/// Same bytes re-cut into `size`-byte frames.
pub fn rechunk(frames: &[Bytes], size: usize) -> Vec<Bytes> {
    let wire: Vec<u8> = frames.iter().flat_map(|f| f.to_vec()).collect();
    wire.chunks(size).map(Bytes::copy_from_slice).collect()
}

pub fn generation_stream(image_data: &str) -> Vec<Bytes> {
    sse_frames(&[
        json!({"status": "processing", "message": "Downloading product images"}),
        json!({"status": "generating", "message": "Generating room visualization", "progress": 60}),
        json!({"status": "completed", "message": "Image generated", "width": 1024, "height": 768}),
        json!({"status": "image_data", "data": image_data, "mime_type": "image/png"}),
    ])
}
