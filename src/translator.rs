//! Stage status translation.
//!
//! Each upstream speaks its own `{status, message, ...}` dialect. This module
//! maps those events onto [`NormalizedProgress`] and decides when a stage has
//! produced its result.

use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};

use crate::error::{DecodeError, StageError};
use crate::io_struct::{BinaryAttachment, NormalizedProgress, StageOutput};
use crate::sse::SseEvent;
use crate::stage_client::{BufferedResponse, StageId};

/// What a single upstream event means for its stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageSignal {
    Progress(NormalizedProgress),
    /// Terminal event; for split results this carries metadata only.
    Completed(Value),
    /// Payload half of a split result (`image_data`, `audio_data`, ...).
    Attachment {
        event: String,
        attachment: BinaryAttachment,
    },
    Failed(StageError),
    Ignored,
}

/// Pure mapping of one event. Translating the same event twice yields the same
/// signal.
pub fn translate_event(stage: StageId, event: &SseEvent) -> StageSignal {
    let Some(data) = event.data.as_object() else {
        return StageSignal::Ignored;
    };

    if let Some(err) = data.get("error").filter(|v| !v.is_null()) {
        return StageSignal::Failed(StageError::upstream(stage, describe(err)));
    }

    let status = event.status().unwrap_or_default();
    match status {
        "error" | "failed" => StageSignal::Failed(StageError::upstream(
            stage,
            message_of(data).unwrap_or("stage reported failure"),
        )),
        "completed" | "complete" | "done" => match refusal(stage, data) {
            Some(err) => StageSignal::Failed(err),
            None => StageSignal::Completed(without_status(data)),
        },
        s if s.ends_with("_data") => match attachment_from(stage, s, data) {
            Ok(attachment) => StageSignal::Attachment {
                event: s.to_string(),
                attachment,
            },
            Err(e) => StageSignal::Failed(e),
        },
        _ => {
            let message = message_of(data)
                .or(Some(status).filter(|s| !s.is_empty()))
                .unwrap_or("working")
                .to_string();
            let details = without_status(data);
            let details = details
                .as_object()
                .filter(|m| !m.is_empty())
                .map(|m| Value::Object(m.clone()));
            StageSignal::Progress(NormalizedProgress::progress(stage, message, details))
        }
    }
}

/// Translate a buffered (non-streaming) response into the stage result.
pub fn translate_response(
    stage: StageId,
    resp: &BufferedResponse,
) -> Result<StageOutput, StageError> {
    let looks_json = resp.is_json()
        || (resp.content_type.is_none() && resp.body.first() == Some(&b'{'));
    if looks_json {
        let value = resp.to_json(stage)?;
        if let Some(err) = value.get("error").filter(|v| !v.is_null()) {
            return Err(StageError::upstream(stage, describe(err)));
        }
        if let Some(err) = value.as_object().and_then(|data| refusal(stage, data)) {
            return Err(err);
        }
        return Ok(StageOutput::new(value));
    }

    if resp.body.is_empty() {
        return Err(StageError::incomplete(stage, "response body was empty"));
    }
    let mime_type = resp
        .content_type
        .as_deref()
        .and_then(|ct| ct.split(';').next())
        .map(str::trim)
        .unwrap_or("application/octet-stream");
    Ok(StageOutput {
        data: json!({"content_type": mime_type, "size": resp.body.len()}),
        attachment: Some(BinaryAttachment::raw(mime_type, resp.body.clone())),
    })
}

/// A result that says `success: false` is a stage failure, whether it came
/// buffered or as the terminal event of a stream.
fn refusal(stage: StageId, data: &Map<String, Value>) -> Option<StageError> {
    (data.get("success") == Some(&Value::Bool(false))).then(|| {
        StageError::upstream(stage, message_of(data).unwrap_or("stage reported failure"))
    })
}

pub enum Step {
    Forward(NormalizedProgress),
    Done(StageOutput),
    Failed(StageError),
    Continue,
}

/// Per-stage, per-run correlation of terminal events.
///
/// Stages that deliver an attachment send `completed` with metadata and then a
/// separate `<kind>_data` event; the result only exists once both arrived.
#[derive(Debug)]
pub struct StageTracker {
    stage: StageId,
    expects_attachment: bool,
    metadata: Option<Value>,
    violations: u64,
}

impl StageTracker {
    pub fn new(stage: StageId, expects_attachment: bool) -> Self {
        StageTracker {
            stage,
            expects_attachment,
            metadata: None,
            violations: 0,
        }
    }

    pub fn feed(&mut self, signal: StageSignal) -> Step {
        match signal {
            StageSignal::Progress(progress) => Step::Forward(progress),
            StageSignal::Completed(data) if !self.expects_attachment => {
                Step::Done(StageOutput::new(data))
            }
            StageSignal::Completed(data) => {
                if self.metadata.is_some() {
                    log::warn!(
                        "{} stage sent a second completed event, keeping the first",
                        self.stage
                    );
                } else {
                    self.metadata = Some(data);
                }
                Step::Continue
            }
            StageSignal::Attachment { event, attachment } => match self.metadata.take() {
                Some(data) => Step::Done(StageOutput {
                    data,
                    attachment: Some(attachment),
                }),
                None => {
                    self.violations += 1;
                    log::warn!(
                        "Ignoring {} stage message: {}",
                        self.stage,
                        DecodeError::OutOfOrder { event }
                    );
                    Step::Continue
                }
            },
            StageSignal::Failed(e) => Step::Failed(e),
            StageSignal::Ignored => Step::Continue,
        }
    }

    /// Messages ignored because they arrived out of order.
    pub fn violations(&self) -> u64 {
        self.violations
    }

    /// Called when the stream closed without a terminal step.
    pub fn finish(self) -> StageError {
        match self.metadata {
            Some(_) => StageError::incomplete(
                self.stage,
                "stream closed after completed but before the data event",
            ),
            None => StageError::incomplete(self.stage, "stream closed before a completed event"),
        }
    }
}

/// Keeps intermediate progress from flooding the client.
#[derive(Debug)]
pub struct ProgressPacer {
    min_interval: Duration,
    last: Option<Instant>,
}

impl ProgressPacer {
    pub fn new(min_interval: Duration) -> Self {
        ProgressPacer {
            min_interval,
            last: None,
        }
    }

    pub fn admit(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

fn attachment_from(
    stage: StageId,
    event: &str,
    data: &Map<String, Value>,
) -> Result<BinaryAttachment, StageError> {
    let encoded = data
        .get("data")
        .or_else(|| data.get(event))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StageError::incomplete(stage, format!("{} event carried no data", event)))?;
    let mime_type = data
        .get("mime_type")
        .or_else(|| data.get("content_type"))
        .and_then(Value::as_str)
        .unwrap_or(match event {
            "audio_data" => "audio/mpeg",
            "video_data" => "video/mp4",
            _ => "image/png",
        });
    Ok(BinaryAttachment::base64(mime_type, encoded.to_string()))
}

fn message_of(data: &Map<String, Value>) -> Option<&str> {
    data.get("message")
        .or_else(|| data.get("detail"))
        .and_then(Value::as_str)
}

fn describe(err: &Value) -> String {
    match err {
        Value::String(s) => s.clone(),
        Value::Object(map) => message_of(map)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()),
        other => other.to_string(),
    }
}

fn without_status(data: &Map<String, Value>) -> Value {
    let mut data = data.clone();
    data.remove("status");
    data.remove("type");
    data.remove("message");
    Value::Object(data)
}
