//! Outbound side of a run: turns [`NormalizedProgress`] records into SSE
//! frames or one JSON document.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::io_struct::{BinaryAttachment, NormalizedProgress, Payload, Phase, PipelineResult};
use crate::sse::encode_event;

pub type Frame = Result<Bytes, std::io::Error>;

/// Where the orchestrator reports progress. Shared by concurrent branches of a
/// run, hence `&self`.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Deliver one record. Returns false once the receiving side is gone.
    fn emit(&self, progress: &NormalizedProgress) -> bool;

    fn is_closed(&self) -> bool {
        false
    }

    /// Resolves once the receiving side is gone. Never resolves for sinks
    /// that cannot observe a disconnect.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}

/// Incremental writer: every record is framed and handed to the response body
/// as soon as it is emitted.
pub struct SseEmitter {
    tx: mpsc::UnboundedSender<Frame>,
    request_id: String,
}

impl SseEmitter {
    /// The receiving half is the response body; dropping it cancels the run.
    pub fn channel(request_id: &str) -> (SseEmitter, UnboundedReceiverStream<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SseEmitter {
                tx,
                request_id: request_id.to_string(),
            },
            UnboundedReceiverStream::new(rx),
        )
    }
}

#[async_trait]
impl ProgressSink for SseEmitter {
    fn emit(&self, progress: &NormalizedProgress) -> bool {
        render_frames(progress, &self.request_id)
            .iter()
            .all(|frame| self.tx.send(Ok(encode_event(frame))).is_ok())
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Buffer-then-return writer for the non-streaming endpoints. Only the
/// terminal record is kept.
pub struct JsonEmitter {
    request_id: String,
    terminal: Mutex<Option<Value>>,
}

impl JsonEmitter {
    pub fn new(request_id: &str) -> Self {
        JsonEmitter {
            request_id: request_id.to_string(),
            terminal: Mutex::new(None),
        }
    }

    pub fn into_document(self) -> Option<Value> {
        self.terminal
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ProgressSink for JsonEmitter {
    fn emit(&self, progress: &NormalizedProgress) -> bool {
        if progress.is_terminal() {
            let document = match &progress.payload {
                Some(Payload::Result(result)) => render_result(result, true),
                _ => render_record(progress, &self.request_id),
            };
            *self.terminal.lock().unwrap_or_else(PoisonError::into_inner) = Some(document);
        }
        true
    }
}

/// SSE frames for one record. A completed run is split into the metadata
/// record followed by one data record per attachment.
pub fn render_frames(progress: &NormalizedProgress, request_id: &str) -> Vec<Value> {
    match &progress.payload {
        Some(Payload::Result(result)) => {
            let mut frames = vec![render_result(result, false)];
            frames.extend(
                result
                    .attachments
                    .iter()
                    .map(|(name, attachment)| render_attachment_data(result, name, attachment)),
            );
            frames
        }
        _ => vec![render_record(progress, request_id)],
    }
}

pub fn render_record(progress: &NormalizedProgress, request_id: &str) -> Value {
    let mut record = Map::new();
    record.insert("status".to_string(), Value::from(progress.status()));
    record.insert("request_id".to_string(), Value::from(request_id));
    if let Some(stage) = progress.stage {
        record.insert("stage".to_string(), Value::from(stage.as_str()));
    }
    let text_key = if progress.phase == Phase::Error {
        "error"
    } else {
        "message"
    };
    record.insert(text_key.to_string(), Value::from(progress.message.as_str()));

    match &progress.payload {
        Some(Payload::Data(Value::Object(details))) => {
            for (key, value) in details {
                record.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        Some(Payload::Data(other)) => {
            record.insert("data".to_string(), other.clone());
        }
        _ => {}
    }
    Value::Object(record)
}

/// The terminal record. With `inline` the attachment bodies are embedded,
/// otherwise only their metadata is.
pub fn render_result(result: &PipelineResult, inline: bool) -> Value {
    let mut record = Map::new();
    record.insert("status".to_string(), json!("completed"));
    record.insert("success".to_string(), json!(result.success));
    record.insert("request_id".to_string(), json!(result.request_id));
    record.insert("pipeline".to_string(), json!(result.kind.as_str()));
    for (key, value) in &result.fields {
        record.entry(key.clone()).or_insert_with(|| value.clone());
    }
    record.insert("summary".to_string(), result.summary.clone());
    for (name, attachment) in &result.attachments {
        let mut meta = json!({
            "mime_type": attachment.mime_type,
            "encoded_size": attachment.encoded_len(),
        });
        if inline {
            meta["data"] = Value::from(attachment.encoded().into_owned());
        }
        record.insert(name.clone(), meta);
    }
    Value::Object(record)
}

fn render_attachment_data(
    result: &PipelineResult,
    name: &str,
    attachment: &BinaryAttachment,
) -> Value {
    let mut record = Map::new();
    record.insert(
        "status".to_string(),
        Value::from(format!("{}_data", attachment.kind())),
    );
    record.insert("request_id".to_string(), json!(result.request_id));
    record.insert(
        name.to_string(),
        json!({
            "mime_type": attachment.mime_type,
            "data": attachment.encoded(),
        }),
    );
    Value::Object(record)
}
