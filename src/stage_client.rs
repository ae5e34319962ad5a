use std::{fmt, pin::Pin, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{
    StatusCode,
    header::{ACCEPT, CONTENT_TYPE},
    multipart::{Form, Part},
};
use serde::Serialize;
use serde_json::Value;

use crate::error::StageError;

/// Longest upstream error body carried into a stage error message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Analysis,
    Generation,
    Narration,
    Video,
    Mux,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Analysis => "analysis",
            StageId::Generation => "generation",
            StageId::Narration => "narration",
            StageId::Video => "video",
            StageId::Mux => "mux",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StageMode {
    Buffered,
    Streaming,
}

#[derive(Debug, Clone)]
pub enum PartValue {
    Text(String),
    File {
        bytes: Bytes,
        filename: String,
        mime_type: String,
    },
}

#[derive(Debug, Clone)]
pub struct FormPart {
    pub name: String,
    pub value: PartValue,
}

impl FormPart {
    pub fn text(name: &str, value: impl Into<String>) -> Self {
        FormPart {
            name: name.to_string(),
            value: PartValue::Text(value.into()),
        }
    }

    pub fn file(name: &str, bytes: Bytes, filename: &str, mime_type: &str) -> Self {
        FormPart {
            name: name.to_string(),
            value: PartValue::File {
                bytes,
                filename: filename.to_string(),
                mime_type: mime_type.to_string(),
            },
        }
    }

    pub fn text_value(&self) -> Option<&str> {
        match &self.value {
            PartValue::Text(text) => Some(text),
            PartValue::File { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StagePayload {
    Json(Value),
    Multipart(Vec<FormPart>),
}

impl StagePayload {
    pub fn part(&self, name: &str) -> Option<&FormPart> {
        match self {
            StagePayload::Multipart(parts) => parts.iter().find(|p| p.name == name),
            StagePayload::Json(_) => None,
        }
    }
}

/// Where a stage lives and how it is called.
#[derive(Debug, Clone)]
pub struct StageEndpoint {
    pub stage: StageId,
    pub url: String,
    pub path: String,
    pub mode: StageMode,
    pub timeout: Duration,
}

impl StageEndpoint {
    pub fn api_path(&self, api_path: &str) -> String {
        let base = self.url.trim_end_matches('/');
        if api_path.starts_with('/') {
            format!("{}{}", base, api_path)
        } else {
            format!("{}/{}", base, api_path)
        }
    }

    pub fn call(&self, payload: StagePayload) -> StageCall {
        StageCall {
            stage: self.stage,
            url: self.api_path(&self.path),
            mode: self.mode,
            timeout: self.timeout,
            payload,
        }
    }
}

/// One upstream invocation, built fresh for every attempt.
#[derive(Debug, Clone)]
pub struct StageCall {
    pub stage: StageId,
    pub url: String,
    pub mode: StageMode,
    pub timeout: Duration,
    pub payload: StagePayload,
}

#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl BufferedResponse {
    pub fn json(value: &Value) -> Self {
        BufferedResponse {
            status: 200,
            content_type: Some("application/json".to_string()),
            body: Bytes::from(value.to_string()),
        }
    }

    pub fn binary(content_type: &str, body: impl Into<Bytes>) -> Self {
        BufferedResponse {
            status: 200,
            content_type: Some(content_type.to_string()),
            body: body.into(),
        }
    }

    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("application/json") || ct.ends_with("+json"))
    }

    pub fn to_json(&self, stage: StageId) -> Result<Value, StageError> {
        serde_json::from_slice(&self.body).map_err(|e| {
            StageError::upstream(stage, format!("response is not valid JSON: {}", e))
        })
    }
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Bytes, StageError>> + Send>>;

pub enum StageResponse {
    Buffered(BufferedResponse),
    Streaming(FrameStream),
}

impl fmt::Debug for StageResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageResponse::Buffered(resp) => f.debug_tuple("Buffered").field(resp).finish(),
            StageResponse::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

/// Performs exactly one call to one stage service. Never retries.
#[async_trait]
pub trait StageTransport: Send + Sync {
    async fn call(&self, call: StageCall) -> Result<StageResponse, StageError>;
}

#[derive(Debug, Clone)]
pub struct HttpStageClient {
    client: reqwest::Client,
}

impl HttpStageClient {
    pub fn new(client: reqwest::Client) -> Self {
        HttpStageClient { client }
    }
}

#[async_trait]
impl StageTransport for HttpStageClient {
    async fn call(&self, call: StageCall) -> Result<StageResponse, StageError> {
        let stage = call.stage;
        let mut request = self.client.post(&call.url).timeout(call.timeout);
        request = match &call.payload {
            StagePayload::Json(value) => request.json(value),
            StagePayload::Multipart(parts) => request.multipart(build_form(stage, parts)?),
        };
        if call.mode == StageMode::Streaming {
            request = request.header(ACCEPT, "text/event-stream");
        }

        log::debug!("Calling {} stage at {}", stage, call.url);
        let resp = request
            .send()
            .await
            .map_err(|e| StageError::from_reqwest(stage, &e))?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|e| format!("failed to read error body: {}", e));
            return Err(StageError::http(stage, status.as_u16(), error_message(&body)));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        // a streaming stage may still answer with one JSON document
        let streamed = call.mode == StageMode::Streaming
            && !content_type
                .as_deref()
                .is_some_and(|ct| ct.starts_with("application/json"));

        if streamed {
            let frames = resp
                .bytes_stream()
                .map(move |r| r.map_err(|e| StageError::from_reqwest(stage, &e)));
            Ok(StageResponse::Streaming(Box::pin(frames)))
        } else {
            let body = resp
                .bytes()
                .await
                .map_err(|e| StageError::from_reqwest(stage, &e))?;
            Ok(StageResponse::Buffered(BufferedResponse {
                status: status.as_u16(),
                content_type,
                body,
            }))
        }
    }
}

fn build_form(stage: StageId, parts: &[FormPart]) -> Result<Form, StageError> {
    let mut form = Form::new();
    for part in parts {
        form = match &part.value {
            PartValue::Text(text) => form.text(part.name.clone(), text.clone()),
            PartValue::File {
                bytes,
                filename,
                mime_type,
            } => {
                let file = Part::stream_with_length(bytes.clone(), bytes.len() as u64)
                    .file_name(filename.clone())
                    .mime_str(mime_type)
                    .map_err(|e| {
                        StageError::transport(
                            stage,
                            format!("invalid form part {}: {}", part.name, e),
                        )
                    })?;
                form.part(part.name.clone(), file)
            }
        };
    }
    Ok(form)
}

/// Pull the human readable reason out of an upstream error body.
pub fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["error", "detail", "message"] {
            if let Some(msg) = value.get(key).and_then(Value::as_str) {
                return msg.to_string();
            }
        }
    }
    let body = body.trim();
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str, path: &str) -> StageEndpoint {
        StageEndpoint {
            stage: StageId::Analysis,
            url: url.to_string(),
            path: path.to_string(),
            mode: StageMode::Buffered,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn api_path_joins_without_double_slash() {
        assert_eq!(
            endpoint("http://localhost:8009/", "/analyze")
                .call(StagePayload::Json(Value::Null))
                .url,
            "http://localhost:8009/analyze"
        );
        assert_eq!(
            endpoint("http://localhost:8009", "analyze/stream").api_path("analyze/stream"),
            "http://localhost:8009/analyze/stream"
        );
    }

    #[test]
    fn error_message_prefers_json_error_field() {
        assert_eq!(
            error_message(r#"{"error": "No product recommendations found"}"#),
            "No product recommendations found"
        );
        assert_eq!(
            error_message(r#"{"detail": "File must be an image"}"#),
            "File must be an image"
        );
        assert_eq!(error_message("  Bad Gateway \n"), "Bad Gateway");
    }

    #[test]
    fn json_content_type_detection() {
        let resp = BufferedResponse::json(&serde_json::json!({"ok": true}));
        assert!(resp.is_json());
        assert_eq!(resp.to_json(StageId::Analysis).unwrap()["ok"], true);
        assert!(!BufferedResponse::binary("image/png", vec![1u8, 2, 3]).is_json());
    }
}
