use std::borrow::Cow;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PipelineError;
use crate::stage_client::StageId;

pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp"];
pub const DEFAULT_CUSTOM_PROMPT: &str = "Incorporate these products naturally into this room scene";
const MAX_REQUEST_ID_LEN: usize = 128;

/// Body accepted by the pipeline endpoints.
#[derive(Debug, Deserialize, Serialize)]
pub struct PipelineReqInput {
    /// Base64 text or a `data:image/...;base64,` URL.
    pub image: String,
    pub filename: Option<String>,
    pub preferences: Option<String>,
    pub style: Option<String>,
    pub custom_prompt: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Room analysis followed by product image generation.
    Design,
    /// Narration and video generated concurrently, then muxed.
    Tour,
}

impl PipelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::Design => "design",
            PipelineKind::Tour => "tour",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Modern,
    Scandinavian,
    Industrial,
    Bohemian,
    MidcenturyModern,
    Traditional,
}

impl Style {
    pub const ALL: [Style; 6] = [
        Style::Modern,
        Style::Scandinavian,
        Style::Industrial,
        Style::Bohemian,
        Style::MidcenturyModern,
        Style::Traditional,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Style::Modern => "modern",
            Style::Scandinavian => "scandinavian",
            Style::Industrial => "industrial",
            Style::Bohemian => "bohemian",
            Style::MidcenturyModern => "midcentury modern",
            Style::Traditional => "traditional",
        }
    }

    pub fn parse(value: &str) -> Option<Style> {
        let value = value.trim().to_lowercase();
        Style::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// Best effort style pick from free text such as "budget 500 scandinavian style".
    /// The style mentioned first wins.
    pub fn detect(text: &str) -> Option<Style> {
        let text = text.to_lowercase();
        let text = text.as_str();
        STYLE_KEYWORDS
            .iter()
            .flat_map(|(style, words)| {
                words
                    .iter()
                    .filter_map(move |w| text.find(*w).map(|pos| (pos, *style)))
            })
            .min_by_key(|(pos, _)| *pos)
            .map(|(_, style)| style)
    }
}

const STYLE_KEYWORDS: &[(Style, &[&str])] = &[
    (Style::MidcenturyModern, &["midcentury", "mid-century", "mid century"]),
    (Style::Scandinavian, &["scandinavian"]),
    (Style::Industrial, &["industrial"]),
    (Style::Bohemian, &["bohemian", "boho"]),
    (Style::Traditional, &["traditional"]),
    (Style::Modern, &["modern"]),
];

/// Validated input of one orchestration run.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub request_id: String,
    pub kind: PipelineKind,
    pub image: Bytes,
    pub image_mime: String,
    pub filename: String,
    pub preferences: String,
    pub style: Style,
    pub custom_prompt: String,
}

impl PipelineReqInput {
    pub fn into_request(
        self,
        kind: PipelineKind,
        max_upload_bytes: usize,
    ) -> Result<PipelineRequest, PipelineError> {
        let invalid = |msg: String| PipelineError::InputValidation(msg);

        if self.image.trim().is_empty() {
            return Err(invalid("No image provided".to_string()));
        }
        let (image, declared_mime) = decode_image(&self.image)?;
        if image.is_empty() {
            return Err(invalid("No image provided".to_string()));
        }
        if image.len() > max_upload_bytes {
            return Err(invalid(format!(
                "Image too large. Maximum size is {} bytes",
                max_upload_bytes
            )));
        }

        if let Some(filename) = self.filename.as_deref() {
            if !allowed_file(filename) {
                return Err(invalid(format!(
                    "Unsupported file type. Allowed: {}",
                    ALLOWED_EXTENSIONS.join(", ")
                )));
            }
        }

        let image_mime = match sniff_image_mime(&image) {
            Some(mime) => mime.to_string(),
            None => match declared_mime {
                Some(mime) if mime.starts_with("image/") => mime,
                _ => return Err(invalid("File must be an image".to_string())),
            },
        };

        let preferences = self.preferences.unwrap_or_default().trim().to_string();
        if kind == PipelineKind::Design && preferences.is_empty() {
            return Err(invalid("No preferences provided".to_string()));
        }

        let style = match self.style.as_deref() {
            Some(raw) => Style::parse(raw).ok_or_else(|| {
                invalid(format!(
                    "Invalid style. Must be one of: {}",
                    Style::ALL.map(|s| s.as_str()).join(", ")
                ))
            })?,
            None => Style::detect(&preferences).unwrap_or(Style::Modern),
        };

        let request_id = match self.request_id {
            Some(id) if !id.trim().is_empty() => {
                let id = id.trim();
                if id.len() > MAX_REQUEST_ID_LEN || id.chars().any(char::is_control) {
                    return Err(invalid("request_id is malformed".to_string()));
                }
                id.to_string()
            }
            _ => new_request_id(),
        };

        let filename = self
            .filename
            .unwrap_or_else(|| format!("upload.{}", extension_for(&image_mime)));

        Ok(PipelineRequest {
            request_id,
            kind,
            image,
            image_mime,
            filename,
            preferences,
            style,
            custom_prompt: self
                .custom_prompt
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CUSTOM_PROMPT.to_string()),
        })
    }
}

pub fn new_request_id() -> String {
    let suffix: u32 = rand::rng().random();
    format!("req_{}_{:08x}", chrono::Utc::now().timestamp(), suffix)
}

fn allowed_file(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .is_some_and(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

fn decode_image(raw: &str) -> Result<(Bytes, Option<String>), PipelineError> {
    let raw = raw.trim();
    let (declared, encoded) = match raw.strip_prefix("data:") {
        Some(rest) => {
            let (meta, data) = rest.split_once(',').ok_or_else(|| {
                PipelineError::InputValidation("Invalid data URL format".to_string())
            })?;
            let mime = meta.strip_suffix(";base64").ok_or_else(|| {
                PipelineError::InputValidation("Data URL must be base64 encoded".to_string())
            })?;
            (Some(mime.to_string()), data)
        }
        None => (None, raw),
    };
    let cleaned: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD.decode(cleaned).map_err(|e| {
        PipelineError::InputValidation(format!("image must be base64 encoded: {}", e))
    })?;
    Ok((Bytes::from(bytes), declared))
}

pub fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF8") {
        Some("image/gif")
    } else if bytes.starts_with(b"BM") {
        Some("image/bmp")
    } else {
        None
    }
}

pub fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        "audio/mpeg" => "mp3",
        "audio/wav" | "audio/x-wav" => "wav",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        _ => "bin",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentBody {
    Raw(Bytes),
    /// Already base64 text, relayed without a decode/encode round trip.
    Base64(String),
}

/// Large binary result of a stage (image, audio or video).
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryAttachment {
    pub mime_type: String,
    pub body: AttachmentBody,
}

impl BinaryAttachment {
    pub fn raw(mime_type: &str, bytes: Bytes) -> Self {
        BinaryAttachment {
            mime_type: mime_type.to_string(),
            body: AttachmentBody::Raw(bytes),
        }
    }

    pub fn base64(mime_type: &str, encoded: String) -> Self {
        BinaryAttachment {
            mime_type: mime_type.to_string(),
            body: AttachmentBody::Base64(encoded),
        }
    }

    /// `image`, `audio`, `video` or `binary`, used to name outbound data events.
    pub fn kind(&self) -> &'static str {
        match self.mime_type.split('/').next() {
            Some("image") => "image",
            Some("audio") => "audio",
            Some("video") => "video",
            _ => "binary",
        }
    }

    pub fn encoded(&self) -> Cow<'_, str> {
        match &self.body {
            AttachmentBody::Raw(bytes) => Cow::Owned(STANDARD.encode(bytes)),
            AttachmentBody::Base64(text) => Cow::Borrowed(text),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match &self.body {
            AttachmentBody::Raw(bytes) => bytes.len().div_ceil(3) * 4,
            AttachmentBody::Base64(text) => text.len(),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, base64::DecodeError> {
        match &self.body {
            AttachmentBody::Raw(bytes) => Ok(bytes.clone()),
            AttachmentBody::Base64(text) => STANDARD.decode(text).map(Bytes::from),
        }
    }
}

/// Structured result of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub data: Value,
    pub attachment: Option<BinaryAttachment>,
}

impl StageOutput {
    pub fn new(data: Value) -> Self {
        StageOutput {
            data,
            attachment: None,
        }
    }
}

/// Merged outcome of a whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResult {
    pub request_id: String,
    pub kind: PipelineKind,
    pub success: bool,
    pub fields: Map<String, Value>,
    pub summary: Value,
    pub attachments: Vec<(String, BinaryAttachment)>,
}

impl PipelineResult {
    pub fn attachment(&self, name: &str) -> Option<&BinaryAttachment> {
        self.attachments
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Started,
    Progress,
    StageCompleted,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Data(Value),
    Result(Box<PipelineResult>),
}

/// The unified progress vocabulary every stage is translated into.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedProgress {
    pub stage: Option<StageId>,
    pub phase: Phase,
    pub message: String,
    pub payload: Option<Payload>,
}

impl NormalizedProgress {
    pub fn started(request_id: &str, kind: PipelineKind) -> Self {
        NormalizedProgress {
            stage: None,
            phase: Phase::Started,
            message: format!("Starting {} pipeline", kind.as_str()),
            payload: Some(Payload::Data(serde_json::json!({
                "request_id": request_id,
                "pipeline": kind.as_str(),
            }))),
        }
    }

    pub fn progress(stage: StageId, message: impl Into<String>, details: Option<Value>) -> Self {
        NormalizedProgress {
            stage: Some(stage),
            phase: Phase::Progress,
            message: message.into(),
            payload: details.map(Payload::Data),
        }
    }

    pub fn stage_completed(
        stage: StageId,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Self {
        NormalizedProgress {
            stage: Some(stage),
            phase: Phase::StageCompleted,
            message: message.into(),
            payload: details.map(Payload::Data),
        }
    }

    pub fn completed(result: PipelineResult) -> Self {
        NormalizedProgress {
            stage: None,
            phase: Phase::Completed,
            message: format!("{} pipeline completed", result.kind.as_str()),
            payload: Some(Payload::Result(Box::new(result))),
        }
    }

    pub fn failed(err: &PipelineError) -> Self {
        let mut details = Map::new();
        details.insert("kind".to_string(), Value::from(err.kind()));
        if let PipelineError::Stage(e) = err {
            if let Some(status) = e.http_status {
                details.insert("http_status".to_string(), Value::from(status));
            }
        }
        NormalizedProgress {
            stage: err.stage(),
            phase: Phase::Error,
            message: err.to_string(),
            payload: Some(Payload::Data(Value::Object(details))),
        }
    }

    /// External status word: `started`, `<stage>_progress`,
    /// `<stage>_completed`, `completed` or `error`.
    pub fn status(&self) -> String {
        match (self.phase, self.stage) {
            (Phase::Started, _) => "started".to_string(),
            (Phase::Progress, Some(stage)) => format!("{}_progress", stage),
            (Phase::Progress, None) => "progress".to_string(),
            (Phase::StageCompleted, Some(stage)) => format!("{}_completed", stage),
            (Phase::StageCompleted, None) | (Phase::Completed, _) => "completed".to_string(),
            (Phase::Error, _) => "error".to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Completed | Phase::Error)
    }
}
