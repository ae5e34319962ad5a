use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

use crate::stage_client::StageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageErrorKind {
    Timeout,
    Http,
    IncompleteResult,
    NoUsableInput,
    /// The stage itself reported an error in its payload.
    Upstream,
    /// Connection could not be established or broke mid-body.
    Transport,
    /// External command exited unsuccessfully.
    Process,
}

impl StageErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageErrorKind::Timeout => "timeout",
            StageErrorKind::Http => "http_error",
            StageErrorKind::IncompleteResult => "incomplete_result",
            StageErrorKind::NoUsableInput => "no_usable_input",
            StageErrorKind::Upstream => "upstream_error",
            StageErrorKind::Transport => "transport_error",
            StageErrorKind::Process => "process_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}", describe(.stage, .kind, .http_status, .message))]
pub struct StageError {
    pub stage: StageId,
    pub kind: StageErrorKind,
    pub http_status: Option<u16>,
    pub message: String,
}

impl StageError {
    pub fn new(stage: StageId, kind: StageErrorKind, message: impl Into<String>) -> Self {
        StageError {
            stage,
            kind,
            http_status: None,
            message: message.into(),
        }
    }

    pub fn timeout(stage: StageId, message: impl Into<String>) -> Self {
        Self::new(stage, StageErrorKind::Timeout, message)
    }

    pub fn http(stage: StageId, status: u16, body: impl Into<String>) -> Self {
        StageError {
            http_status: Some(status),
            ..Self::new(stage, StageErrorKind::Http, body)
        }
    }

    pub fn incomplete(stage: StageId, message: impl Into<String>) -> Self {
        Self::new(stage, StageErrorKind::IncompleteResult, message)
    }

    pub fn no_usable_input(stage: StageId, message: impl Into<String>) -> Self {
        Self::new(stage, StageErrorKind::NoUsableInput, message)
    }

    pub fn upstream(stage: StageId, message: impl Into<String>) -> Self {
        Self::new(stage, StageErrorKind::Upstream, message)
    }

    pub fn transport(stage: StageId, message: impl Into<String>) -> Self {
        Self::new(stage, StageErrorKind::Transport, message)
    }

    pub fn process(stage: StageId, message: impl Into<String>) -> Self {
        Self::new(stage, StageErrorKind::Process, message)
    }

    /// Maps a reqwest failure onto the stage taxonomy, keeping timeouts apart
    /// from every other transport problem.
    pub fn from_reqwest(stage: StageId, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(stage, err.to_string())
        } else if let Some(status) = err.status() {
            Self::http(stage, status.as_u16(), err.to_string())
        } else {
            Self::transport(stage, err.to_string())
        }
    }
}

fn describe(
    stage: &StageId,
    kind: &StageErrorKind,
    http_status: &Option<u16>,
    message: &str,
) -> String {
    match kind {
        StageErrorKind::Timeout => format!("{} stage timed out: {}", stage, message),
        StageErrorKind::Http => format!(
            "{} stage failed with HTTP status {}: {}",
            stage,
            http_status.unwrap_or_default(),
            message
        ),
        StageErrorKind::IncompleteResult => {
            format!("{} stage ended with an incomplete result: {}", stage, message)
        }
        StageErrorKind::NoUsableInput => format!("{} (stage: {})", message, stage),
        StageErrorKind::Upstream => format!("{} stage reported an error: {}", stage, message),
        StageErrorKind::Transport => format!("{} stage connection failed: {}", stage, message),
        StageErrorKind::Process => format!("{} stage process failed: {}", stage, message),
    }
}

/// A single SSE block that could not be turned into an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("block carries no data field: {0:?}")]
    MissingData(String),
    #[error("data is not valid JSON ({reason}): {data:?}")]
    InvalidJson { reason: String, data: String },
    #[error("block is not valid UTF-8")]
    InvalidUtf8,
    #[error("{event} event arrived before its completed event")]
    OutOfOrder { event: String },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InputValidation(String),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("failed to aggregate stage outputs: {0}")]
    Aggregation(String),
    #[error("run workspace error: {0}")]
    Workspace(#[from] std::io::Error),
    #[error("client disconnected")]
    ClientDisconnected,
}

impl PipelineError {
    pub fn stage(&self) -> Option<StageId> {
        match self {
            PipelineError::Stage(e) => Some(e.stage),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InputValidation(_) => "input_validation",
            PipelineError::Stage(e) => e.kind.as_str(),
            PipelineError::Aggregation(_) => "aggregation",
            PipelineError::Workspace(_) => "workspace",
            PipelineError::ClientDisconnected => "client_disconnected",
        }
    }
}

impl ResponseError for PipelineError {
    fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::InputValidation(_) => StatusCode::BAD_REQUEST,
            PipelineError::Stage(e) if e.kind == StageErrorKind::Timeout => {
                StatusCode::GATEWAY_TIMEOUT
            }
            PipelineError::Stage(_) => StatusCode::BAD_GATEWAY,
            PipelineError::Aggregation(_) | PipelineError::Workspace(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            // nobody is listening, the status only shows up in access logs
            PipelineError::ClientDisconnected => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "stage": self.stage(),
        }))
    }
}
