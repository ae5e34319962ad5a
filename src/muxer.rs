use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::StageError;
use crate::stage_client::StageId;

/// Longest stderr tail carried into a mux error.
const MAX_STDERR_TAIL: usize = 512;

/// Inputs and output of one mux, all inside the run workspace.
#[derive(Debug, Clone)]
pub struct MuxJob {
    pub video: PathBuf,
    pub audio: PathBuf,
    pub output: PathBuf,
}

/// Combines the narration track and the generated video into one file.
#[async_trait]
pub trait Muxer: Send + Sync {
    async fn mux(&self, job: &MuxJob) -> Result<(), StageError>;
}

#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    binary: PathBuf,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl FfmpegMuxer {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        FfmpegMuxer {
            binary: binary.into(),
            ffprobe: PathBuf::from("ffprobe"),
            timeout,
        }
    }

    pub fn with_ffprobe(mut self, ffprobe: impl Into<PathBuf>) -> Self {
        self.ffprobe = ffprobe.into();
        self
    }

    /// Loops the video under the narration, cuts at the narration length and
    /// re-encodes at 1080p.
    pub fn args(job: &MuxJob, audio_secs: f64) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-y", "-stream_loop", "-1", "-i"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(job.video.clone().into_os_string());
        args.push("-i".into());
        args.push(job.audio.clone().into_os_string());
        args.extend(["-map", "0:v:0", "-map", "1:a:0", "-t"].map(OsString::from));
        args.push(format!("{:.3}", audio_secs).into());
        args.extend(
            [
                "-vf", "fps=30,scale=1920:-2:flags=lanczos",
                "-c:v", "libx264", "-preset", "slow", "-crf", "17", "-pix_fmt", "yuv420p",
                "-c:a", "aac", "-b:a", "224k",
                "-movflags", "+faststart",
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(job.output.clone().into_os_string());
        args
    }

    /// Narration length in seconds, as reported by ffprobe.
    pub async fn audio_duration(&self, audio: &Path) -> Result<f64, StageError> {
        let mut args: Vec<OsString> = [
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        args.push(audio.as_os_str().to_owned());

        let stdout = run(&self.ffprobe, args).await?;
        let text = String::from_utf8_lossy(&stdout);
        match text.trim().parse::<f64>() {
            Ok(secs) if secs.is_finite() && secs > 0.0 => Ok(secs),
            _ => Err(StageError::process(
                StageId::Mux,
                format!(
                    "unusable audio duration from {}: {:?}",
                    self.ffprobe.display(),
                    tail(&text)
                ),
            )),
        }
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn mux(&self, job: &MuxJob) -> Result<(), StageError> {
        let work = async {
            let audio_secs = self.audio_duration(&job.audio).await?;
            run(&self.binary, Self::args(job, audio_secs)).await?;
            Ok::<_, StageError>(())
        };
        // dropping the work future on timeout kills whichever child is running
        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| {
                StageError::timeout(
                    StageId::Mux,
                    format!("no result within {}s", self.timeout.as_secs()),
                )
            })??;
        ensure_output(&job.output).await
    }
}

/// Run one external command to completion and return its stdout.
async fn run(program: &Path, args: Vec<OsString>) -> Result<Vec<u8>, StageError> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            StageError::process(
                StageId::Mux,
                format!("failed to start {}: {}", program.display(), e),
            )
        })?;
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| StageError::process(StageId::Mux, e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StageError::process(
            StageId::Mux,
            format!(
                "{} exited with {}: {}",
                program.display(),
                output.status,
                tail(&stderr)
            ),
        ));
    }
    Ok(output.stdout)
}

async fn ensure_output(path: &Path) -> Result<(), StageError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => Err(StageError::incomplete(StageId::Mux, "muxed output is empty")),
        Err(e) => Err(StageError::incomplete(
            StageId::Mux,
            format!("muxed output missing: {}", e),
        )),
    }
}

fn tail(text: &str) -> &str {
    let text = text.trim_end();
    let count = text.chars().count();
    if count <= MAX_STDERR_TAIL {
        return text;
    }
    match text.char_indices().nth(count - MAX_STDERR_TAIL) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}
