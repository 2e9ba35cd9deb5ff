use std::{
    collections::VecDeque,
    io::ErrorKind,
    path::PathBuf,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::debug;

use crate::{error::EngineError, format::EngineOptions};

/// Download/transcode capability. One call is one attempt; retrying is the
/// caller's job.
///
/// On success the engine may report the path it wrote, when it knows it.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn download(
        &self,
        url: &str,
        options: &EngineOptions,
    ) -> Result<Option<PathBuf>, EngineError>;
}

/// Runs the `yt-dlp` executable as a child process.
#[derive(Debug, Clone)]
pub struct YtDlpEngine {
    binary: String,
    timeout: Duration,
}

impl YtDlpEngine {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn build_args(url: &str, options: &EngineOptions) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--newline".to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "--retries".to_string(),
            options.retries.to_string(),
            "-o".to_string(),
            options.output.render(),
            "-f".to_string(),
            options.selector.to_string(),
        ];

        if let Some(container) = options.merge_output_format {
            args.push("--merge-output-format".to_string());
            args.push(container.extension().to_string());
        }

        if let Some(extraction) = &options.extract_audio {
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push(extraction.codec.extension().to_string());
            args.push("--audio-quality".to_string());
            args.push(format!("{}K", extraction.quality_kbps));
        }

        args.push("--".to_string());
        args.push(url.to_string());
        args
    }
}

#[async_trait]
impl MediaEngine for YtDlpEngine {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn download(
        &self,
        url: &str,
        options: &EngineOptions,
    ) -> Result<Option<PathBuf>, EngineError> {
        let args = Self::build_args(url, options);
        debug!("running {} {:?}", self.binary, args);

        let command_future = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| EngineError::Timeout {
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    EngineError::NotInstalled {
                        binary: self.binary.clone(),
                    }
                } else {
                    EngineError::Spawn {
                        binary: self.binary.clone(),
                        source: error,
                    }
                }
            })?;

        if !output.status.success() {
            return Err(EngineError::failed(run_error_message(&output.stderr)));
        }

        Ok(extract_printed_path(&output.stdout).map(PathBuf::from))
    }
}

fn run_error_message(stderr: &[u8]) -> String {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the download")
        .to_string();

    if message.to_ascii_lowercase().contains("unsupported url") {
        "Unsupported or invalid URL for download.".to_string()
    } else {
        message
    }
}

fn extract_printed_path(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

/// What a [`ScriptedEngine`] does on one attempt.
#[derive(Debug, Clone)]
pub enum ScriptedAttempt {
    Fail(String),
    /// Writes the named files into the template directory and succeeds.
    Produce(Vec<String>),
    /// Like `Produce`, and also reports the given file name as the output.
    ProduceAndReport { files: Vec<String>, reported: String },
}

/// Deterministic engine for tests: plays back one scripted outcome per call.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    script: Mutex<VecDeque<ScriptedAttempt>>,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(script: impl IntoIterator<Item = ScriptedAttempt>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_attempt(&self) -> Option<ScriptedAttempt> {
        self.script
            .lock()
            .map(|mut script| script.pop_front())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MediaEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn download(
        &self,
        _url: &str,
        options: &EngineOptions,
    ) -> Result<Option<PathBuf>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let (files, reported) = match self.next_attempt() {
            None => return Err(EngineError::failed("no scripted outcome left")),
            Some(ScriptedAttempt::Fail(message)) => return Err(EngineError::failed(message)),
            Some(ScriptedAttempt::Produce(files)) => (files, None),
            Some(ScriptedAttempt::ProduceAndReport { files, reported }) => (files, Some(reported)),
        };

        let dir = options.output.dir();
        for file in &files {
            tokio::fs::write(dir.join(file), b"scripted media")
                .await
                .map_err(|error| EngineError::failed(format!("could not write {file}: {error}")))?;
        }

        Ok(reported.map(|name| dir.join(name)))
    }
}
