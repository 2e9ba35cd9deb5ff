//! Fetch-and-locate: drives the engine through a bounded retry loop, then
//! finds the single artifact it wrote into the scratch directory.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{info, warn};

use crate::{
    engine::MediaEngine,
    error::FetchError,
    format::{DownloadRequest, MediaFormat, OutputTemplate, resolve_options},
};

pub const MAX_DOWNLOAD_RETRIES: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedArtifact {
    pub path: PathBuf,
    /// Engine invocations made, including the successful one.
    pub attempts: usize,
}

#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<dyn MediaEngine>,
    max_attempts: usize,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn MediaEngine>, max_attempts: usize) -> Self {
        Self {
            engine,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub async fn fetch(
        &self,
        request: &DownloadRequest,
        template: &OutputTemplate,
    ) -> Result<LocatedArtifact, FetchError> {
        let options = resolve_options(request.format, template.clone(), self.max_attempts);

        let mut attempt = 0;
        let reported = loop {
            attempt += 1;
            match self.engine.download(&request.url, &options).await {
                Ok(reported) => break reported,
                Err(source) => {
                    let failure = FetchError::EngineAttemptFailed { attempt, source };
                    warn!(engine = self.engine.name(), url = %request.url, "{failure}");
                    if attempt >= self.max_attempts {
                        return Err(exhausted(failure));
                    }
                }
            }
        };

        let path = locate_artifact(template, request.format, reported.as_deref()).await?;
        info!(
            url = %request.url,
            format = %request.format,
            attempts = attempt,
            "located artifact {:?}",
            path
        );

        Ok(LocatedArtifact {
            path,
            attempts: attempt,
        })
    }
}

fn exhausted(failure: FetchError) -> FetchError {
    match failure {
        FetchError::EngineAttemptFailed { attempt, source } => FetchError::EngineExhausted {
            attempts: attempt,
            source,
        },
        other => other,
    }
}

/// Prefers the path the engine reported, falling back to a prefix scan of the
/// template directory.
pub async fn locate_artifact(
    template: &OutputTemplate,
    format: MediaFormat,
    reported: Option<&Path>,
) -> Result<PathBuf, FetchError> {
    let dir = template.dir();
    let prefix = template.prefix();
    let not_found = || FetchError::ArtifactNotFound {
        prefix: prefix.to_string(),
        format,
    };

    if let Some(reported) = reported
        && let Some(valid) = reported_candidate(dir, reported, prefix, format).await
    {
        return Ok(valid);
    }

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Err(not_found()),
        Err(error) => return Err(FetchError::Scratch(error)),
    };

    while let Some(entry) = entries.next_entry().await.map_err(FetchError::Scratch)? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if matches_artifact(name, prefix, format)
            && entry.file_type().await.map_err(FetchError::Scratch)?.is_file()
        {
            return Ok(entry.path());
        }
    }

    Err(not_found())
}

async fn reported_candidate(
    dir: &Path,
    reported: &Path,
    prefix: &str,
    format: MediaFormat,
) -> Option<PathBuf> {
    let candidate = if reported.is_absolute() {
        reported.to_path_buf()
    } else {
        dir.join(reported)
    };

    let metadata = tokio::fs::metadata(&candidate).await.ok()?;
    if !metadata.is_file() {
        return None;
    }

    let canonical_dir = tokio::fs::canonicalize(dir).await.ok()?;
    let canonical_candidate = tokio::fs::canonicalize(&candidate).await.ok()?;
    if canonical_candidate.parent() != Some(canonical_dir.as_path()) {
        warn!(
            "ignoring reported output outside the scratch directory: {:?}",
            canonical_candidate
        );
        return None;
    }

    let name = canonical_candidate.file_name()?.to_str()?;
    matches_artifact(name, prefix, format).then_some(candidate)
}

fn matches_artifact(name: &str, prefix: &str, format: MediaFormat) -> bool {
    let suffix = format!(".{}", format.extension());
    name.starts_with(prefix) && name.to_ascii_lowercase().ends_with(&suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{ScriptedAttempt, ScriptedEngine},
        scratch::{ScratchDir, wait_until_removed},
    };

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        /// Installs a WARN-level subscriber for the current thread.
        fn install(&self) -> tracing::subscriber::DefaultGuard {
            let writer = self.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(tracing::Level::WARN)
                .with_ansi(false)
                .without_time()
                .with_writer(move || writer.clone())
                .finish();
            tracing::subscriber::set_default(subscriber)
        }

        fn warnings(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock().unwrap())
                .lines()
                .filter(|line| line.contains("WARN"))
                .map(ToString::to_string)
                .collect()
        }
    }

    fn orchestrator(engine: &Arc<ScriptedEngine>) -> Orchestrator {
        Orchestrator::new(engine.clone(), MAX_DOWNLOAD_RETRIES)
    }

    #[tokio::test]
    async fn first_attempt_success_invokes_engine_once() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(root.path()).await.unwrap();
        let engine = Arc::new(ScriptedEngine::new([ScriptedAttempt::Produce(vec![
            "dl.mp4".into(),
        ])]));
        let request = DownloadRequest::new("https://x/video", "mp4", None).unwrap();

        let located = orchestrator(&engine)
            .fetch(&request, &scratch.template())
            .await
            .unwrap();

        assert!(located.path.ends_with("dl.mp4"));
        assert_eq!(located.attempts, 1);
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn retries_once_after_failure() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(root.path()).await.unwrap();
        let engine = Arc::new(ScriptedEngine::new([
            ScriptedAttempt::Fail("connection reset".into()),
            ScriptedAttempt::Produce(vec!["dl.mp3".into()]),
        ]));
        let request = DownloadRequest::new("https://x/song", "mp3", None).unwrap();

        let located = orchestrator(&engine)
            .fetch(&request, &scratch.template())
            .await
            .unwrap();

        assert_eq!(located.path, scratch.path().join("dl.mp3"));
        assert_eq!(located.attempts, 2);
        assert_eq!(engine.calls(), 2);
    }

    #[tokio::test]
    async fn recovered_failure_logs_one_warning() {
        let logs = CapturedLogs::default();
        let _guard = logs.install();

        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(root.path()).await.unwrap();
        let engine = Arc::new(ScriptedEngine::new([
            ScriptedAttempt::Fail("connection reset".into()),
            ScriptedAttempt::Produce(vec!["dl.mp3".into()]),
        ]));
        let request = DownloadRequest::new("https://x/song", "mp3", None).unwrap();

        orchestrator(&engine)
            .fetch(&request, &scratch.template())
            .await
            .unwrap();

        let warnings = logs.warnings();
        assert_eq!(warnings.len(), 1, "{warnings:?}");
        assert!(warnings[0].contains("attempt 1 failed: connection reset"));
    }

    #[tokio::test]
    async fn first_try_success_logs_no_warning() {
        let logs = CapturedLogs::default();
        let _guard = logs.install();

        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(root.path()).await.unwrap();
        let engine = Arc::new(ScriptedEngine::new([ScriptedAttempt::Produce(vec![
            "dl.mp4".into(),
        ])]));
        let request = DownloadRequest::new("https://x/video", "mp4", None).unwrap();

        orchestrator(&engine)
            .fetch(&request, &scratch.template())
            .await
            .unwrap();

        assert!(logs.warnings().is_empty());
    }

    #[tokio::test]
    async fn exhausts_retry_budget() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(root.path()).await.unwrap();
        let engine = Arc::new(ScriptedEngine::new([
            ScriptedAttempt::Fail("first".into()),
            ScriptedAttempt::Fail("second".into()),
            ScriptedAttempt::Produce(vec!["dl.mp4".into()]),
        ]));
        let request = DownloadRequest::new("https://x/video", "mp4", None).unwrap();

        let error = orchestrator(&engine)
            .fetch(&request, &scratch.template())
            .await
            .unwrap_err();

        match error {
            FetchError::EngineExhausted { attempts, source } => {
                assert_eq!(attempts, MAX_DOWNLOAD_RETRIES);
                assert_eq!(source.to_string(), "second");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(engine.calls(), MAX_DOWNLOAD_RETRIES);

        let scratch_path = scratch.path().to_path_buf();
        drop(scratch);
        assert!(wait_until_removed(&scratch_path).await);
    }

    #[tokio::test]
    async fn larger_budget_is_honored() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(root.path()).await.unwrap();
        let engine = Arc::new(ScriptedEngine::new(
            (0..5).map(|i| ScriptedAttempt::Fail(format!("fail {i}"))),
        ));
        let request = DownloadRequest::new("https://x/video", "mp4", None).unwrap();

        let error = Orchestrator::new(engine.clone(), 4)
            .fetch(&request, &scratch.template())
            .await
            .unwrap_err();

        assert!(matches!(error, FetchError::EngineExhausted { attempts: 4, .. }));
        assert_eq!(engine.calls(), 4);
    }

    #[tokio::test]
    async fn unsupported_format_never_reaches_engine() {
        let engine = Arc::new(ScriptedEngine::new([ScriptedAttempt::Produce(vec![
            "dl.wav".into(),
        ])]));
        let error = DownloadRequest::new("https://x/video", "wav", None).unwrap_err();

        assert!(matches!(error, FetchError::UnsupportedFormat(ref value) if value == "wav"));
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn success_without_matching_file_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(root.path()).await.unwrap();
        let engine = Arc::new(ScriptedEngine::new([ScriptedAttempt::Produce(vec![
            "dl.part".into(),
        ])]));
        let request = DownloadRequest::new("https://x/song", "mp3", None).unwrap();

        let error = orchestrator(&engine)
            .fetch(&request, &scratch.template())
            .await
            .unwrap_err();

        match error {
            FetchError::ArtifactNotFound { prefix, format } => {
                assert_eq!(prefix, "dl");
                assert_eq!(format, MediaFormat::Mp3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn extension_match_is_case_insensitive() {
        let root = tempfile::tempdir().unwrap();
        let template = OutputTemplate::in_dir(root.path());
        std::fs::write(root.path().join("dl.MP4"), b"x").unwrap();
        std::fs::write(root.path().join("other.mp4"), b"x").unwrap();

        let path = locate_artifact(&template, MediaFormat::Mp4, None).await.unwrap();
        assert_eq!(path, root.path().join("dl.MP4"));
    }

    #[tokio::test]
    async fn directory_named_like_artifact_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let template = OutputTemplate::in_dir(root.path());
        std::fs::create_dir(root.path().join("dl.mp4")).unwrap();

        let error = locate_artifact(&template, MediaFormat::Mp4, None)
            .await
            .unwrap_err();
        assert!(matches!(error, FetchError::ArtifactNotFound { .. }));

        std::fs::write(root.path().join("dl.f22.mp4"), b"x").unwrap();
        let path = locate_artifact(&template, MediaFormat::Mp4, None).await.unwrap();
        assert_eq!(path, root.path().join("dl.f22.mp4"));
    }

    #[tokio::test]
    async fn foreign_prefix_is_ignored() {
        let root = tempfile::tempdir().unwrap();
        let template = OutputTemplate::in_dir(root.path());
        std::fs::write(root.path().join("video.mp4"), b"x").unwrap();

        let error = locate_artifact(&template, MediaFormat::Mp4, None)
            .await
            .unwrap_err();
        assert!(matches!(error, FetchError::ArtifactNotFound { .. }));
    }

    #[tokio::test]
    async fn reported_path_wins_when_valid() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(root.path()).await.unwrap();
        let engine = Arc::new(ScriptedEngine::new([ScriptedAttempt::ProduceAndReport {
            files: vec!["dl.f137.mp4".into(), "dl.mp4".into()],
            reported: "dl.mp4".into(),
        }]));
        let request = DownloadRequest::new("https://x/video", "mp4", None).unwrap();

        let located = orchestrator(&engine)
            .fetch(&request, &scratch.template())
            .await
            .unwrap();

        assert_eq!(located.path, scratch.path().join("dl.mp4"));
    }

    #[tokio::test]
    async fn reported_path_outside_scratch_falls_back_to_scan() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let escaped = outside.path().join("dl.mp4");
        std::fs::write(&escaped, b"x").unwrap();
        std::fs::write(root.path().join("dl.mp4"), b"x").unwrap();
        let template = OutputTemplate::in_dir(root.path());

        let path = locate_artifact(&template, MediaFormat::Mp4, Some(&escaped))
            .await
            .unwrap();
        assert_eq!(path, root.path().join("dl.mp4"));
    }

    #[tokio::test]
    async fn stale_reported_path_falls_back_to_scan() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("dl.mp3"), b"x").unwrap();
        let template = OutputTemplate::in_dir(root.path());
        let reported = root.path().join("dl.webm");

        let path = locate_artifact(&template, MediaFormat::Mp3, Some(&reported))
            .await
            .unwrap();
        assert_eq!(path, root.path().join("dl.mp3"));
    }
}
