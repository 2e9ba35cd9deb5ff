use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

pub const DEFAULT_QUALITY: &str = "best";
pub const TEMPLATE_PREFIX: &str = "dl";
pub const AUDIO_QUALITY_KBPS: &str = "192";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Mp4,
    Mp3,
}

impl MediaFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mp3 => "mp3",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Mp4 => "video/mp4",
            Self::Mp3 => "audio/mpeg",
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for MediaFormat {
    type Err = FetchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "mp4" => Ok(Self::Mp4),
            "mp3" => Ok(Self::Mp3),
            other => Err(FetchError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// One download as requested by a caller. The quality hint is recorded but
/// does not change engine options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub format: MediaFormat,
    pub quality: String,
}

impl DownloadRequest {
    pub fn new(url: &str, format: &str, quality: Option<&str>) -> Result<Self, FetchError> {
        let format = format.parse()?;
        let quality = quality
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_QUALITY)
            .to_string();

        Ok(Self {
            url: url.to_string(),
            format,
            quality,
        })
    }
}

/// Filename pattern handed to the engine, e.g. `<dir>/dl.%(ext)s`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTemplate {
    dir: PathBuf,
    name: String,
}

impl OutputTemplate {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir, format!("{TEMPLATE_PREFIX}.%(ext)s"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Template name up to its first `.`.
    pub fn prefix(&self) -> &str {
        self.name.split('.').next().unwrap_or_default()
    }

    pub fn render(&self) -> String {
        self.dir.join(&self.name).to_string_lossy().into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioExtraction {
    pub codec: MediaFormat,
    pub quality_kbps: &'static str,
}

/// Engine configuration for one request. Identical across retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub format: MediaFormat,
    pub selector: &'static str,
    pub output: OutputTemplate,
    pub merge_output_format: Option<MediaFormat>,
    pub extract_audio: Option<AudioExtraction>,
    pub retries: usize,
}

pub fn resolve_options(format: MediaFormat, output: OutputTemplate, retries: usize) -> EngineOptions {
    match format {
        MediaFormat::Mp4 => EngineOptions {
            format,
            selector: "bestvideo+bestaudio/best",
            output,
            merge_output_format: Some(MediaFormat::Mp4),
            extract_audio: None,
            retries,
        },
        MediaFormat::Mp3 => EngineOptions {
            format,
            selector: "bestaudio/best",
            output,
            merge_output_format: None,
            extract_audio: Some(AudioExtraction {
                codec: MediaFormat::Mp3,
                quality_kbps: AUDIO_QUALITY_KBPS,
            }),
            retries,
        },
    }
}
