pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod history;
pub mod orchestrator;
pub mod scratch;
pub mod server;

pub use config::Config;
pub use engine::{MediaEngine, ScriptedAttempt, ScriptedEngine, YtDlpEngine};
pub use error::{ApiError, EngineError, FetchError};
pub use format::{DownloadRequest, MediaFormat, OutputTemplate};
pub use history::{HistoryRecord, HistoryStore, SqliteHistoryStore};
pub use orchestrator::{LocatedArtifact, MAX_DOWNLOAD_RETRIES, Orchestrator};
pub use scratch::ScratchDir;
pub use server::{AppState, build_router};
