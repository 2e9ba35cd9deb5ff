use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::SystemTime,
};

use tokio::{runtime::Handle, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{error::FetchError, format::OutputTemplate};

/// Request-exclusive staging directory, removed when dropped.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub async fn create(root: &Path) -> Result<Self, FetchError> {
        let path = root.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(FetchError::Scratch)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn template(&self) -> OutputTemplate {
        OutputTemplate::in_dir(&self.path)
    }

    /// Best-effort recursive removal. Safe to call any number of times.
    pub fn cleanup(&self) {
        log_removal(&self.path);
    }
}

/// Removal runs on the blocking pool inside a runtime, inline outside one.
impl Drop for ScratchDir {
    fn drop(&mut self) {
        let path = std::mem::take(&mut self.path);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || log_removal(&path));
            }
            Err(_) => log_removal(&path),
        }
    }
}

fn log_removal(path: &Path) {
    if let Err(error) = remove_dir(path) {
        info!("{error}");
    }
}

fn remove_dir(path: &Path) -> Result<(), FetchError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(FetchError::CleanupFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Removes scratch directories under `root` untouched for at least
/// `older_than_secs`. Only uuid-named directories are touched.
pub async fn cleanup_stale_scratch(root: &Path, older_than_secs: u64) {
    if older_than_secs == 0 {
        return;
    }

    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("could not open scratch root for cleanup: {error}");
            }
            return;
        }
    };

    let max_age = Duration::from_secs(older_than_secs);
    let now = SystemTime::now();
    let mut removed = 0usize;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("could not iterate scratch root for cleanup: {error}");
                break;
            }
        };

        let path = entry.path();
        if !is_scratch_name(&path) {
            continue;
        }

        let stale = match entry.metadata().await {
            Ok(metadata) => metadata.is_dir() && age_of(&metadata, now) >= max_age,
            Err(error) => {
                warn!("could not read metadata of {:?}: {error}", path);
                false
            }
        };
        if !stale {
            continue;
        }

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("could not remove stale scratch directory {:?}: {error}", path),
        }
    }

    if removed > 0 {
        info!("removed {removed} stale scratch directories from {:?}", root);
    } else {
        debug!("no stale scratch directories in {:?}", root);
    }
}

fn is_scratch_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| Uuid::parse_str(name).is_ok())
}

fn age_of(metadata: &std::fs::Metadata, now: SystemTime) -> Duration {
    metadata
        .modified()
        .ok()
        .and_then(|modified_at| now.duration_since(modified_at).ok())
        .unwrap_or_default()
}

/// Polls until `path` is gone; drop-time removal finishes on the blocking pool.
#[cfg(test)]
pub(crate) async fn wait_until_removed(path: &Path) -> bool {
    for _ in 0..100 {
        if !path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
