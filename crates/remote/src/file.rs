use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Context};
use keel_core::{RemoteState, UpdateRequest};
use metrics::{counter, histogram};
use tracing::{debug, info};

use crate::{commit, ClientError, ClientResult, ProjectClient};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Remote persisted as one pretty-printed JSON document; a missing file means nothing is provisioned.
///
/// Every write holds an exclusive advisory lock on `<path>.lock` across read, version check, write and
/// rename, so handles in other threads or processes on the same path observe one serial history.
/// Writes go to a per-writer temp file and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileRemote {
    path: PathBuf,
}

impl FileRemote {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Provision the record. Refuses to overwrite an existing document.
    pub fn seed(&self, state: &RemoteState) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
            }
        }
        let mut lock = fd_lock::RwLock::new(open_lock_file(&self.path)?);
        let _guard = lock.write().with_context(|| format!("locking {}", lock_path(&self.path).display()))?;
        if self.path.exists() {
            return Err(anyhow!("remote document already exists at {}", self.path.display()));
        }
        write_document(&self.path, state)?;
        info!(path = %self.path.display(), key = %state.key, version = state.version, "file remote: seeded");
        Ok(())
    }

    fn apply_locked(path: &Path, request: &UpdateRequest) -> ClientResult<(RemoteState, RemoteState)> {
        let file = match open_lock_file(path) {
            Ok(f) => f,
            // Parent directory missing: nothing was ever provisioned here.
            Err(e) if is_not_found(&e) => return Err(ClientError::NotFound),
            Err(e) => return Err(ClientError::Transport(e)),
        };
        let mut lock = fd_lock::RwLock::new(file);
        let _guard = lock
            .write()
            .with_context(|| format!("locking {}", lock_path(path).display()))
            .map_err(ClientError::Transport)?;
        let current = read_document(path)?;
        let next = commit(&current, request)?;
        write_document(path, &next).map_err(ClientError::Transport)?;
        Ok((current, next))
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".lock");
    PathBuf::from(p)
}

fn open_lock_file(path: &Path) -> anyhow::Result<File> {
    let lp = lock_path(path);
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lp)
        .with_context(|| format!("opening {}", lp.display()))
}

fn is_not_found(e: &anyhow::Error) -> bool {
    e.downcast_ref::<std::io::Error>().map(|io| io.kind() == std::io::ErrorKind::NotFound).unwrap_or(false)
}

fn read_document(path: &Path) -> ClientResult<RemoteState> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ClientError::NotFound),
        Err(e) => {
            return Err(ClientError::Transport(anyhow::Error::new(e).context(format!("reading {}", path.display()))))
        }
    };
    serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing remote document {}", path.display()))
        .map_err(ClientError::Transport)
}

fn write_document(path: &Path, state: &RemoteState) -> anyhow::Result<()> {
    let started = std::time::Instant::now();
    let body = serde_json::to_vec_pretty(state).context("serializing remote state")?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.{}.tmp", std::process::id(), TMP_SEQ.fetch_add(1, Ordering::Relaxed)));
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(anyhow::Error::new(e).context(format!("replacing {}", path.display())));
    }
    histogram!("remote_file_write_ms", started.elapsed().as_secs_f64() * 1000.0);
    Ok(())
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> ClientResult<T> + Send + 'static) -> ClientResult<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ClientError::Transport(anyhow!("file remote task failed: {}", e)))?
}

#[async_trait::async_trait]
impl ProjectClient for FileRemote {
    async fn fetch(&self) -> ClientResult<RemoteState> {
        let path = self.path.clone();
        blocking(move || read_document(&path)).await
    }

    async fn apply(&self, request: &UpdateRequest) -> ClientResult<RemoteState> {
        let path = self.path.clone();
        let req = request.clone();
        let (current, next) = blocking(move || Self::apply_locked(&path, &req)).await?;
        debug!(path = %self.path.display(), from = current.version, to = next.version, "file remote: batch applied");
        counter!("remote_apply_total", 1u64);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::UpdateAction;

    fn temp_path() -> PathBuf {
        let dir = std::env::temp_dir();
        let f = format!("keel-test-{}.json", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f)
    }

    #[tokio::test]
    async fn missing_document_is_not_found() {
        let r = FileRemote::new(temp_path());
        assert!(matches!(r.fetch().await, Err(ClientError::NotFound)));
    }

    #[tokio::test]
    async fn seed_apply_and_conflict() {
        let path = temp_path();
        let r = FileRemote::new(&path);
        r.seed(&RemoteState::new("shop", "Shop")).unwrap();
        assert!(r.seed(&RemoteState::new("shop", "Shop")).is_err());

        let req = UpdateRequest {
            expected_version: 1,
            actions: [UpdateAction::ChangeCountries { countries: vec!["NL".into(), "DE".into()] }].into_iter().collect(),
        };
        let next = r.apply(&req).await.unwrap();
        assert_eq!(next.version, 2);
        assert_eq!(r.fetch().await.unwrap().countries, vec!["NL".to_string(), "DE".to_string()]);

        assert!(matches!(r.apply(&req).await, Err(ClientError::VersionConflict { expected: 1, current: 2 })));
        assert_eq!(r.fetch().await.unwrap().version, 2);
        let _ = std::fs::remove_file(&path);
    }
}
