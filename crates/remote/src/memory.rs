use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use keel_core::{RemoteState, UpdateRequest};
use metrics::counter;
use tracing::debug;

use crate::{commit, ClientError, ClientResult, ProjectClient};

/// Authoritative in-process remote.
///
/// Holds at most one record, checks `expected_version` on every batch and applies batches
/// atomically. Call counters and an offline switch make it usable as a test double.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<Option<RemoteState>>,
    offline: AtomicBool,
    fetches: AtomicUsize,
    applies: AtomicUsize,
}

impl MemoryRemote {
    /// Remote with nothing provisioned yet; every fetch reports not found.
    pub fn new() -> Self { Self::default() }

    pub fn seeded(state: RemoteState) -> Self {
        Self { state: Mutex::new(Some(state)), ..Self::default() }
    }

    /// While offline every call fails with a transport error.
    pub fn set_offline(&self, offline: bool) { self.offline.store(offline, Ordering::SeqCst); }

    pub fn fetch_calls(&self) -> usize { self.fetches.load(Ordering::SeqCst) }
    pub fn apply_calls(&self) -> usize { self.applies.load(Ordering::SeqCst) }

    /// Current record, without counting as a fetch.
    pub fn snapshot(&self) -> Option<RemoteState> {
        self.state.lock().ok().and_then(|g| g.clone())
    }

    /// Mutate the record the way another writer would: the change lands and the version moves.
    pub fn write_out_of_band(&self, f: impl FnOnce(&mut RemoteState)) -> ClientResult<RemoteState> {
        let mut guard = self.lock()?;
        let st = guard.as_mut().ok_or(ClientError::NotFound)?;
        f(st);
        st.version += 1;
        Ok(st.clone())
    }

    fn lock(&self) -> ClientResult<MutexGuard<'_, Option<RemoteState>>> {
        self.state.lock().map_err(|_| ClientError::Transport(anyhow!("memory remote lock poisoned")))
    }

    fn ensure_online(&self, op: &str) -> ClientResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ClientError::Transport(anyhow!("{}: remote unreachable", op)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProjectClient for MemoryRemote {
    async fn fetch(&self) -> ClientResult<RemoteState> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.ensure_online("fetch")?;
        let guard = self.lock()?;
        guard.clone().ok_or(ClientError::NotFound)
    }

    async fn apply(&self, request: &UpdateRequest) -> ClientResult<RemoteState> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.ensure_online("apply")?;
        let mut guard = self.lock()?;
        let current = guard.as_ref().ok_or(ClientError::NotFound)?;
        let next = commit(current, request)?;
        debug!(from = current.version, to = next.version, actions = request.actions.len(), "memory remote: batch applied");
        *guard = Some(next.clone());
        counter!("remote_apply_total", 1u64);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::UpdateAction;

    fn rename(version: u64, name: &str) -> UpdateRequest {
        UpdateRequest { expected_version: version, actions: [UpdateAction::ChangeName { name: name.into() }].into_iter().collect() }
    }

    #[tokio::test]
    async fn unprovisioned_remote_reports_not_found() {
        let r = MemoryRemote::new();
        assert!(matches!(r.fetch().await, Err(ClientError::NotFound)));
        assert!(matches!(r.apply(&rename(1, "x")).await, Err(ClientError::NotFound)));
    }

    #[tokio::test]
    async fn stale_batch_leaves_state_unchanged() {
        let r = MemoryRemote::seeded(RemoteState::new("shop", "Shop"));
        r.apply(&rename(1, "First")).await.unwrap();
        let res = r.apply(&rename(1, "Second")).await;
        assert!(matches!(res, Err(ClientError::VersionConflict { expected: 1, current: 2 })));
        let st = r.snapshot().unwrap();
        assert_eq!(st.name, "First");
        assert_eq!(st.version, 2);
        assert_eq!(r.apply_calls(), 2);
    }

    #[tokio::test]
    async fn offline_remote_fails_with_transport() {
        let r = MemoryRemote::seeded(RemoteState::new("shop", "Shop"));
        r.set_offline(true);
        assert!(matches!(r.fetch().await, Err(ClientError::Transport(_))));
        r.set_offline(false);
        assert_eq!(r.fetch().await.unwrap().version, 1);
        assert_eq!(r.fetch_calls(), 2);
    }

    #[test]
    fn out_of_band_write_moves_version() {
        let r = MemoryRemote::seeded(RemoteState::new("shop", "Shop"));
        let st = r.write_out_of_band(|s| s.countries.push("DE".into())).unwrap();
        assert_eq!(st.version, 2);
        assert_eq!(r.snapshot().unwrap().countries, vec!["DE".to_string()]);
    }
}
