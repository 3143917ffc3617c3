//! Keel public API façade (in-process).
//!
//! Lifecycle entry points a configuration front end drives for the project settings
//! singleton. The remote record always exists once provisioned and can never be removed,
//! so `create` adopts and converges it and `delete` only drops local bookkeeping.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use keel_apply::{project, Outcome, Plan, ReconcileOptions, Reconciler};
use keel_core::{DesiredState, KeelError, KeelResult, RemoteState, Version};
use keel_remote::{ProjectClient, RemoteConfig};
use keel_schema::ResourceSchema;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Local bookkeeping for an adopted project: identity, last seen version and the projected view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedProject {
    pub id: String,
    pub version: Version,
    pub view: DesiredState,
}

impl TrackedProject {
    pub fn from_remote(remote: &RemoteState) -> Self {
        Self { id: remote.key.clone(), version: remote.version, view: project(remote) }
    }
}

/// Lifecycle surface for the project settings resource.
#[async_trait::async_trait]
pub trait ProjectSettingsApi: Send + Sync {
    /// `false` when nothing is provisioned upstream.
    async fn exists(&self) -> KeelResult<bool>;

    /// Adopt the existing singleton and converge it onto `desired`.
    /// Returns `None` when the project is not provisioned upstream.
    async fn create(&self, desired: &DesiredState) -> KeelResult<Option<TrackedProject>>;

    async fn read(&self) -> KeelResult<Option<TrackedProject>>;

    /// Converge onto `desired`, requiring the remote to still be at `tracked.version`.
    async fn update(&self, desired: &DesiredState, tracked: &TrackedProject) -> KeelResult<TrackedProject>;

    /// Forget the project locally. Never contacts the remote.
    fn delete(&self, tracked: TrackedProject);

    /// Start tracking an existing project by key.
    async fn import(&self, id: &str) -> KeelResult<Option<TrackedProject>>;

    /// What `update`/`create` would submit right now.
    async fn plan(&self, desired: &DesiredState) -> KeelResult<Option<Plan>>;

    fn schema(&self) -> ResourceSchema;
}

/// In-process implementation driving a [`Reconciler`] directly.
pub struct InProcApi {
    reconciler: Reconciler,
}

impl InProcApi {
    pub fn new(client: Arc<dyn ProjectClient>) -> Self { Self { reconciler: Reconciler::new(client) } }

    pub fn with_options(client: Arc<dyn ProjectClient>, opts: ReconcileOptions) -> Self {
        Self { reconciler: Reconciler::with_options(client, opts) }
    }

    /// File-backed remote at the configured path.
    pub fn from_config(cfg: &RemoteConfig) -> Self { Self::new(keel_remote::connect(cfg)) }

    pub fn reconciler(&self) -> &Reconciler { &self.reconciler }
}

#[async_trait::async_trait]
impl ProjectSettingsApi for InProcApi {
    async fn exists(&self) -> KeelResult<bool> {
        Ok(self.reconciler.fetch().await?.is_some())
    }

    async fn create(&self, desired: &DesiredState) -> KeelResult<Option<TrackedProject>> {
        let t0 = Instant::now();
        info!("api: create start");
        match self.reconciler.reconcile(desired, None).await? {
            Outcome::Settled(report) => {
                let tracked = TrackedProject::from_remote(&report.state);
                info!(id = %tracked.id, version = tracked.version, actions = report.actions.len(), took_ms = %t0.elapsed().as_millis(), "api: create ok");
                Ok(Some(tracked))
            }
            Outcome::NotFound => {
                info!(took_ms = %t0.elapsed().as_millis(), "api: create found nothing to adopt");
                Ok(None)
            }
        }
    }

    async fn read(&self) -> KeelResult<Option<TrackedProject>> {
        let t0 = Instant::now();
        let res = self.reconciler.fetch().await?.map(|st| TrackedProject::from_remote(&st));
        info!(found = res.is_some(), took_ms = %t0.elapsed().as_millis(), "api: read done");
        Ok(res)
    }

    async fn update(&self, desired: &DesiredState, tracked: &TrackedProject) -> KeelResult<TrackedProject> {
        let t0 = Instant::now();
        info!(id = %tracked.id, version = tracked.version, "api: update start");
        match self.reconciler.reconcile(desired, Some(tracked.version)).await? {
            Outcome::Settled(report) => {
                let next = TrackedProject::from_remote(&report.state);
                info!(id = %next.id, version = next.version, took_ms = %t0.elapsed().as_millis(), "api: update ok");
                Ok(next)
            }
            // Tracked project vanished upstream.
            Outcome::NotFound => Err(KeelError::NotFound),
        }
    }

    fn delete(&self, tracked: TrackedProject) {
        counter!("api_detach_total", 1u64);
        info!(id = %tracked.id, version = tracked.version, "api: delete detaches local tracking only");
    }

    async fn import(&self, id: &str) -> KeelResult<Option<TrackedProject>> {
        let Some(tracked) = self.read().await? else { return Ok(None) };
        if tracked.id != id {
            return Err(KeelError::malformed("id", format!("{:?} does not match project key {:?}", id, tracked.id)));
        }
        Ok(Some(tracked))
    }

    async fn plan(&self, desired: &DesiredState) -> KeelResult<Option<Plan>> {
        self.reconciler.plan(desired).await
    }

    fn schema(&self) -> ResourceSchema { keel_schema::resource_schema() }
}
