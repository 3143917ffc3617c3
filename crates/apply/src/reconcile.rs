use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use keel_core::{Actions, DesiredState, FieldId, KeelError, KeelResult, RemoteState, UpdateRequest, Version};
use keel_remote::{ClientError, ProjectClient};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{compose, detect, translate};

/// Reconciliation cycle states.
///
/// `Fetching → Applying → Settled`, `Fetching → Settled` when nothing changed,
/// `Fetching → NotFound`, and any non-terminal state `→ Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Fetching,
    Applying,
    Settled,
    NotFound,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool { matches!(self, Phase::Settled | Phase::NotFound | Phase::Failed) }

    pub fn can_transition_to(&self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Fetching, Phase::Applying)
                | (Phase::Fetching, Phase::Settled)
                | (Phase::Fetching, Phase::NotFound)
                | (Phase::Fetching, Phase::Failed)
                | (Phase::Applying, Phase::Settled)
                | (Phase::Applying, Phase::Failed)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Fetching => "FETCHING",
            Phase::Applying => "APPLYING",
            Phase::Settled => "SETTLED",
            Phase::NotFound => "NOT_FOUND",
            Phase::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Abort before submitting when the caller's baseline version is not the fetched one.
    pub preflight: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self { Self { preflight: true } }
}

impl ReconcileOptions {
    /// Preflight is on unless `KEEL_DISABLE_PREFLIGHT` is `1` or `true`.
    pub fn from_env() -> Self {
        let disabled = std::env::var("KEEL_DISABLE_PREFLIGHT")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self { preflight: !disabled }
    }
}

/// What a cycle would submit against the fetched record.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub remote: RemoteState,
    pub changed: Vec<FieldId>,
    /// `None` when the remote already matches.
    pub request: Option<UpdateRequest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    /// Canonical record at the end of the cycle; the baseline for the next one.
    pub state: RemoteState,
    pub actions: Actions,
    pub applied: bool,
    pub previous_version: Version,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Settled(ReconcileReport),
    /// The singleton is not provisioned upstream. The caller decides whether that is acceptable.
    NotFound,
}

/// Detect, translate and compose against an already fetched record.
pub fn plan_against(desired: &DesiredState, remote: RemoteState) -> KeelResult<Plan> {
    let changed = detect(desired, &remote);
    let actions = translate(desired, &changed)?;
    let request = if actions.is_empty() { None } else { Some(compose(actions, remote.version)?) };
    Ok(Plan { changed: changed.into_iter().collect(), request, remote })
}

/// Drives fetch → diff → apply → re-fetch against one remote.
pub struct Reconciler {
    client: Arc<dyn ProjectClient>,
    opts: ReconcileOptions,
}

impl Reconciler {
    pub fn new(client: Arc<dyn ProjectClient>) -> Self { Self::with_options(client, ReconcileOptions::from_env()) }

    pub fn with_options(client: Arc<dyn ProjectClient>, opts: ReconcileOptions) -> Self { Self { client, opts } }

    pub fn options(&self) -> ReconcileOptions { self.opts }

    /// Current record, `None` when not provisioned.
    pub async fn fetch(&self) -> KeelResult<Option<RemoteState>> {
        match self.client.fetch().await {
            Ok(st) => Ok(Some(st)),
            Err(ClientError::NotFound) => Ok(None),
            Err(e) => Err(map_client_err(e)),
        }
    }

    /// Dry run: what would be submitted right now. `None` when not provisioned.
    pub async fn plan(&self, desired: &DesiredState) -> KeelResult<Option<Plan>> {
        match self.fetch().await? {
            Some(remote) => plan_against(desired, remote).map(Some),
            None => Ok(None),
        }
    }

    /// Run one full cycle. Conflicts are surfaced, never retried here.
    pub async fn reconcile(&self, desired: &DesiredState, baseline_version: Option<Version>) -> KeelResult<Outcome> {
        let t0 = Instant::now();
        counter!("reconcile_attempts", 1u64);
        let res = self.run_cycle(desired, baseline_version).await;
        match &res {
            Ok(Outcome::Settled(report)) => {
                if report.applied { counter!("reconcile_ok", 1u64); } else { counter!("reconcile_noop", 1u64); }
                counter!("reconcile_actions", report.actions.len() as u64);
                histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                info!(
                    from = report.previous_version,
                    to = report.state.version,
                    actions = report.actions.len(),
                    took_ms = %t0.elapsed().as_millis(),
                    "reconcile: settled"
                );
            }
            Ok(Outcome::NotFound) => info!(took_ms = %t0.elapsed().as_millis(), "reconcile: project settings not provisioned"),
            Err(e) => {
                if matches!(e, KeelError::Conflict { .. }) { counter!("reconcile_conflict", 1u64); } else { counter!("reconcile_err", 1u64); }
                warn!(error = %e, kind = e.kind(), took_ms = %t0.elapsed().as_millis(), "reconcile: failed");
            }
        }
        res
    }

    async fn run_cycle(&self, desired: &DesiredState, baseline_version: Option<Version>) -> KeelResult<Outcome> {
        let mut cycle = Cycle::start();

        let remote = match self.client.fetch().await {
            Ok(st) => st,
            Err(ClientError::NotFound) => {
                cycle.advance(Phase::NotFound);
                return Ok(Outcome::NotFound);
            }
            Err(e) => return Err(cycle.fail(map_client_err(e))),
        };
        let previous_version = remote.version;

        let plan = match plan_against(desired, remote) {
            Ok(p) => p,
            Err(e) => return Err(cycle.fail(e)),
        };
        let Plan { remote, changed, request } = plan;
        let Some(request) = request else {
            cycle.advance(Phase::Settled);
            return Ok(Outcome::Settled(ReconcileReport { state: remote, actions: Actions::new(), applied: false, previous_version }));
        };
        debug!(changed = ?changed, version = request.expected_version, "reconcile: batch composed");

        if self.opts.preflight {
            if let Some(baseline) = baseline_version {
                if baseline != remote.version {
                    return Err(cycle.fail(KeelError::Conflict { expected: baseline, current: remote.version }));
                }
            }
        }

        cycle.advance(Phase::Applying);
        let applied = match self.client.apply(&request).await {
            Ok(st) => st,
            Err(e) => return Err(cycle.fail(map_client_err(e))),
        };
        if applied.version != request.expected_version + 1 {
            warn!(expected = request.expected_version + 1, got = applied.version, "reconcile: remote skipped versions on apply");
        }

        let fresh = match self.client.fetch().await {
            Ok(st) => st,
            Err(e) => return Err(cycle.fail(map_client_err(e))),
        };
        if fresh.version < applied.version {
            warn!(applied = applied.version, fetched = fresh.version, "reconcile: re-fetch returned an older version");
        }
        cycle.advance(Phase::Settled);
        Ok(Outcome::Settled(ReconcileReport { state: fresh, actions: request.actions, applied: true, previous_version }))
    }
}

/// Tracks the phase of one cycle and logs transitions.
struct Cycle {
    phase: Phase,
}

impl Cycle {
    fn start() -> Self {
        debug!(phase = %Phase::Fetching, "reconcile: cycle started");
        Self { phase: Phase::Fetching }
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(self.phase.can_transition_to(next), "invalid transition {} -> {}", self.phase, next);
        debug!(from = %self.phase, to = %next, "reconcile: phase");
        self.phase = next;
    }

    fn fail(&mut self, err: KeelError) -> KeelError {
        self.advance(Phase::Failed);
        err
    }
}

fn map_client_err(e: ClientError) -> KeelError {
    match e {
        ClientError::NotFound => KeelError::NotFound,
        ClientError::VersionConflict { expected, current } => KeelError::Conflict { expected, current },
        ClientError::Validation(msg) => KeelError::Validation(msg),
        ClientError::Transport(err) => KeelError::Transport(err),
    }
}
