//! Keel remote: the fetch/apply boundary and the remotes that sit behind it.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use keel_core::{RemoteState, UpdateAction, UpdateRequest, Version};

mod file;
mod memory;

pub use file::FileRemote;
pub use memory::MemoryRemote;

/// Failures reported by a remote. Transport failures are opaque.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("project settings not found")]
    NotFound,
    #[error("version conflict: expected {expected}, current {current}")]
    VersionConflict { expected: Version, current: Version },
    #[error("rejected: {0}")]
    Validation(String),
    #[error(transparent)]
    Transport(anyhow::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Read and write access to the project settings singleton.
#[async_trait::async_trait]
pub trait ProjectClient: Send + Sync {
    /// Side-effect free read of the current record.
    async fn fetch(&self) -> ClientResult<RemoteState>;

    /// Apply every action of the batch or none of them. Returns the updated record.
    async fn apply(&self, request: &UpdateRequest) -> ClientResult<RemoteState>;
}

/// Compute the record that results from applying `request` on top of `current`.
///
/// Rejects stale versions and invalid actions without touching `current`; on success the
/// returned record carries `current.version + 1`.
pub fn commit(current: &RemoteState, request: &UpdateRequest) -> ClientResult<RemoteState> {
    if request.expected_version != current.version {
        return Err(ClientError::VersionConflict { expected: request.expected_version, current: current.version });
    }
    if request.actions.is_empty() {
        return Err(ClientError::Validation("update request carries no actions".into()));
    }
    let mut next = current.clone();
    apply_actions(&mut next, &request.actions)?;
    next.version = current.version + 1;
    Ok(next)
}

/// Remote-side semantics of each action, including the checks the remote enforces.
pub fn apply_actions(state: &mut RemoteState, actions: &[UpdateAction]) -> ClientResult<()> {
    for action in actions {
        match action {
            UpdateAction::ChangeName { name } => {
                if name.trim().is_empty() {
                    return Err(ClientError::Validation("changeName: name must not be empty".into()));
                }
                state.name = name.clone();
            }
            UpdateAction::ChangeCurrencies { currencies } => {
                ensure_unique("changeCurrencies", currencies.iter().map(String::as_str))?;
                state.currencies = currencies.clone();
            }
            UpdateAction::ChangeCountries { countries } => {
                ensure_unique("changeCountries", countries.iter().map(String::as_str))?;
                state.countries = countries.clone();
            }
            UpdateAction::ChangeLanguages { languages } => {
                ensure_unique("changeLanguages", languages.iter().map(String::as_str))?;
                state.languages = languages.clone();
            }
            UpdateAction::SetMessagesEnabled { messages_enabled } => {
                state.messages.enabled = *messages_enabled;
            }
            UpdateAction::SetExternalOAuth { external_oauth } => {
                if let Some(oauth) = external_oauth {
                    if oauth.url.trim().is_empty() {
                        return Err(ClientError::Validation("setExternalOAuth: url must not be empty".into()));
                    }
                }
                state.external_oauth = external_oauth.clone();
            }
            UpdateAction::SetShippingRateInputType { shipping_rate_input_type } => {
                if let Some(srit) = shipping_rate_input_type {
                    if srit.values().iter().any(|v| v.key.is_empty()) {
                        return Err(ClientError::Validation("setShippingRateInputType: empty classification key".into()));
                    }
                    ensure_unique("setShippingRateInputType", srit.values().iter().map(|v| v.key.as_str()))?;
                }
                state.shipping_rate_input_type = shipping_rate_input_type.clone();
            }
        }
    }
    Ok(())
}

fn ensure_unique<'a>(action: &str, items: impl Iterator<Item = &'a str>) -> ClientResult<()> {
    let mut seen = HashSet::new();
    for item in items {
        if !seen.insert(item) {
            return Err(ClientError::Validation(format!("{}: duplicate entry {:?}", action, item)));
        }
    }
    Ok(())
}

/// Where the file-backed remote keeps its document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub path: PathBuf,
}

impl RemoteConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    /// `KEEL_REMOTE_PATH`, falling back to `~/.keel/project.json`.
    pub fn from_env() -> Self {
        let path = std::env::var_os("KEEL_REMOTE_PATH").map(PathBuf::from).unwrap_or_else(default_remote_path);
        Self { path }
    }
}

fn default_remote_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".keel");
        p.push("project.json");
        return p;
    }
    PathBuf::from("project.json")
}

/// Build the client for a configured remote.
pub fn connect(cfg: &RemoteConfig) -> Arc<dyn ProjectClient> {
    Arc::new(FileRemote::new(cfg.path.clone()))
}
