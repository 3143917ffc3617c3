//! Keel apply: turn a declared project configuration into the minimal batch of update
//! actions, submit it under optimistic concurrency and settle on the re-fetched record.
//!
//! Pipeline: [`detect`] → [`translate`] → [`compose`] → remote apply → re-fetch → [`project`].

#![forbid(unsafe_code)]

mod compose;
mod detect;
mod project;
mod reconcile;
mod translate;

pub use compose::compose;
pub use detect::{detect, field_changed};
pub use project::project;
pub use reconcile::{plan_against, Outcome, Phase, Plan, ReconcileOptions, ReconcileReport, Reconciler};
pub use translate::{resolve_shipping_rate_input, translate, translate_field};
