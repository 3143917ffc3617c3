#![forbid(unsafe_code)]

use std::sync::Arc;

use keel_apply::{plan_against, project, Outcome, ReconcileOptions, ReconcileReport, Reconciler};
use keel_core::{
    CartClassificationValue, DesiredState, ExternalOAuthDecl, KeelError, LocalizedString, RemoteState,
    ShippingRateInputDecl, ShippingRateInputType, UpdateAction, UpdateRequest,
};
use keel_remote::{ClientError, MemoryRemote, ProjectClient};

fn fresh_remote() -> Arc<MemoryRemote> { Arc::new(MemoryRemote::seeded(RemoteState::new("acctest", "Initial"))) }

fn reconciler(remote: &Arc<MemoryRemote>) -> Reconciler {
    Reconciler::with_options(remote.clone(), ReconcileOptions::default())
}

fn sizes() -> Vec<CartClassificationValue> {
    vec![
        CartClassificationValue::new("Small", LocalizedString::new().with("en", "Small").with("de", "Klein")),
        CartClassificationValue::new("Medium", LocalizedString::new().with("en", "Medium").with("de", "Mittel")),
        CartClassificationValue::new("Heavy", LocalizedString::new().with("en", "Heavy").with("de", "Schwergut")),
    ]
}

fn full_desired() -> DesiredState {
    DesiredState {
        name: Some("Test this thing".into()),
        currencies: vec!["EUR".into(), "USD".into()],
        countries: vec!["NL".into(), "DE".into(), "US".into()],
        languages: vec!["nl".into(), "de".into(), "en".into(), "en-US".into()],
        messages_enabled: true,
        external_oauth: Some(ExternalOAuthDecl::new("https://example.com/oauth/token", "Bearer secret")),
        shipping_rate_input_type: Some(ShippingRateInputDecl::new("CartValue")),
    }
}

fn settled(out: Outcome) -> ReconcileReport {
    match out {
        Outcome::Settled(r) => r,
        Outcome::NotFound => panic!("expected a settled cycle"),
    }
}

#[tokio::test]
async fn projected_remote_is_a_noop() {
    let remote = fresh_remote();
    let rec = reconciler(&remote);
    let first = settled(rec.reconcile(&full_desired(), None).await.unwrap());
    let applies = remote.apply_calls();

    let view = project(&first.state);
    let second = settled(rec.reconcile(&view, Some(first.state.version)).await.unwrap());
    assert!(!second.applied);
    assert!(second.actions.is_empty());
    assert_eq!(second.state, first.state);
    assert_eq!(remote.apply_calls(), applies);
}

#[tokio::test]
async fn applied_desired_state_round_trips() {
    let remote = fresh_remote();
    let mut desired = full_desired();
    desired.shipping_rate_input_type = Some(ShippingRateInputDecl::classification(sizes()));
    let report = settled(reconciler(&remote).reconcile(&desired, Some(1)).await.unwrap());
    assert_eq!(project(&report.state), desired);
}

#[tokio::test]
async fn one_successful_batch_bumps_version_once() {
    let remote = fresh_remote();
    let report = settled(reconciler(&remote).reconcile(&full_desired(), Some(1)).await.unwrap());
    assert!(report.applied);
    assert_eq!(report.previous_version, 1);
    assert_eq!(report.state.version, 2);
    assert_eq!(report.actions.len(), 7);
    assert_eq!(remote.apply_calls(), 1);
}

#[tokio::test]
async fn stale_request_is_a_conflict_and_changes_nothing() {
    let remote = fresh_remote();
    let plan_a = plan_against(&full_desired(), remote.fetch().await.unwrap()).unwrap();
    let mut other = full_desired();
    other.name = Some("Someone else".into());
    let plan_b = plan_against(&other, remote.fetch().await.unwrap()).unwrap();

    remote.apply(plan_a.request.as_ref().unwrap()).await.unwrap();
    let before = remote.snapshot().unwrap();
    let res = remote.apply(plan_b.request.as_ref().unwrap()).await;
    assert!(matches!(res, Err(ClientError::VersionConflict { expected: 1, current: 2 })));
    assert_eq!(remote.snapshot().unwrap(), before);
}

#[tokio::test]
async fn conflict_during_apply_surfaces_without_retry() {
    // Lets one out-of-band write land between our fetch and our apply.
    struct Racing {
        inner: Arc<MemoryRemote>,
    }

    #[async_trait::async_trait]
    impl ProjectClient for Racing {
        async fn fetch(&self) -> keel_remote::ClientResult<RemoteState> { self.inner.fetch().await }
        async fn apply(&self, request: &UpdateRequest) -> keel_remote::ClientResult<RemoteState> {
            self.inner.write_out_of_band(|s| s.countries.push("BE".into()))?;
            self.inner.apply(request).await
        }
    }

    let remote = fresh_remote();
    let rec = Reconciler::with_options(Arc::new(Racing { inner: remote.clone() }), ReconcileOptions::default());
    let err = rec.reconcile(&full_desired(), None).await.unwrap_err();
    assert!(matches!(err, KeelError::Conflict { expected: 1, current: 2 }));
    assert_eq!(remote.apply_calls(), 1);
    let st = remote.snapshot().unwrap();
    assert_eq!(st.name, "Initial");
    assert_eq!(st.countries, vec!["BE".to_string()]);
}

#[tokio::test]
async fn dropping_oauth_emits_a_single_clear() {
    let remote = fresh_remote();
    let rec = reconciler(&remote);
    let first = settled(rec.reconcile(&full_desired(), None).await.unwrap());

    let mut desired = full_desired();
    desired.external_oauth = None;
    let report = settled(rec.reconcile(&desired, Some(first.state.version)).await.unwrap());
    assert_eq!(report.actions.as_slice(), &[UpdateAction::SetExternalOAuth { external_oauth: None }]);
    assert!(report.state.external_oauth.is_none());
}

#[tokio::test]
async fn classification_resolves_in_order_and_bogus_is_rejected() {
    let remote = fresh_remote();
    let mut desired = project(&remote.snapshot().unwrap());
    desired.shipping_rate_input_type = Some(ShippingRateInputDecl::classification(sizes()));
    let plan = plan_against(&desired, remote.snapshot().unwrap()).unwrap();
    let actions = plan.request.unwrap().actions;
    assert_eq!(actions.len(), 1);
    match &actions[0] {
        UpdateAction::SetShippingRateInputType { shipping_rate_input_type: Some(ShippingRateInputType::CartClassification { values }) } => {
            assert_eq!(values.len(), 3);
            assert_eq!(values, &sizes());
        }
        other => panic!("unexpected action {:?}", other),
    }

    desired.shipping_rate_input_type = Some(ShippingRateInputDecl::new("Bogus"));
    let err = reconciler(&remote).reconcile(&desired, Some(1)).await.unwrap_err();
    match err {
        KeelError::UnsupportedVariant(tag) => assert_eq!(tag, "Bogus"),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(remote.apply_calls(), 0);
}

#[tokio::test]
async fn changing_only_the_name_yields_one_action() {
    let remote = fresh_remote();
    let rec = reconciler(&remote);
    let first = settled(rec.reconcile(&full_desired(), None).await.unwrap());

    let mut desired = project(&first.state);
    desired.name = Some("Test this thing new".into());
    let report = settled(rec.reconcile(&desired, Some(first.state.version)).await.unwrap());
    assert_eq!(report.actions.as_slice(), &[UpdateAction::ChangeName { name: "Test this thing new".into() }]);
}

#[tokio::test]
async fn offline_fetch_fails_the_cycle() {
    let remote = fresh_remote();
    remote.set_offline(true);
    let err = reconciler(&remote).reconcile(&full_desired(), None).await.unwrap_err();
    assert!(matches!(err, KeelError::Transport(_)));
}

#[tokio::test]
async fn remote_validation_errors_pass_through() {
    let remote = fresh_remote();
    let mut desired = full_desired();
    desired.external_oauth = Some(ExternalOAuthDecl::new("", "Bearer secret"));
    let err = reconciler(&remote).reconcile(&desired, None).await.unwrap_err();
    assert!(matches!(err, KeelError::Validation(_)), "got {:?}", err);
    assert_eq!(remote.snapshot().unwrap().version, 1);
}
