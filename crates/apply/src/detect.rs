use keel_core::{ChangeSet, DesiredState, FieldId, RemoteState, ShippingRateInputType};

/// Field groups whose declared value differs from `baseline`. Pure.
pub fn detect(desired: &DesiredState, baseline: &RemoteState) -> ChangeSet {
    FieldId::ALL.into_iter().filter(|f| field_changed(*f, desired, baseline)).collect()
}

/// Field-appropriate comparison for one group.
///
/// Lists compare as ordered sequences. Optional blocks compare presence first, then contents;
/// an empty block is not the same as an absent one. The shipping rate input type compares the
/// tag, then the full ordered value list when it is a classification.
pub fn field_changed(field: FieldId, desired: &DesiredState, baseline: &RemoteState) -> bool {
    match field {
        // An undeclared name is unmanaged.
        FieldId::Name => desired.name.as_deref().is_some_and(|n| n != baseline.name),
        FieldId::Currencies => desired.currencies != baseline.currencies,
        FieldId::Countries => desired.countries != baseline.countries,
        FieldId::Languages => desired.languages != baseline.languages,
        FieldId::Messages => desired.messages_enabled != baseline.messages.enabled,
        FieldId::ExternalOAuth => match (&desired.external_oauth, &baseline.external_oauth) {
            (None, None) => false,
            (Some(want), Some(live)) => !want.matches(live),
            _ => true,
        },
        FieldId::ShippingRateInputType => {
            match (&desired.shipping_rate_input_type, &baseline.shipping_rate_input_type) {
                (None, None) => false,
                (Some(want), Some(live)) => {
                    if want.kind != live.tag() {
                        return true;
                    }
                    match live {
                        ShippingRateInputType::CartClassification { values } => want.values != *values,
                        ShippingRateInputType::CartValue | ShippingRateInputType::CartScore => false,
                    }
                }
                _ => true,
            }
        }
    }
}
