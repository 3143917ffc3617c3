use keel_core::{DesiredState, ExternalOAuthDecl, RemoteState, ShippingRateInputDecl};

/// Map a remote record back into the declared shape. Inverse of the translation for every field.
pub fn project(remote: &RemoteState) -> DesiredState {
    DesiredState {
        name: Some(remote.name.clone()),
        currencies: remote.currencies.clone(),
        countries: remote.countries.clone(),
        languages: remote.languages.clone(),
        messages_enabled: remote.messages.enabled,
        external_oauth: remote.external_oauth.as_ref().map(ExternalOAuthDecl::from),
        shipping_rate_input_type: remote.shipping_rate_input_type.as_ref().map(ShippingRateInputDecl::from),
    }
}
