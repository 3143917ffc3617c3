use std::collections::HashSet;

use keel_core::{
    Actions, ChangeSet, DesiredState, ExternalOAuth, ExternalOAuthDecl, FieldId, KeelError, KeelResult,
    ShippingRateInputDecl, ShippingRateInputType, UpdateAction,
};
use tracing::warn;

/// One action per changed field group, in field declaration order.
///
/// Deterministic for a given input; fields outside `changed` never produce an action.
pub fn translate(desired: &DesiredState, changed: &ChangeSet) -> KeelResult<Actions> {
    let mut out = Actions::new();
    for field in changed {
        out.push(translate_field(*field, desired)?);
    }
    Ok(out)
}

pub fn translate_field(field: FieldId, desired: &DesiredState) -> KeelResult<UpdateAction> {
    let action = match field {
        FieldId::Name => {
            let name = desired.name.clone().ok_or_else(|| KeelError::malformed("name", "cannot change name to an unset value"))?;
            UpdateAction::ChangeName { name }
        }
        FieldId::Currencies => UpdateAction::ChangeCurrencies { currencies: unique_list("currencies", &desired.currencies)? },
        FieldId::Countries => UpdateAction::ChangeCountries { countries: unique_list("countries", &desired.countries)? },
        FieldId::Languages => UpdateAction::ChangeLanguages { languages: unique_list("languages", &desired.languages)? },
        FieldId::Messages => UpdateAction::SetMessagesEnabled { messages_enabled: desired.messages_enabled },
        // Absent block clears the remote value; it is never skipped.
        FieldId::ExternalOAuth => UpdateAction::SetExternalOAuth {
            external_oauth: desired.external_oauth.as_ref().map(complete_oauth).transpose()?,
        },
        FieldId::ShippingRateInputType => UpdateAction::SetShippingRateInputType {
            shipping_rate_input_type: desired.shipping_rate_input_type.as_ref().map(resolve_shipping_rate_input).transpose()?,
        },
    };
    Ok(action)
}

/// Resolve a declared tag to the closed strategy type. Classification values keep input order.
pub fn resolve_shipping_rate_input(decl: &ShippingRateInputDecl) -> KeelResult<ShippingRateInputType> {
    let resolved = match decl.kind.as_str() {
        ShippingRateInputType::CART_VALUE => ShippingRateInputType::CartValue,
        ShippingRateInputType::CART_SCORE => ShippingRateInputType::CartScore,
        ShippingRateInputType::CART_CLASSIFICATION => {
            let mut seen = HashSet::new();
            for (i, v) in decl.values.iter().enumerate() {
                if v.key.is_empty() {
                    return Err(KeelError::malformed(format!("shipping_rate_input_type.values[{}].key", i), "must not be empty"));
                }
                if !seen.insert(v.key.as_str()) {
                    return Err(KeelError::malformed(
                        format!("shipping_rate_input_type.values[{}].key", i),
                        format!("duplicate key {:?}", v.key),
                    ));
                }
            }
            ShippingRateInputType::CartClassification { values: decl.values.clone() }
        }
        other => return Err(KeelError::UnsupportedVariant(other.to_string())),
    };
    if !decl.values.is_empty() && resolved.values().is_empty() {
        warn!(kind = %decl.kind, ignored = decl.values.len(), "values are only used by CartClassification");
    }
    Ok(resolved)
}

fn complete_oauth(decl: &ExternalOAuthDecl) -> KeelResult<ExternalOAuth> {
    match (&decl.url, &decl.authorization_header) {
        (Some(url), Some(header)) => Ok(ExternalOAuth { url: url.clone(), authorization_header: header.clone() }),
        (None, _) => Err(KeelError::malformed("external_oauth.url", "required together with authorization_header")),
        (_, None) => Err(KeelError::malformed("external_oauth.authorization_header", "required together with url")),
    }
}

fn unique_list(field: &str, items: &[String]) -> KeelResult<Vec<String>> {
    let mut seen = HashSet::new();
    for item in items {
        if !seen.insert(item.as_str()) {
            return Err(KeelError::malformed(field, format!("duplicate entry {:?}", item)));
        }
    }
    Ok(items.to_vec())
}
