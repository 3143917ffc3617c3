//! Keel core types: the project settings model, field groups, update actions and errors.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Remote resource version. Starts at 1, +1 per applied batch.
pub type Version = u64;

/// Locale to text mapping. Equality ignores insertion order and iteration is sorted by locale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalizedString(pub BTreeMap<String, String>);

impl LocalizedString {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, locale: impl Into<String>, text: impl Into<String>) -> Self {
        self.0.insert(locale.into(), text.into());
        self
    }

    pub fn get(&self, locale: &str) -> Option<&str> { self.0.get(locale).map(String::as_str) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LocalizedString {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// One entry of a cart classification. List position is the display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartClassificationValue {
    pub key: String,
    #[serde(default)]
    pub label: LocalizedString,
}

impl CartClassificationValue {
    pub fn new(key: impl Into<String>, label: LocalizedString) -> Self {
        Self { key: key.into(), label }
    }
}

/// Resolved shipping rate input strategy as the remote stores it.
/// An unset strategy is `Option::None` on the owning record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ShippingRateInputType {
    CartValue,
    CartScore,
    CartClassification { values: Vec<CartClassificationValue> },
}

impl ShippingRateInputType {
    pub const CART_VALUE: &'static str = "CartValue";
    pub const CART_SCORE: &'static str = "CartScore";
    pub const CART_CLASSIFICATION: &'static str = "CartClassification";

    /// Discriminant as it appears on the wire and in configuration.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::CartValue => Self::CART_VALUE,
            Self::CartScore => Self::CART_SCORE,
            Self::CartClassification { .. } => Self::CART_CLASSIFICATION,
        }
    }

    /// Classification values; empty for payload-less strategies.
    pub fn values(&self) -> &[CartClassificationValue] {
        match self {
            Self::CartClassification { values } => values,
            Self::CartValue | Self::CartScore => &[],
        }
    }
}

/// External OAuth introspection endpoint, remote side. Both parts always set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalOAuth {
    pub url: String,
    pub authorization_header: String,
}

/// External OAuth block as declared. Parts are independently optional so a partial
/// block can be represented and rejected during translation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalOAuthDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_header: Option<String>,
}

impl ExternalOAuthDecl {
    pub fn new(url: impl Into<String>, authorization_header: impl Into<String>) -> Self {
        Self { url: Some(url.into()), authorization_header: Some(authorization_header.into()) }
    }

    /// True when every part is declared and equal to the live value.
    pub fn matches(&self, live: &ExternalOAuth) -> bool {
        self.url.as_deref() == Some(live.url.as_str())
            && self.authorization_header.as_deref() == Some(live.authorization_header.as_str())
    }
}

impl From<&ExternalOAuth> for ExternalOAuthDecl {
    fn from(v: &ExternalOAuth) -> Self {
        Self { url: Some(v.url.clone()), authorization_header: Some(v.authorization_header.clone()) }
    }
}

/// Shipping rate input type as declared: a free-form tag plus optional classification values.
/// The tag is resolved to [`ShippingRateInputType`] when actions are built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingRateInputDecl {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<CartClassificationValue>,
}

impl ShippingRateInputDecl {
    pub fn new(kind: impl Into<String>) -> Self { Self { kind: kind.into(), values: Vec::new() } }

    pub fn classification(values: Vec<CartClassificationValue>) -> Self {
        Self { kind: ShippingRateInputType::CART_CLASSIFICATION.to_string(), values }
    }
}

impl From<&ShippingRateInputType> for ShippingRateInputDecl {
    fn from(v: &ShippingRateInputType) -> Self {
        Self { kind: v.tag().to_string(), values: v.values().to_vec() }
    }
}

/// Declared configuration for the project settings singleton.
///
/// `name: None` leaves the remote name untouched. `external_oauth: None` and
/// `shipping_rate_input_type: None` mean "unset" and clear the remote value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub currencies: Vec<String>,
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub messages_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_oauth: Option<ExternalOAuthDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_rate_input_type: Option<ShippingRateInputDecl>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesConfiguration {
    pub enabled: bool,
}

/// Authoritative record returned by the remote system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteState {
    pub key: String,
    pub version: Version,
    pub name: String,
    #[serde(default)]
    pub currencies: Vec<String>,
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub messages: MessagesConfiguration,
    #[serde(default, rename = "externalOAuth", skip_serializing_if = "Option::is_none")]
    pub external_oauth: Option<ExternalOAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_rate_input_type: Option<ShippingRateInputType>,
}

impl RemoteState {
    /// Freshly provisioned project: version 1, everything else empty.
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: 1,
            name: name.into(),
            currencies: Vec::new(),
            countries: Vec::new(),
            languages: Vec::new(),
            messages: MessagesConfiguration::default(),
            external_oauth: None,
            shipping_rate_input_type: None,
        }
    }
}

/// Logical field groups. Declaration order is the batch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldId {
    Name,
    Currencies,
    Countries,
    Languages,
    Messages,
    #[serde(rename = "external_oauth")]
    ExternalOAuth,
    ShippingRateInputType,
}

impl FieldId {
    pub const ALL: [FieldId; 7] = [
        FieldId::Name,
        FieldId::Currencies,
        FieldId::Countries,
        FieldId::Languages,
        FieldId::Messages,
        FieldId::ExternalOAuth,
        FieldId::ShippingRateInputType,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldId::Name => "name",
            FieldId::Currencies => "currencies",
            FieldId::Countries => "countries",
            FieldId::Languages => "languages",
            FieldId::Messages => "messages",
            FieldId::ExternalOAuth => "external_oauth",
            FieldId::ShippingRateInputType => "shipping_rate_input_type",
        }
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Changed field groups, iterated in declaration order.
pub type ChangeSet = BTreeSet<FieldId>;

/// One typed mutation per field group, in the remote API's wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum UpdateAction {
    ChangeName { name: String },
    ChangeCurrencies { currencies: Vec<String> },
    ChangeCountries { countries: Vec<String> },
    ChangeLanguages { languages: Vec<String> },
    #[serde(rename = "changeMessagesEnabled", rename_all = "camelCase")]
    SetMessagesEnabled { messages_enabled: bool },
    #[serde(rename = "setExternalOAuth")]
    SetExternalOAuth {
        #[serde(rename = "externalOAuth")]
        external_oauth: Option<ExternalOAuth>,
    },
    #[serde(rename_all = "camelCase")]
    SetShippingRateInputType { shipping_rate_input_type: Option<ShippingRateInputType> },
}

impl UpdateAction {
    pub fn field(&self) -> FieldId {
        match self {
            UpdateAction::ChangeName { .. } => FieldId::Name,
            UpdateAction::ChangeCurrencies { .. } => FieldId::Currencies,
            UpdateAction::ChangeCountries { .. } => FieldId::Countries,
            UpdateAction::ChangeLanguages { .. } => FieldId::Languages,
            UpdateAction::SetMessagesEnabled { .. } => FieldId::Messages,
            UpdateAction::SetExternalOAuth { .. } => FieldId::ExternalOAuth,
            UpdateAction::SetShippingRateInputType { .. } => FieldId::ShippingRateInputType,
        }
    }

    /// Wire name of the action.
    pub fn name(&self) -> &'static str {
        match self {
            UpdateAction::ChangeName { .. } => "changeName",
            UpdateAction::ChangeCurrencies { .. } => "changeCurrencies",
            UpdateAction::ChangeCountries { .. } => "changeCountries",
            UpdateAction::ChangeLanguages { .. } => "changeLanguages",
            UpdateAction::SetMessagesEnabled { .. } => "changeMessagesEnabled",
            UpdateAction::SetExternalOAuth { .. } => "setExternalOAuth",
            UpdateAction::SetShippingRateInputType { .. } => "setShippingRateInputType",
        }
    }
}

/// At most one action per field group, so seven fit inline.
pub type Actions = SmallVec<[UpdateAction; 7]>;

/// A batch of actions stamped with the version the caller observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(rename = "version")]
    pub expected_version: Version,
    pub actions: Actions,
}

/// Error taxonomy surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum KeelError {
    #[error("not_found: project settings are not provisioned")]
    NotFound,
    #[error("conflict: expected version {expected}, remote is at {current}")]
    Conflict { expected: Version, current: Version },
    #[error("malformed_input: {field}: {reason}")]
    MalformedInput { field: String, reason: String },
    #[error("unsupported_variant: shipping rate input type {0:?} is not supported")]
    UnsupportedVariant(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error(transparent)]
    Transport(anyhow::Error),
}

impl KeelError {
    pub fn malformed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        KeelError::MalformedInput { field: field.into(), reason: reason.into() }
    }

    /// Short stable label, used for metrics and exit codes.
    pub fn kind(&self) -> &'static str {
        match self {
            KeelError::NotFound => "not_found",
            KeelError::Conflict { .. } => "conflict",
            KeelError::MalformedInput { .. } => "malformed_input",
            KeelError::UnsupportedVariant(_) => "unsupported_variant",
            KeelError::Validation(_) => "validation",
            KeelError::Transport(_) => "transport",
        }
    }
}

pub type KeelResult<T> = Result<T, KeelError>;

pub mod prelude {
    pub use super::{
        Actions, CartClassificationValue, ChangeSet, DesiredState, ExternalOAuth, ExternalOAuthDecl, FieldId,
        KeelError, KeelResult, LocalizedString, MessagesConfiguration, RemoteState, ShippingRateInputDecl,
        ShippingRateInputType, UpdateAction, UpdateRequest, Version,
    };
}
