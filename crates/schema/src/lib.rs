//! Keel schema: the declared field schema of the project settings resource and the config
//! layer that turns YAML/JSON documents into [`DesiredState`].
//!
//! Loose front-end representations (string booleans, nulls) are normalized here so the
//! reconciliation core only ever sees typed values.

#![forbid(unsafe_code)]

use std::collections::HashSet;

use keel_core::{
    CartClassificationValue, DesiredState, ExternalOAuthDecl, KeelError, KeelResult, LocalizedString, ShippingRateInputDecl,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value as Json};
use tracing::debug;

const DOCUMENT: &str = "<document>";
const VALUES_PATH: &str = "shipping_rate_input_type.values[]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Int,
    Bool,
    StringList,
    LocalizedString,
    Block,
    BlockList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Optional,
    /// Required whenever the enclosing block is present.
    Required,
    /// Must be set together with its siblings.
    RequiredTogether,
    /// Set by the remote; never declared.
    Computed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub path: &'static str,
    pub kind: ValueKind,
    pub presence: Presence,
    pub description: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceSchema {
    pub resource: &'static str,
    pub fields: Vec<FieldSpec>,
}

impl ResourceSchema {
    pub fn field(&self, path: &str) -> Option<&FieldSpec> { self.fields.iter().find(|f| f.path == path) }

    /// Direct children of `prefix` (top level for `""`).
    pub fn children<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a FieldSpec> + 'a {
        self.fields.iter().filter(move |f| {
            let rest = if prefix.is_empty() { Some(f.path) } else { f.path.strip_prefix(prefix).and_then(|r| r.strip_prefix('.')) };
            rest.is_some_and(|r| !r.contains('.'))
        })
    }
}

/// Declared schema of the project settings resource.
pub fn resource_schema() -> ResourceSchema {
    use Presence as P;
    use ValueKind as K;
    let f = |path, kind, presence, description| FieldSpec { path, kind, presence, description };
    ResourceSchema {
        resource: "project_settings",
        fields: vec![
            f("key", K::String, P::Computed, "Project key; identity of the singleton"),
            f("version", K::Int, P::Computed, "Remote version used for optimistic concurrency"),
            f("name", K::String, P::Optional, "Project display name; left untouched when omitted"),
            f("currencies", K::StringList, P::Optional, "ISO 4217 currency codes, ordered"),
            f("countries", K::StringList, P::Optional, "ISO 3166-1 alpha-2 country codes, ordered"),
            f("languages", K::StringList, P::Optional, "IETF language tags, ordered"),
            f("messages", K::Block, P::Optional, "Message configuration"),
            f("messages.enabled", K::Bool, P::Required, "Whether messages are emitted"),
            f("external_oauth", K::Block, P::Optional, "External OAuth token introspection; cleared when omitted"),
            f("external_oauth.url", K::String, P::RequiredTogether, "Introspection endpoint URL"),
            f("external_oauth.authorization_header", K::String, P::RequiredTogether, "Authorization header sent to the endpoint"),
            f("shipping_rate_input_type", K::Block, P::Optional, "Shipping rate input strategy; cleared when omitted"),
            f("shipping_rate_input_type.type", K::String, P::Required, "CartValue, CartScore or CartClassification"),
            f("shipping_rate_input_type.values", K::BlockList, P::Optional, "Classification values in display order"),
            f("shipping_rate_input_type.values[].key", K::String, P::Required, "Classification key, unique within the list"),
            f("shipping_rate_input_type.values[].label", K::LocalizedString, P::Optional, "Label per locale"),
        ],
    }
}

static CURRENCY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{3}$").expect("currency regex"));
static COUNTRY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{2}$").expect("country regex"));
static LANGUAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z]{2,3}(-[A-Za-z0-9]{2,8})*$").expect("language regex"));

fn max_config_bytes() -> usize {
    std::env::var("KEEL_MAX_CONFIG_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1 << 20) // 1 MiB default
}

fn max_config_nodes() -> usize {
    std::env::var("KEEL_MAX_CONFIG_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

/// True when `v` has more than `max` nodes. The walk stops once the count passes `max`.
fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur > max { return; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur > max { return; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count > max
}

/// Parse a YAML (or JSON) config document.
pub fn decode_yaml(doc: &str) -> KeelResult<DesiredState> {
    if doc.len() > max_config_bytes() {
        return Err(KeelError::malformed(DOCUMENT, format!("config too large (>{} bytes)", max_config_bytes())));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(doc).map_err(|e| KeelError::malformed(DOCUMENT, format!("parsing YAML: {}", e)))?;
    let json = serde_json::to_value(val).map_err(|e| KeelError::malformed(DOCUMENT, format!("converting YAML to JSON: {}", e)))?;
    decode_value(&json)
}

/// Decode a config value. Nulls count as absent.
pub fn decode_value(v: &Json) -> KeelResult<DesiredState> {
    if json_node_budget_exceeded(v, max_config_nodes()) {
        return Err(KeelError::malformed(DOCUMENT, format!("config too complex (>{} nodes)", max_config_nodes())));
    }
    let schema = resource_schema();
    let obj = v.as_object().ok_or_else(|| KeelError::malformed(DOCUMENT, "expected a mapping at the top level"))?;
    check_keys(&schema, obj, "")?;

    let desired = DesiredState {
        name: opt_string(obj, "name", "name")?,
        currencies: code_list(obj, "currencies", &CURRENCY, "an ISO 4217 code like EUR")?,
        countries: code_list(obj, "countries", &COUNTRY, "an ISO 3166-1 alpha-2 code like DE")?,
        languages: code_list(obj, "languages", &LANGUAGE, "a language tag like en or en-US")?,
        messages_enabled: messages_enabled(&schema, obj)?,
        external_oauth: external_oauth(&schema, obj)?,
        shipping_rate_input_type: shipping_rate_input(&schema, obj)?,
    };
    debug!(fields = obj.len(), "schema: config decoded");
    Ok(desired)
}

/// Config document for a desired state, the inverse of [`decode_value`].
pub fn encode_value(d: &DesiredState) -> Json {
    let mut out = Map::new();
    if let Some(name) = &d.name {
        out.insert("name".into(), Json::String(name.clone()));
    }
    out.insert("currencies".into(), serde_json::json!(d.currencies));
    out.insert("countries".into(), serde_json::json!(d.countries));
    out.insert("languages".into(), serde_json::json!(d.languages));
    out.insert("messages".into(), serde_json::json!({ "enabled": d.messages_enabled }));
    if let Some(oauth) = &d.external_oauth {
        let mut block = Map::new();
        if let Some(url) = &oauth.url { block.insert("url".into(), Json::String(url.clone())); }
        if let Some(h) = &oauth.authorization_header { block.insert("authorization_header".into(), Json::String(h.clone())); }
        out.insert("external_oauth".into(), Json::Object(block));
    }
    if let Some(srit) = &d.shipping_rate_input_type {
        let mut block = Map::new();
        block.insert("type".into(), Json::String(srit.kind.clone()));
        if !srit.values.is_empty() {
            let values: Vec<Json> = srit.values.iter().map(|v| serde_json::json!({ "key": v.key, "label": v.label })).collect();
            block.insert("values".into(), Json::Array(values));
        }
        out.insert("shipping_rate_input_type".into(), Json::Object(block));
    }
    Json::Object(out)
}

fn check_keys(schema: &ResourceSchema, obj: &Map<String, Json>, prefix: &str) -> KeelResult<()> {
    for key in obj.keys() {
        let path = if prefix.is_empty() { key.clone() } else { format!("{}.{}", prefix, key) };
        match schema.children(prefix).find(|f| f.path == path) {
            Some(spec) if spec.presence == Presence::Computed => {
                return Err(KeelError::malformed(path, "is computed by the remote and cannot be set"));
            }
            Some(_) => {}
            None => return Err(KeelError::malformed(path, "unknown field")),
        }
    }
    Ok(())
}

fn present<'a>(obj: &'a Map<String, Json>, key: &str) -> Option<&'a Json> {
    obj.get(key).filter(|v| !v.is_null())
}

fn opt_string(obj: &Map<String, Json>, key: &str, path: &str) -> KeelResult<Option<String>> {
    match present(obj, key) {
        None => Ok(None),
        Some(Json::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(KeelError::malformed(path, format!("expected a string, got {}", other))),
    }
}

fn code_list(obj: &Map<String, Json>, key: &str, shape: &Regex, expect: &str) -> KeelResult<Vec<String>> {
    let items = match present(obj, key) {
        None => return Ok(Vec::new()),
        Some(Json::Array(items)) => items,
        Some(other) => return Err(KeelError::malformed(key, format!("expected a list, got {}", other))),
    };
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let path = format!("{}[{}]", key, i);
        let s = item.as_str().ok_or_else(|| KeelError::malformed(&path, format!("expected a string, got {}", item)))?;
        if !shape.is_match(s) {
            return Err(KeelError::malformed(&path, format!("{:?} is not {}", s, expect)));
        }
        if !seen.insert(s) {
            return Err(KeelError::malformed(&path, format!("duplicate entry {:?}", s)));
        }
        out.push(s.to_string());
    }
    Ok(out)
}

fn block<'a>(obj: &'a Map<String, Json>, key: &str) -> KeelResult<Option<&'a Map<String, Json>>> {
    match present(obj, key) {
        None => Ok(None),
        Some(Json::Object(m)) => Ok(Some(m)),
        Some(other) => Err(KeelError::malformed(key, format!("expected a block, got {}", other))),
    }
}

fn messages_enabled(schema: &ResourceSchema, obj: &Map<String, Json>) -> KeelResult<bool> {
    let Some(m) = block(obj, "messages")? else { return Ok(false) };
    check_keys(schema, m, "messages")?;
    match present(m, "enabled") {
        None => Err(KeelError::malformed("messages.enabled", "required when messages is set")),
        Some(v) => coerce_bool(v).ok_or_else(|| KeelError::malformed("messages.enabled", format!("expected a boolean, got {}", v))),
    }
}

/// Booleans as the config layer accepts them: native, or `"1"`/`"0"`/`"true"`/`"false"`.
pub fn coerce_bool(v: &Json) -> Option<bool> {
    match v {
        Json::Bool(b) => Some(*b),
        Json::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        },
        Json::Number(n) => match n.as_u64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn external_oauth(schema: &ResourceSchema, obj: &Map<String, Json>) -> KeelResult<Option<ExternalOAuthDecl>> {
    let Some(m) = block(obj, "external_oauth")? else { return Ok(None) };
    check_keys(schema, m, "external_oauth")?;
    // Partial blocks pass through; completeness is enforced when actions are built.
    Ok(Some(ExternalOAuthDecl {
        url: opt_string(m, "url", "external_oauth.url")?,
        authorization_header: opt_string(m, "authorization_header", "external_oauth.authorization_header")?,
    }))
}

fn shipping_rate_input(schema: &ResourceSchema, obj: &Map<String, Json>) -> KeelResult<Option<ShippingRateInputDecl>> {
    let Some(m) = block(obj, "shipping_rate_input_type")? else { return Ok(None) };
    check_keys(schema, m, "shipping_rate_input_type")?;
    let kind = opt_string(m, "type", "shipping_rate_input_type.type")?
        .ok_or_else(|| KeelError::malformed("shipping_rate_input_type.type", "required when shipping_rate_input_type is set"))?;
    let items = match present(m, "values") {
        None => Vec::new(),
        Some(Json::Array(items)) => items.clone(),
        Some(other) => return Err(KeelError::malformed("shipping_rate_input_type.values", format!("expected a list, got {}", other))),
    };
    let mut seen = HashSet::new();
    let mut values = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let path = format!("shipping_rate_input_type.values[{}]", i);
        let entry = item.as_object().ok_or_else(|| KeelError::malformed(&path, format!("expected a block, got {}", item)))?;
        check_keys(schema, entry, VALUES_PATH).map_err(|e| match e {
            KeelError::MalformedInput { field, reason } => {
                KeelError::malformed(field.replacen(VALUES_PATH, &path, 1), reason)
            }
            other => other,
        })?;
        let key = opt_string(entry, "key", &format!("{}.key", path))?
            .ok_or_else(|| KeelError::malformed(format!("{}.key", path), "required"))?;
        if !seen.insert(key.clone()) {
            return Err(KeelError::malformed(format!("{}.key", path), format!("duplicate key {:?}", key)));
        }
        let label = match present(entry, "label") {
            None => LocalizedString::new(),
            Some(Json::Object(l)) => {
                let mut out = LocalizedString::new();
                for (locale, text) in l {
                    let text = text
                        .as_str()
                        .ok_or_else(|| KeelError::malformed(format!("{}.label.{}", path, locale), "expected a string"))?;
                    out = out.with(locale.clone(), text);
                }
                out
            }
            Some(other) => return Err(KeelError::malformed(format!("{}.label", path), format!("expected a locale map, got {}", other))),
        };
        values.push(CartClassificationValue { key, label });
    }
    Ok(Some(ShippingRateInputDecl { kind, values }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREATE: &str = r#"
name: Test this thing
countries: [NL, DE, US]
currencies: [EUR, USD]
languages: [nl, de, en, en-US]
external_oauth:
  url: https://example.com/oauth/token
  authorization_header: Bearer secret
messages:
  enabled: true
shipping_rate_input_type:
  type: CartValue
"#;

    const UPDATE: &str = r#"
name: Test this thing new
countries: [NL, DE, US, GB]
currencies: [EUR, USD, GBP]
languages: [nl, de, en, en-US, fr]
messages:
  enabled: "0"
shipping_rate_input_type:
  type: CartClassification
  values:
    - key: Small
      label: { en: Small, de: Klein }
    - key: Medium
      label: { en: Medium, de: Mittel }
    - key: Heavy
      label: { en: Heavy, de: Schwergut }
"#;

    #[test]
    fn decodes_full_config() {
        let d = decode_yaml(CREATE).unwrap();
        assert_eq!(d.name.as_deref(), Some("Test this thing"));
        assert_eq!(d.countries.len(), 3);
        assert_eq!(d.languages.len(), 4);
        assert!(d.messages_enabled);
        assert_eq!(d.external_oauth, Some(ExternalOAuthDecl::new("https://example.com/oauth/token", "Bearer secret")));
        assert_eq!(d.shipping_rate_input_type, Some(ShippingRateInputDecl::new("CartValue")));
    }

    #[test]
    fn classification_values_keep_order_and_string_bool_is_coerced() {
        let d = decode_yaml(UPDATE).unwrap();
        assert!(!d.messages_enabled);
        assert!(d.external_oauth.is_none());
        let srit = d.shipping_rate_input_type.unwrap();
        let keys: Vec<_> = srit.values.iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["Small", "Medium", "Heavy"]);
        assert_eq!(srit.values[2].label.get("de"), Some("Schwergut"));
    }

    #[test]
    fn encode_then_decode_is_identity() {
        let d = decode_yaml(UPDATE).unwrap();
        assert_eq!(decode_value(&encode_value(&d)).unwrap(), d);
    }

    #[test]
    fn rejects_unknown_and_computed_fields() {
        match decode_yaml("nmae: typo\n") {
            Err(KeelError::MalformedInput { field, reason }) => {
                assert_eq!(field, "nmae");
                assert!(reason.contains("unknown"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        match decode_yaml("version: 3\n") {
            Err(KeelError::MalformedInput { field, .. }) => assert_eq!(field, "version"),
            other => panic!("unexpected: {:?}", other),
        }
        match decode_yaml("shipping_rate_input_type:\n  type: CartClassification\n  values:\n    - key: a\n      lable: {}\n") {
            Err(KeelError::MalformedInput { field, .. }) => assert_eq!(field, "shipping_rate_input_type.values[0].lable"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn checks_code_shapes_and_duplicates() {
        match decode_yaml("currencies: [EUR, eur]\n") {
            Err(KeelError::MalformedInput { field, .. }) => assert_eq!(field, "currencies[1]"),
            other => panic!("unexpected: {:?}", other),
        }
        match decode_yaml("countries: [DE, NL, DE]\n") {
            Err(KeelError::MalformedInput { field, reason }) => {
                assert_eq!(field, "countries[2]");
                assert!(reason.contains("duplicate"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(decode_yaml("languages: [en, en-US, zh-Hans, de-CH]\n").is_ok());
    }

    #[test]
    fn leaves_variant_and_oauth_completeness_to_translation() {
        let d = decode_yaml("shipping_rate_input_type:\n  type: Bogus\nexternal_oauth:\n  url: https://example.com\n").unwrap();
        assert_eq!(d.shipping_rate_input_type.unwrap().kind, "Bogus");
        assert_eq!(d.external_oauth.unwrap().authorization_header, None);
    }

    #[test]
    fn absent_blocks_have_defaults() {
        let d = decode_yaml("{}").unwrap();
        assert_eq!(d, DesiredState::default());
        assert!(matches!(decode_yaml("messages: {}\n"), Err(KeelError::MalformedInput { .. })));
        assert!(matches!(decode_yaml("messages: { enabled: maybe }\n"), Err(KeelError::MalformedInput { .. })));
    }

    #[test]
    fn schema_lists_declared_fields() {
        let s = resource_schema();
        assert_eq!(s.field("version").unwrap().presence, Presence::Computed);
        assert_eq!(s.field("external_oauth.url").unwrap().presence, Presence::RequiredTogether);
        let top: Vec<_> = s.children("").map(|f| f.path).collect();
        assert_eq!(
            top,
            vec!["key", "version", "name", "currencies", "countries", "languages", "messages", "external_oauth", "shipping_rate_input_type"]
        );
        let nested: Vec<_> = s.children(VALUES_PATH).map(|f| f.path).collect();
        assert_eq!(nested, vec!["shipping_rate_input_type.values[].key", "shipping_rate_input_type.values[].label"]);
    }

    #[test]
    fn node_budget_admits_exactly_max() {
        // Four nodes: the object, the name, the list and its entry.
        let v = serde_json::json!({ "name": "Shop", "currencies": ["EUR"] });
        assert!(!json_node_budget_exceeded(&v, 4));
        assert!(json_node_budget_exceeded(&v, 3));
        assert!(json_node_budget_exceeded(&serde_json::json!([1, 2, 3, 4, 5]), 1));
    }
}
