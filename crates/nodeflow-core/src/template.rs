//! Node configuration template and auth-field classification.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Field type marking an external authorization handshake.
pub const AUTH_FIELD_TYPE: &str = "auth";

/// Value the backend writes into an auth field when the link cannot be produced.
pub const AUTH_ERROR_SENTINEL: &str = "error";

/// A single field in a node template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputField {
    #[serde(rename = "type", default)]
    pub field_type: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl InputField {
    pub fn new(field_type: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            field_type: field_type.into(),
            value,
            extra: serde_json::Map::new(),
        }
    }

    pub fn auth(value: impl Into<String>) -> Self {
        Self::new(AUTH_FIELD_TYPE, serde_json::Value::String(value.into()))
    }

    pub fn is_auth(&self) -> bool {
        self.field_type == AUTH_FIELD_TYPE
    }

    /// The value as a string, empty for null and non-string values.
    pub fn value_str(&self) -> &str {
        self.value.as_str().unwrap_or("")
    }
}

/// The configuration object of a node, replaced wholesale on every mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTemplate {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub template: BTreeMap<String, InputField>,
    #[serde(default)]
    pub tool_mode: bool,
    /// Runtime version this node was last built with.
    #[serde(default, rename = "lf_version", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl NodeTemplate {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, field: InputField) -> Self {
        self.template.insert(key.into(), field);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Resolve the auth field: the named field when present, otherwise the
    /// first field whose type is `auth`.
    pub fn auth_field(&self, key: &str) -> Option<(&str, &InputField)> {
        if let Some((k, f)) = self.template.get_key_value(key) {
            return Some((k.as_str(), f));
        }
        self.template
            .iter()
            .find(|(_, f)| f.is_auth())
            .map(|(k, f)| (k.as_str(), f))
    }

    /// Classify the current value of the auth field.
    pub fn auth_value(&self, key: &str) -> AuthValue {
        self.auth_field(key)
            .map(|(_, f)| AuthValue::classify(&f.value))
            .unwrap_or(AuthValue::Empty)
    }
}

/// Semantic reading of an auth field's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthValue {
    Empty,
    AuthorizationUrl(String),
    Error,
    Connected(String),
}

fn url_scheme() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://\S+").expect("valid url regex"))
}

impl AuthValue {
    pub fn classify(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Empty,
            serde_json::Value::Bool(true) => Self::Connected("true".to_string()),
            serde_json::Value::Bool(false) => Self::Empty,
            serde_json::Value::String(s) => {
                let s = s.trim();
                if s.is_empty() {
                    Self::Empty
                } else if s == AUTH_ERROR_SENTINEL {
                    Self::Error
                } else if url_scheme().is_match(s) {
                    Self::AuthorizationUrl(s.to_string())
                } else {
                    Self::Connected(s.to_string())
                }
            }
            other => Self::Connected(other.to_string()),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::AuthorizationUrl(u) => Some(u),
            _ => None,
        }
    }

    /// The raw link string as shown on the connect affordance.
    pub fn link(&self) -> &str {
        match self {
            Self::Empty => "",
            Self::AuthorizationUrl(u) => u,
            Self::Error => AUTH_ERROR_SENTINEL,
            Self::Connected(v) => v,
        }
    }
}
