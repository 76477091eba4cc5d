//! Tagged configuration values.
//!
//! Config-server bodies are dynamic JSON. They are converted to [`ConfigValue`]
//! at the boundary; `Bytes` is added for attachment and secret values, which
//! never travel as text once decoded.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroize;

#[derive(Clone, PartialEq)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<ConfigValue>),
    Object(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Null => "null",
            ConfigValue::Bool(_) => "bool",
            ConfigValue::Number(_) => "number",
            ConfigValue::String(_) => "string",
            ConfigValue::Bytes(_) => "bytes",
            ConfigValue::Array(_) => "array",
            ConfigValue::Object(_) => "object",
        }
    }

    /// Text view. UTF-8 `Bytes` (e.g. a decrypted password) count as text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            ConfigValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ConfigValue::Bytes(b) => Some(b),
            ConfigValue::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Integer view; numeric strings are accepted since YAML-sourced configs often quote them.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Number(n) => n.as_i64(),
            ConfigValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().and_then(|v| u64::try_from(v).ok())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            ConfigValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" => Some(true),
                "false" | "no" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, ConfigValue>> {
        match self {
            ConfigValue::Object(map) => Some(map),
            _ => None,
        }
    }

    /// JSON rendering. `Bytes` become base64 strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ConfigValue::Null => serde_json::Value::Null,
            ConfigValue::Bool(b) => serde_json::Value::Bool(*b),
            ConfigValue::Number(n) => serde_json::Value::Number(n.clone()),
            ConfigValue::String(s) => serde_json::Value::String(s.clone()),
            ConfigValue::Bytes(b) => serde_json::Value::String(BASE64.encode(b)),
            ConfigValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(ConfigValue::to_json).collect())
            }
            ConfigValue::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for ConfigValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ConfigValue::Null,
            serde_json::Value::Bool(b) => ConfigValue::Bool(b),
            serde_json::Value::Number(n) => ConfigValue::Number(n),
            serde_json::Value::String(s) => ConfigValue::String(s),
            serde_json::Value::Array(items) => {
                ConfigValue::Array(items.into_iter().map(ConfigValue::from).collect())
            }
            serde_json::Value::Object(map) => ConfigValue::Object(
                map.into_iter().map(|(k, v)| (k, ConfigValue::from(v))).collect(),
            ),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::String(value.to_string())
    }
}

impl From<Vec<u8>> for ConfigValue {
    fn from(value: Vec<u8>) -> Self {
        ConfigValue::Bytes(value)
    }
}

impl Serialize for ConfigValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ConfigValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(ConfigValue::from)
    }
}

impl Zeroize for ConfigValue {
    fn zeroize(&mut self) {
        match self {
            ConfigValue::String(s) => s.zeroize(),
            ConfigValue::Bytes(b) => b.zeroize(),
            ConfigValue::Array(items) => items.iter_mut().for_each(Zeroize::zeroize),
            ConfigValue::Object(map) => map.values_mut().for_each(Zeroize::zeroize),
            _ => {}
        }
    }
}

// Byte values are usually secrets; keep them out of logs.
impl fmt::Debug for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Null => f.write_str("Null"),
            ConfigValue::Bool(b) => write!(f, "Bool({})", b),
            ConfigValue::Number(n) => write!(f, "Number({})", n),
            ConfigValue::String(s) => write!(f, "String({:?})", s),
            ConfigValue::Bytes(b) => write!(f, "Bytes(<{} bytes>)", b.len()),
            ConfigValue::Array(items) => f.debug_list().entries(items).finish(),
            ConfigValue::Object(map) => f.debug_map().entries(map).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_keeps_structure() {
        let value = ConfigValue::from(json!({
            "brokers": ["mqtt.example.org:8883"],
            "qos": 1,
            "tls": {"enabled": true},
            "client_id": null
        }));
        let map = value.as_object().unwrap();
        assert_eq!(map["qos"].as_i64(), Some(1));
        assert_eq!(map["tls"].as_object().unwrap()["enabled"].as_bool(), Some(true));
        assert_eq!(map["client_id"], ConfigValue::Null);
        assert_eq!(map["brokers"].type_name(), "array");
    }

    #[test]
    fn test_lenient_scalar_views() {
        assert_eq!(ConfigValue::from("10000").as_u64(), Some(10000));
        assert_eq!(ConfigValue::from("-1").as_u64(), None);
        assert_eq!(ConfigValue::from("yes").as_bool(), Some(true));
        assert_eq!(ConfigValue::from("maybe").as_bool(), None);
        assert_eq!(ConfigValue::Bytes(b"pw".to_vec()).as_str(), Some("pw"));
        assert_eq!(ConfigValue::Bytes(vec![0xff, 0xfe]).as_str(), None);
    }

    #[test]
    fn test_bytes_render_as_base64_and_hide_in_debug() {
        let value = ConfigValue::Bytes(b"secret".to_vec());
        assert_eq!(value.to_json(), json!("c2VjcmV0"));
        assert_eq!(format!("{:?}", value), "Bytes(<6 bytes>)");
        assert_eq!(serde_json::to_string(&value).unwrap(), "\"c2VjcmV0\"");
    }

    #[test]
    fn test_zeroize_clears_nested_values() {
        let mut value = ConfigValue::from(json!({"a": {"b": "text"}}));
        value.zeroize();
        let inner = &value.as_object().unwrap()["a"].as_object().unwrap()["b"];
        assert_eq!(inner.as_str(), Some(""));
    }
}
