//! Merging base parameters, attachments and unwrapped secrets.
//!
//! The merged configuration is the only configuration form handed to the rest
//! of the client. It lives in RAM for one session, is never persisted, and its
//! values are zeroized when it is dropped.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::api::{ConfigRecord, SecretEnvelope, SecretRef};
use crate::error::Result;
use crate::keys::{Kem, Keyring};
use crate::value::ConfigValue;

/// Where wrapped secrets come from.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn fetch_secret(&self, reference: &SecretRef) -> Result<SecretEnvelope>;
}

/// Flat mapping from dotted path to value.
///
/// Writing a path replaces everything beneath it and any scalar above it, so
/// the map always describes a well-formed tree.
///
/// A `.` always separates path segments, the same as in attachment and secret
/// targets. A base key that itself contains a dot, such as `ssl.keystore`,
/// is therefore stored as the nested path `ssl` → `keystore`, and
/// [`to_nested`](Self::to_nested) renders it that way.
pub struct MergedConfiguration {
    name: String,
    entries: BTreeMap<String, ConfigValue>,
    secret_paths: BTreeSet<String>,
}

impl MergedConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
            secret_paths: BTreeSet::new(),
        }
    }

    /// Flatten a nested parameter map into dotted paths
    pub fn from_base(name: impl Into<String>, base: &BTreeMap<String, ConfigValue>) -> Self {
        let mut merged = Self::new(name);
        for (key, value) in base {
            if key.contains('.') {
                debug!("Key {:?} is read as a nested path", key);
            }
            flatten_into(key.clone(), value, &mut merged.entries);
        }
        merged
    }

    /// Data-stream name this configuration was built from
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, path: &str) -> Option<&ConfigValue> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Write `value` at `path`, returning the value it displaced there.
    pub fn insert(&mut self, path: &str, value: ConfigValue) -> Option<ConfigValue> {
        let prefix = format!("{}.", path);
        let descendants: Vec<String> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in descendants {
            self.discard(&key);
        }

        let mut end = 0;
        while let Some(offset) = path[end..].find('.') {
            end += offset;
            self.discard(&path[..end]);
            end += 1;
        }

        self.secret_paths.remove(path);
        self.entries.insert(path.to_string(), value)
    }

    /// Like [`insert`](Self::insert), marking the value as secret
    pub fn insert_secret(&mut self, path: &str, value: ConfigValue) -> Option<ConfigValue> {
        let previous = self.insert(path, value);
        self.secret_paths.insert(path.to_string());
        previous
    }

    fn discard(&mut self, path: &str) {
        if let Some(mut old) = self.entries.remove(path) {
            old.zeroize();
        }
        self.secret_paths.remove(path);
    }

    /// Whether the value at `path` came from an unwrapped secret
    pub fn is_secret(&self, path: &str) -> bool {
        self.secret_paths.contains(path)
    }

    pub fn secret_paths(&self) -> impl Iterator<Item = &str> {
        self.secret_paths.iter().map(String::as_str)
    }

    /// Everything below `prefix` as a nested object, e.g. one service block
    pub fn section(&self, prefix: &str) -> Option<ConfigValue> {
        let scoped = format!("{}.", prefix);
        let mut root = BTreeMap::new();
        for (key, value) in self.entries.range(scoped.clone()..) {
            let Some(rest) = key.strip_prefix(&scoped) else { break };
            place(&mut root, rest, value.clone());
        }
        if root.is_empty() {
            self.entries.get(prefix).cloned()
        } else {
            Some(ConfigValue::Object(root))
        }
    }

    /// The whole configuration as a nested object
    pub fn to_nested(&self) -> ConfigValue {
        let mut root = BTreeMap::new();
        for (key, value) in &self.entries {
            place(&mut root, key, value.clone());
        }
        ConfigValue::Object(root)
    }

    /// Nested form with every secret value replaced by a placeholder
    pub fn redacted(&self) -> ConfigValue {
        let mut root = BTreeMap::new();
        for (key, value) in &self.entries {
            let value = if self.is_secret(key) {
                ConfigValue::from("<redacted>")
            } else {
                value.clone()
            };
            place(&mut root, key, value);
        }
        ConfigValue::Object(root)
    }

    /// Top-level names, typically one per service
    pub fn services(&self) -> BTreeSet<String> {
        self.entries
            .keys()
            .map(|k| k.split('.').next().unwrap_or(k).to_string())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for MergedConfiguration {
    fn drop(&mut self) {
        // Keys are not sensitive
        for value in self.entries.values_mut() {
            value.zeroize();
        }
        self.entries.clear();
        self.secret_paths.clear();
    }
}

impl fmt::Debug for MergedConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergedConfiguration")
            .field("name", &self.name)
            .field("paths", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn flatten_into(path: String, value: &ConfigValue, entries: &mut BTreeMap<String, ConfigValue>) {
    if let ConfigValue::Object(map) = value {
        if let Some(dotted) = map.keys().find(|k| k.contains('.')) {
            debug!("Key {:?} under {} is read as a nested path", dotted, path);
        }
    }
    match value {
        ConfigValue::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                flatten_into(format!("{}.{}", path, key), child, entries);
            }
        }
        leaf => {
            entries.insert(path, leaf.clone());
        }
    }
}

fn place(root: &mut BTreeMap<String, ConfigValue>, path: &str, value: ConfigValue) {
    match path.split_once('.') {
        None => {
            root.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = root
                .entry(head.to_string())
                .or_insert_with(|| ConfigValue::Object(BTreeMap::new()));
            if !matches!(slot, ConfigValue::Object(_)) {
                *slot = ConfigValue::Object(BTreeMap::new());
            }
            if let ConfigValue::Object(children) = slot {
                place(children, rest, value);
            }
        }
    }
}

/// Build the merged configuration for `record`.
///
/// Attachments are applied first, then secrets in record order. When two
/// secrets share a target the later one wins and a warning is logged. Any
/// failure discards the partially merged map.
pub async fn assemble<S>(
    record: &ConfigRecord,
    source: &S,
    keyring: &Keyring,
    kem: Kem,
) -> Result<MergedConfiguration>
where
    S: SecretSource + ?Sized,
{
    let mut merged = MergedConfiguration::from_base(&record.name, &record.config);

    for attachment in &record.attachments {
        if merged
            .insert(&attachment.target, ConfigValue::Bytes(attachment.value.clone()))
            .is_some()
        {
            debug!("Attachment replaces base value at {}", attachment.target);
        }
    }

    let attachment_targets: HashSet<&str> =
        record.attachments.iter().map(|a| a.target.as_str()).collect();
    let mut secret_targets = HashSet::new();

    for reference in &record.secrets {
        if !secret_targets.insert(reference.target.as_str()) {
            warn!(
                "Secret {} targets {} which an earlier secret already set; the later value wins",
                reference.id, reference.target
            );
        } else if attachment_targets.contains(reference.target.as_str()) {
            debug!("Secret {} overrides attachment at {}", reference.id, reference.target);
        }

        let envelope = source.fetch_secret(reference).await?;
        // The envelope names the key it was actually wrapped for
        let fingerprint = envelope
            .fingerprint
            .as_deref()
            .or(reference.fingerprint.as_deref());
        let key = keyring.get(fingerprint)?;
        let plaintext = key.unwrap(&envelope.ciphertext()?, kem)?;

        merged.insert_secret(&reference.target, ConfigValue::Bytes(plaintext.to_vec()));
        debug!("Merged secret {} at {}", reference.id, reference.target);
    }

    Ok(merged)
}
