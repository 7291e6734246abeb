//! Persisted session settings.
//!
//! The settings blob is a tree of [`SettingValue`]s. It is written as JSON in
//! which every binary value is wrapped as
//! `{"__class__": "bytes", "__value__": "<base64>"}`, so byte strings such as
//! the cookie jar survive the round trip exactly.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CLASS_KEY: &str = "__class__";
const VALUE_KEY: &str = "__value__";
const BYTES_CLASS: &str = "bytes";

/// Settings blob: top-level keys to tagged values.
pub type Settings = BTreeMap<String, SettingValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<SettingValue>),
    Map(BTreeMap<String, SettingValue>),
}

impl SettingValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SettingValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SettingValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }
}

impl From<&str> for SettingValue {
    fn from(s: &str) -> Self {
        SettingValue::String(s.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(s: String) -> Self {
        SettingValue::String(s)
    }
}

impl From<Vec<u8>> for SettingValue {
    fn from(b: Vec<u8>) -> Self {
        SettingValue::Bytes(b)
    }
}

impl From<i64> for SettingValue {
    fn from(n: i64) -> Self {
        SettingValue::Number(n.into())
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cannot access session settings {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("session settings are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed session settings: {0}")]
    Malformed(String),
}

/// Encode a value into its tagged JSON form.
pub fn encode_value(value: &SettingValue) -> Value {
    match value {
        SettingValue::Null => Value::Null,
        SettingValue::Bool(b) => Value::Bool(*b),
        SettingValue::Number(n) => Value::Number(n.clone()),
        SettingValue::String(s) => Value::String(s.clone()),
        SettingValue::Bytes(bytes) => {
            let mut tagged = Map::new();
            tagged.insert(CLASS_KEY.into(), Value::String(BYTES_CLASS.into()));
            tagged.insert(VALUE_KEY.into(), Value::String(STANDARD.encode(bytes)));
            Value::Object(tagged)
        }
        SettingValue::List(items) => Value::Array(items.iter().map(encode_value).collect()),
        SettingValue::Map(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), encode_value(v))).collect()),
    }
}

/// Decode a tagged JSON value.
pub fn decode_value(value: Value) -> Result<SettingValue, StoreError> {
    Ok(match value {
        Value::Null => SettingValue::Null,
        Value::Bool(b) => SettingValue::Bool(b),
        Value::Number(n) => SettingValue::Number(n),
        Value::String(s) => SettingValue::String(s),
        Value::Array(items) => SettingValue::List(items.into_iter().map(decode_value).collect::<Result<_, _>>()?),
        Value::Object(map) if map.get(CLASS_KEY).and_then(Value::as_str) == Some(BYTES_CLASS) => {
            let text = map
                .get(VALUE_KEY)
                .and_then(Value::as_str)
                .ok_or_else(|| StoreError::Malformed("bytes value without a string __value__".into()))?;
            SettingValue::Bytes(decode_base64(text)?)
        }
        Value::Object(map) => SettingValue::Map(
            map.into_iter()
                .map(|(k, v)| Ok((k, decode_value(v)?)))
                .collect::<Result<_, StoreError>>()?,
        ),
    })
}

/// Base64 with line breaks tolerated (MIME-style wrapped writers).
fn decode_base64(text: &str) -> Result<Vec<u8>, StoreError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| StoreError::Malformed(format!("invalid base64 in bytes value: {e}")))
}

pub fn encode(settings: &Settings) -> Value {
    Value::Object(settings.iter().map(|(k, v)| (k.clone(), encode_value(v))).collect())
}

pub fn decode(value: Value) -> Result<Settings, StoreError> {
    match decode_value(value)? {
        SettingValue::Map(map) => Ok(map),
        _ => Err(StoreError::Malformed("settings must be a JSON object".into())),
    }
}

/// File-backed settings store.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no settings have been saved yet.
    pub fn load(&self) -> Result<Option<Settings>, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let settings = decode(serde_json::from_str(&text)?)?;
        tracing::debug!(path = %self.path.display(), keys = settings.len(), "loaded session settings");
        Ok(Some(settings))
    }

    /// Overwrite the stored settings.
    pub fn save(&self, settings: &Settings) -> Result<(), StoreError> {
        let text = serde_json::to_string(&encode(settings))?;
        fs::write(&self.path, text).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(path = %self.path.display(), "saved session settings");
        Ok(())
    }

    /// Remove the stored settings; a missing file is not an error.
    pub fn discard(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
