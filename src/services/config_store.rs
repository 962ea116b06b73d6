//! Persisted desired state of the gateway
//!
//! One JSON document holds the last bridge settings and the fallback network
//! settings. Reads fail soft, writes merge into whatever is already on disk.

use crate::services::{bridge::ParityMode, network::FallbackNetworkConfig};
use anyhow::{Context, Result, bail};
use log::{debug, warn};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Contents of the persisted document. Every field is optional; absent fields
/// imply defaults. Also used as the partial record passed to [`ConfigStore::save`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PersistedState {
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub running: Option<bool>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub device: Option<PathBuf>,
    #[serde(
        default,
        deserialize_with = "number_or_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub baud: Option<u32>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub parity: Option<ParityMode>,
    #[serde(
        default,
        deserialize_with = "number_or_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub port: Option<u16>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub fallback_ip: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub fallback_gw: Option<String>,
}

impl PersistedState {
    pub fn running(running: bool) -> Self {
        Self {
            running: Some(running),
            ..Default::default()
        }
    }

    pub fn fallback(&self) -> FallbackNetworkConfig {
        FallbackNetworkConfig::from_persisted(
            self.fallback_ip.as_deref(),
            self.fallback_gw.as_deref(),
        )
    }
}

/// A malformed field is dropped on its own so the rest of the document survives
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Ok(serde_json::from_value(value.clone())
            .inspect_err(|e| warn!("ignoring persisted value {value}: {e}"))
            .ok()),
    }
}

/// Older documents store `baud`/`port` as the raw form strings
fn number_or_string<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr + TryFrom<u64>,
{
    let parsed = match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| T::try_from(n).ok())
            .ok_or(Value::Number(n)),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| Value::String(s)),
        Some(other) => Err(other),
    };

    Ok(parsed
        .inspect_err(|value| warn!("ignoring persisted number {value}"))
        .ok())
}

/// Owner of the persisted document
pub struct ConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state
    ///
    /// A missing, unreadable or malformed document yields the default (empty) state.
    pub fn load(&self) -> PersistedState {
        let document = self.read_document();

        serde_json::from_value(Value::Object(document)).unwrap_or_else(|e| {
            warn!("ignoring malformed state in {:?}: {e}", self.path);
            PersistedState::default()
        })
    }

    /// Merge the fields present in `partial` into the document and write it back
    ///
    /// Fields absent from `partial` keep their stored value, as do keys this
    /// version does not know about.
    pub fn save(&self, partial: &PersistedState) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut document = self.read_document();

        let Value::Object(fields) =
            serde_json::to_value(partial).context("failed to serialize state")?
        else {
            bail!("failed to serialize state: not an object");
        };

        debug!("save state {fields:?} to {:?}", self.path);
        document.extend(fields);

        self.write_document(&document)
    }

    /// Persist the fallback network settings, independent of bridge and network state
    pub fn save_fallback(&self, fallback: &FallbackNetworkConfig) -> Result<()> {
        self.save(&PersistedState {
            fallback_ip: Some(fallback.address.to_string()),
            fallback_gw: Some(fallback.gateway.to_string()),
            ..Default::default()
        })
    }

    fn read_document(&self) -> Map<String, Value> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Map::new(),
            Err(e) => {
                warn!("failed to read state file {:?}: {e}", self.path);
                return Map::new();
            }
        };

        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(document)) => document,
            Ok(_) => {
                warn!("state file {:?} is not a JSON object", self.path);
                Map::new()
            }
            Err(e) => {
                warn!("failed to parse state file {:?}: {e}", self.path);
                Map::new()
            }
        }
    }

    fn write_document(&self, document: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context(format!("failed to create {parent:?}"))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string(document).context("failed to serialize state")?;

        fs::write(&tmp_path, json).context(format!("failed to write {tmp_path:?}"))?;
        fs::rename(&tmp_path, &self.path)
            .context(format!("failed to rename {tmp_path:?} to {:?}", self.path))
    }
}
