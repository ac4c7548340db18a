//! Run configuration.
//!
//! The file is kept as a JSON tree so environment overrides and CLI overlays
//! can be applied generically before the typed sections are read out of it.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Namespace prefix for configuration overrides, e.g. `OCEAN_GENERAL_TIMEOUT`.
pub const ENV_PREFIX: &str = "OCEAN";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    tree: Value,
}

impl Settings {
    /// Reads `path`, then applies `OCEAN_*` overrides from the process
    /// environment.
    pub fn load(path: &Path) -> Result<Self> {
        let tree = read_tree(path)?;
        let env: HashMap<String, String> = std::env::vars().collect();
        let tree = apply_env_overrides(&tree, &env)?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(Self { tree })
    }

    /// Writes the tree to `path`, as YAML or JSON depending on its extension.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_tree(path, &self.tree)?;
        debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Merges `updates` into the file at `path` and writes it back, then
    /// reloads it.
    ///
    /// The file is merged as stored, so `OCEAN_*` overrides active in this
    /// process are not persisted.
    pub fn update_file(path: &Path, updates: Value) -> Result<Self> {
        let mut tree = read_tree(path)?;
        deep_merge(&mut tree, updates);
        write_tree(path, &tree)?;
        Self::load(path)
    }

    pub fn from_value(tree: Value) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &Value {
        &self.tree
    }

    /// Merges `overlay` into the tree; mappings merge key by key, anything
    /// else replaces.
    pub fn merge(&mut self, overlay: Value) {
        deep_merge(&mut self.tree, overlay);
    }

    /// Settings shared by every downloader. Top-level `output_base_dir`,
    /// `max_retries` and `timeout` take precedence over the `general` section.
    pub fn general(&self) -> Result<GeneralSettings> {
        let mut general = match self.tree.get("general") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        for key in ["output_base_dir", "max_retries", "timeout"] {
            if let Some(v) = self.tree.get(key).filter(|v| !v.is_null()) {
                general.insert(key.to_string(), v.clone());
            }
        }
        decode("general", &Value::Object(general))
    }

    pub fn c3s(&self) -> Result<C3sSection> {
        self.section("c3s")
    }

    pub fn cmems(&self) -> Result<CmemsSection> {
        self.section("cmems")
    }

    fn section<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        match self.tree.get(key) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(v) => decode(key, v),
        }
    }
}

fn decode<T: DeserializeOwned>(section: &str, v: &Value) -> Result<T> {
    T::deserialize(v).map_err(|e| Error::ConfigSection {
        section: section.to_string(),
        message: e.to_string(),
    })
}

/// Lower-cased extension of a supported config file.
fn config_format(path: &Path) -> Result<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "yaml" | "yml" | "json" => Ok(ext),
        _ => Err(Error::UnsupportedConfigFormat(ext)),
    }
}

fn read_tree(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Err(Error::ConfigNotFound(path.to_path_buf()));
    }
    let ext = config_format(path)?;

    let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_err = |message: String| Error::ConfigParse {
        path: path.to_path_buf(),
        message,
    };

    let tree = if ext == "json" {
        serde_json::from_str(&text).map_err(|e| parse_err(e.to_string()))?
    } else {
        serde_yaml::from_str::<Value>(&text).map_err(|e| parse_err(e.to_string()))?
    };

    // An empty YAML document parses to null.
    Ok(if tree.is_null() { Value::Object(Map::new()) } else { tree })
}

fn write_tree(path: &Path, tree: &Value) -> Result<()> {
    let ext = config_format(path)?;
    let serialize_err = |message: String| Error::ConfigSerialize {
        path: path.to_path_buf(),
        message,
    };

    let mut text = if ext == "json" {
        serde_json::to_string_pretty(tree).map_err(|e| serialize_err(e.to_string()))?
    } else {
        serde_yaml::to_string(tree).map_err(|e| serialize_err(e.to_string()))?
    };
    if !text.ends_with('\n') {
        text.push('\n');
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| Error::ConfigWrite {
            path: path.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, text).map_err(|source| Error::ConfigWrite {
        path: path.to_path_buf(),
        source,
    })
}

/// Returns `tree` with every scalar leaf replaced by the matching `OCEAN_*`
/// variable in `env`.
///
/// The variable name is the key path joined by `_` and upper-cased. The new
/// value keeps the type of the old one; arrays are not overridable.
pub fn apply_env_overrides(tree: &Value, env: &HashMap<String, String>) -> Result<Value> {
    let mut out = tree.clone();
    if let Value::Object(map) = &mut out {
        override_map(map, ENV_PREFIX, env)?;
    }
    Ok(out)
}

fn override_map(map: &mut Map<String, Value>, prefix: &str, env: &HashMap<String, String>) -> Result<()> {
    for (key, value) in map.iter_mut() {
        let var = format!("{}_{}", prefix, key.to_uppercase());
        match value {
            Value::Object(inner) => override_map(inner, &var, env)?,
            Value::Array(_) => {}
            _ => {
                if let Some(raw) = env.get(&var) {
                    *value = coerce(value, &var, raw)?;
                }
            }
        }
    }
    Ok(())
}

fn coerce(current: &Value, var: &str, raw: &str) -> Result<Value> {
    let invalid = |expected| Error::EnvOverride {
        var: var.to_string(),
        value: raw.to_string(),
        expected,
    };
    Ok(match current {
        Value::Bool(_) => Value::Bool(matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes")),
        Value::Number(n) if n.is_f64() => {
            let f: f64 = raw.trim().parse().map_err(|_| invalid("float"))?;
            serde_json::Number::from_f64(f).map(Value::Number).ok_or_else(|| invalid("float"))?
        }
        Value::Number(_) => Value::from(raw.trim().parse::<i64>().map_err(|_| invalid("integer"))?),
        _ => Value::String(raw.to_string()),
    })
}

pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let nested = value.is_object() && base.get(&key).is_some_and(Value::is_object);
                match base.get_mut(&key) {
                    Some(existing) if nested => deep_merge(existing, value),
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout() -> u64 {
    300
}

fn default_retry_delay() -> f64 {
    1.0
}

fn default_retry_max_delay() -> f64 {
    60.0
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GeneralSettings {
    #[serde(default = "default_output_dir")]
    pub output_base_dir: PathBuf,
    /// Attempts per period, including the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds allowed for a single API call.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Seconds to wait before the first retry of a failed period.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: f64,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            output_base_dir: default_output_dir(),
            max_retries: default_max_retries(),
            timeout: default_timeout(),
            retry_delay: default_retry_delay(),
            retry_max_delay: default_retry_max_delay(),
        }
    }
}

/// A dataset registry: dataset name to entry.
pub type Registry = BTreeMap<String, RegistryEntry>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RegistryEntry {
    Dataset(DatasetSpec),
    /// A bare description; listed, but carries nothing to download with.
    Description(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DatasetSpec {
    /// CDS dataset name, e.g. `reanalysis-era5-single-levels-monthly-means`.
    pub name: Option<String>,
    /// Marine product id.
    pub dataset_id: Option<String>,
    pub description: Option<String>,
    pub variables: Vec<String>,
    /// `[min_lon, max_lon, min_lat, max_lat]`
    pub spatial_range: Option<[f64; 4]>,
    /// `[min_depth, max_depth]`
    pub depth_range: Option<[f64; 2]>,
    /// Hours of day, `HH:MM`.
    pub time: Option<Vec<String>>,
    pub product_type: Option<String>,
    pub data_format: Option<String>,
    pub download_format: Option<String>,
    pub daily_statistic: Option<String>,
    pub frequency: Option<String>,
    pub statistic: Option<String>,
    pub time_zone: Option<String>,
}

impl RegistryEntry {
    pub fn description(&self) -> String {
        match self {
            RegistryEntry::Description(s) => s.clone(),
            RegistryEntry::Dataset(d) => d
                .name
                .as_deref()
                .or(d.dataset_id.as_deref())
                .or(d.description.as_deref())
                .unwrap_or("")
                .to_string(),
        }
    }
}

/// Finds `name` in `registry`.
pub fn lookup<'a>(registry: &'a Registry, service: &'static str, name: &str) -> Result<&'a DatasetSpec> {
    match registry.get(name) {
        Some(RegistryEntry::Dataset(spec)) => Ok(spec),
        Some(RegistryEntry::Description(_)) => Err(Error::ConfigSection {
            section: format!("{}.datasets.{}", service, name),
            message: "entry is a bare description without download parameters".to_string(),
        }),
        None => Err(Error::DatasetNotFound {
            service,
            name: name.to_string(),
        }),
    }
}

/// Per-service fallbacks for values the command line leaves out.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunDefaults {
    pub dataset: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub variables: Option<Vec<String>>,
    pub hours: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct C3sSection {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub verify: Option<bool>,
    pub datasets: Registry,
    pub defaults: RunDefaults,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CmemsSection {
    pub api_url: Option<String>,
    pub service_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub datasets: Registry,
    pub defaults: RunDefaults,
}
