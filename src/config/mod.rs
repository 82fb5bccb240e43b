//! Layered configuration.
//!
//! Configuration lives in TOML files with one table per section:
//!
//! ```toml
//! [kernel_builder]
//! mode = "generic"
//! kvm = "yes"
//! ```
//!
//! Files are applied in order (system defaults, user overrides, then an
//! optional caller-supplied file) and later files win. A component asks for
//! the sections it reads with a [`ResolveRequest`] and gets a flat
//! [`Fields`] map back; [`sections`] turns that map into typed structs.
//!
//! The [`Config`] value is built once by the binary and passed by reference
//! into every component constructor.

pub mod sections;

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::LabError;

/// Default layered files, relative to the project directory.
pub const SYSTEM_CONFIG: &str = "configs/system.toml";
pub const USER_CONFIG: &str = "configs/user.toml";

/// A resolved option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Str(String),
    Bool(bool),
}

impl ConfigValue {
    fn from_toml(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::String(s) => Some(match s.as_str() {
                "yes" => Self::Bool(true),
                "no" => Self::Bool(false),
                _ => Self::Str(s.clone()),
            }),
            toml::Value::Boolean(b) => Some(Self::Bool(*b)),
            toml::Value::Integer(i) => Some(Self::Str(i.to_string())),
            toml::Value::Float(f) => Some(Self::Str(f.to_string())),
            toml::Value::Array(items) => Some(Self::Str(
                items
                    .iter()
                    .filter_map(|item| match item {
                        toml::Value::String(s) => Some(s.clone()),
                        other => Some(other.to_string()),
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            )),
            toml::Value::Datetime(d) => Some(Self::Str(d.to_string())),
            toml::Value::Table(_) => None,
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Self::Str(s) if s.is_empty())
    }
}

/// One parsed configuration file.
#[derive(Debug, Clone)]
pub struct Layer {
    pub origin: PathBuf,
    /// Empty strings in this layer never replace an existing value.
    pub ignore_empty: bool,
    pub table: toml::Table,
}

impl Layer {
    pub fn parse(origin: &Path, content: &str, ignore_empty: bool) -> Result<Self> {
        let table: toml::Table = toml::from_str(content).map_err(|e| {
            LabError::Configuration(format!("parsing '{}': {}", origin.display(), e))
        })?;
        Ok(Self {
            origin: origin.to_path_buf(),
            ignore_empty,
            table,
        })
    }

    fn section(&self, name: &str) -> Option<&toml::Table> {
        self.table.get(name).and_then(toml::Value::as_table)
    }
}

/// What a component wants out of the layered configuration.
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest<'a> {
    pub sections: &'a [&'a str],
    pub exclude_keys: &'a [&'a str],
    /// Extra `(section, keys)` imported from sections not listed above.
    pub cherry_pick: &'a [(&'a str, &'a [&'a str])],
}

impl<'a> ResolveRequest<'a> {
    pub fn sections(sections: &'a [&'a str]) -> Self {
        Self {
            sections,
            ..Default::default()
        }
    }

    pub fn exclude(mut self, keys: &'a [&'a str]) -> Self {
        self.exclude_keys = keys;
        self
    }

    pub fn cherry_pick(mut self, picks: &'a [(&'a str, &'a [&'a str])]) -> Self {
        self.cherry_pick = picks;
        self
    }
}

/// Flat option map resolved for one component.
#[derive(Debug, Clone, Default)]
pub struct Fields {
    sections: Vec<String>,
    values: BTreeMap<String, ConfigValue>,
}

impl Fields {
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn missing(&self, key: &str) -> LabError {
        LabError::Configuration(format!(
            "missing required key '{}' (sections: {})",
            key,
            self.sections.join(", ")
        ))
    }

    /// Required string value. Booleans are rendered as `yes`/`no`.
    pub fn str(&self, key: &str) -> Result<String> {
        match self.values.get(key) {
            Some(ConfigValue::Str(s)) => Ok(s.clone()),
            Some(ConfigValue::Bool(b)) => Ok(if *b { "yes" } else { "no" }.to_string()),
            None => Err(self.missing(key).into()),
        }
    }

    /// Optional string value; empty strings count as absent.
    pub fn opt_str(&self, key: &str) -> Option<String> {
        match self.values.get(key) {
            Some(ConfigValue::Str(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }

    pub fn str_or(&self, key: &str, default: &str) -> String {
        self.opt_str(key).unwrap_or_else(|| default.to_string())
    }

    /// Required boolean.
    pub fn bool(&self, key: &str) -> Result<bool> {
        match self.values.get(key) {
            Some(ConfigValue::Bool(b)) => Ok(*b),
            Some(ConfigValue::Str(s)) => Err(LabError::Configuration(format!(
                "key '{}' must be yes/no, got '{}'",
                key, s
            ))
            .into()),
            None => Err(self.missing(key).into()),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        if self.contains(key) {
            self.bool(key)
        } else {
            Ok(default)
        }
    }

    /// Required unsigned integer.
    pub fn u32(&self, key: &str) -> Result<u32> {
        let raw = self.str(key)?;
        raw.trim().parse::<u32>().map_err(|_| {
            LabError::Configuration(format!("key '{}' must be a number, got '{}'", key, raw))
                .into()
        })
    }

    pub fn u32_or(&self, key: &str, default: u32) -> Result<u32> {
        if self.opt_str(key).is_some() {
            self.u32(key)
        } else {
            Ok(default)
        }
    }

    /// Required path; a leading `~/` is expanded to the home directory.
    pub fn path(&self, key: &str) -> Result<PathBuf> {
        let raw = self.str(key)?;
        if raw.trim().is_empty() {
            return Err(LabError::Configuration(format!("key '{}' must not be empty", key)).into());
        }
        Ok(expand_home(raw.trim()))
    }

    pub fn opt_path(&self, key: &str) -> Option<PathBuf> {
        self.opt_str(key).map(|raw| expand_home(&raw))
    }
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Apply `request` over `layers` in order.
pub fn resolve_layers(layers: &[Layer], request: &ResolveRequest<'_>) -> Fields {
    let mut fields = Fields {
        sections: request.sections.iter().map(|s| s.to_string()).collect(),
        values: BTreeMap::new(),
    };

    for layer in layers {
        for section in request.sections {
            let Some(table) = layer.section(section) else {
                continue;
            };
            for (key, value) in table {
                if request.exclude_keys.contains(&key.as_str()) {
                    continue;
                }
                set_field(&mut fields, layer, key, value);
            }
        }

        for (section, keys) in request.cherry_pick {
            let Some(table) = layer.section(section) else {
                continue;
            };
            for (key, value) in table {
                if keys.contains(&key.as_str()) {
                    set_field(&mut fields, layer, key, value);
                }
            }
        }
    }

    fields
}

fn set_field(fields: &mut Fields, layer: &Layer, key: &str, value: &toml::Value) {
    let Some(parsed) = ConfigValue::from_toml(value) else {
        tracing::warn!(
            "ignoring nested table '{}' in {}",
            key,
            layer.origin.display()
        );
        return;
    };
    if layer.ignore_empty && parsed.is_empty() {
        return;
    }
    fields.values.insert(key.to_string(), parsed);
}

/// Parsed configuration stack for one run.
#[derive(Debug, Clone, Default)]
pub struct Config {
    layers: Vec<Layer>,
}

impl Config {
    /// Load the default files under `project_dir` plus an optional override.
    ///
    /// Missing default files are skipped; a missing override file is an error.
    pub fn load(project_dir: &Path, override_file: Option<&Path>) -> Result<Self> {
        let mut layers = Vec::new();
        for rel in [SYSTEM_CONFIG, USER_CONFIG] {
            let path = project_dir.join(rel);
            if !path.is_file() {
                tracing::debug!("config {} not present, skipping", path.display());
                continue;
            }
            layers.push(read_layer(&path, false)?);
        }

        if let Some(path) = override_file {
            if !path.is_file() {
                return Err(LabError::Configuration(format!(
                    "config file '{}' does not exist",
                    path.display()
                ))
                .into());
            }
            layers.push(read_layer(path, true)?);
        }

        if layers.is_empty() {
            tracing::warn!(
                "no configuration files found under {}",
                project_dir.display()
            );
        }

        Ok(Self { layers })
    }

    pub fn from_layers(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    pub fn resolve(&self, request: &ResolveRequest<'_>) -> Fields {
        resolve_layers(&self.layers, request)
    }
}

fn read_layer(path: &Path, ignore_empty: bool) -> Result<Layer> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config file '{}'", path.display()))?;
    Layer::parse(path, &content, ignore_empty)
}
