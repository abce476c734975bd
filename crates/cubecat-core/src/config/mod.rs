//! Configuration model: schema-validated record, file loading, merging.
//!
//! Configuration files are TOML or JSON (by extension). Multiple files
//! merge left-to-right with last-write-wins at leaves and deep merge at
//! objects; lists are replaced whole. String values support `${NAME}`
//! and `$NAME` environment substitution before parsing.

pub mod markdown;

use std::collections::BTreeMap;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::dataset::{Attrs, DataType, Encoding};
use crate::error::{Error, Result};
use crate::fsutil::FileObj;

// ============================================================================
// Default Values
// ============================================================================

/// Central source of truth for all configuration defaults.
pub struct ConfigDefaults;

impl ConfigDefaults {
    pub const APPEND_DIM: &'static str = "time";
    pub const ZARR_VERSION: u8 = 2;
    pub const POLLING_INTERVAL_SECS: f64 = 2.0;
    pub const POLLING_TIMEOUT_SECS: f64 = 60.0;
}

// Thin wrappers for serde's #[serde(default = "...")] requirement
fn default_append_dim() -> String {
    ConfigDefaults::APPEND_DIM.to_string()
}
fn default_zarr_version() -> u8 {
    ConfigDefaults::ZARR_VERSION
}
fn default_polling_interval() -> f64 {
    ConfigDefaults::POLLING_INTERVAL_SECS
}
fn default_polling_timeout() -> f64 {
    ConfigDefaults::POLLING_TIMEOUT_SECS
}

// ============================================================================
// Field types
// ============================================================================

/// Constraint on consecutive append-axis labels.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendStep {
    /// Labels must be strictly increasing (`"+"`)
    Increasing,
    /// Labels must be strictly decreasing (`"-"`)
    Decreasing,
    /// Exact numeric delta between consecutive labels
    Number(f64),
    /// Exact temporal delta, e.g. `"1D"`, `"6h"`; `seconds` is the
    /// parsed magnitude
    Duration { seconds: f64, text: String },
}

/// Parse a duration string of the form `<number><unit>` with unit one
/// of `ms`, `s`, `m`, `h`, `D`/`d`, `W`/`w`.
pub fn parse_duration_secs(text: &str) -> Result<f64> {
    let split = text
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| Error::config(format!("invalid duration {text:?}: missing unit")))?;
    let (number, unit) = text.split_at(split);
    let number: f64 = if number.is_empty() {
        1.0
    } else {
        number
            .parse()
            .map_err(|_| Error::config(format!("invalid duration {text:?}")))?
    };
    let factor = match unit {
        "ms" => 0.001,
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        "D" | "d" => 86400.0,
        "W" | "w" => 604800.0,
        other => {
            return Err(Error::config(format!(
                "invalid duration unit {other:?} in {text:?}"
            )));
        }
    };
    Ok(number * factor)
}

impl Serialize for AppendStep {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            AppendStep::Increasing => serializer.serialize_str("+"),
            AppendStep::Decreasing => serializer.serialize_str("-"),
            AppendStep::Number(n) => serializer.serialize_f64(*n),
            AppendStep::Duration { text, .. } => serializer.serialize_str(text),
        }
    }
}

impl<'de> Deserialize<'de> for AppendStep {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Number(n) => {
                let n = n
                    .as_f64()
                    .ok_or_else(|| serde::de::Error::custom("append_step out of range"))?;
                Ok(AppendStep::Number(n))
            }
            serde_json::Value::String(s) => match s.as_str() {
                "+" => Ok(AppendStep::Increasing),
                "-" => Ok(AppendStep::Decreasing),
                text => {
                    let seconds =
                        parse_duration_secs(text).map_err(serde::de::Error::custom)?;
                    Ok(AppendStep::Duration {
                        seconds,
                        text: text.to_string(),
                    })
                }
            },
            other => Err(serde::de::Error::custom(format!(
                "append_step must be a number or string, got {other}"
            ))),
        }
    }
}

impl JsonSchema for AppendStep {
    fn schema_name() -> String {
        "AppendStep".to_string()
    }

    fn json_schema(_gen: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
        serde_json::from_value(serde_json::json!({
            "description": "Constraint on consecutive append-axis labels: \
                            a number (exact delta), a duration string such \
                            as \"1D\" or \"6h\", \"+\" (increasing), or \
                            \"-\" (decreasing).",
            "anyOf": [{"type": "number"}, {"type": "string"}]
        }))
        .expect("static schema")
    }
}

/// How group attributes of the cube are updated on append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AttrsUpdateMode {
    /// Keep the cube's attributes, ignore the slice's
    #[default]
    Keep,
    /// Replace the cube's attributes with the slice's, whole-object
    Replace,
    /// Merge the slice's attributes into the cube's
    Update,
    /// Do not touch group attributes at all
    Ignore,
}

/// Slice polling: `false`, `true` (defaults), or explicit knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum SlicePolling {
    Enabled(bool),
    Spec {
        /// Seconds between attempts
        #[serde(default = "default_polling_interval")]
        interval: f64,
        /// Seconds until giving up
        #[serde(default = "default_polling_timeout")]
        timeout: f64,
    },
}

impl Default for SlicePolling {
    fn default() -> Self {
        SlicePolling::Enabled(false)
    }
}

impl SlicePolling {
    /// `(interval, timeout)` when polling is enabled.
    pub fn resolved(&self) -> Option<(Duration, Duration)> {
        match self {
            SlicePolling::Enabled(false) => None,
            SlicePolling::Enabled(true) => Some((
                Duration::from_secs_f64(ConfigDefaults::POLLING_INTERVAL_SECS),
                Duration::from_secs_f64(ConfigDefaults::POLLING_TIMEOUT_SECS),
            )),
            SlicePolling::Spec { interval, timeout } => Some((
                Duration::from_secs_f64(*interval),
                Duration::from_secs_f64(*timeout),
            )),
        }
    }
}

/// Per-slice wall-clock timing: `false`, `true`, or `{enabled}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Profiling {
    Enabled(bool),
    Spec {
        #[serde(default)]
        enabled: bool,
    },
}

impl Default for Profiling {
    fn default() -> Self {
        Profiling::Enabled(false)
    }
}

impl Profiling {
    pub fn enabled(&self) -> bool {
        match self {
            Profiling::Enabled(e) => *e,
            Profiling::Spec { enabled } => *enabled,
        }
    }
}

/// Logging setup: a level name or `{level}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum LoggingConfig {
    Level(String),
    Spec { level: String },
}

impl LoggingConfig {
    pub fn level(&self) -> &str {
        match self {
            LoggingConfig::Level(level) => level,
            LoggingConfig::Spec { level } => level,
        }
    }
}

/// Per-variable configuration: dimensions, encoding, attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct VariableConfig {
    /// Dimension names, outermost first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dims: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Encoding>,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub attrs: Attrs,
}

// ============================================================================
// Configuration record
// ============================================================================

/// The validated configuration record.
///
/// Consumed read-only by everything downstream of loading.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Target cube directory path or URI (required)
    pub target_dir: String,
    /// Storage options for the target URI's protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_storage_options: Option<Attrs>,

    /// Name of the append dimension
    #[serde(default = "default_append_dim")]
    pub append_dim: String,
    /// Constraint on consecutive append-axis labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_step: Option<AppendStep>,
    /// Expected sizes of non-append dimensions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_dims: Option<BTreeMap<String, u64>>,

    /// Only these variables are written (empty: all)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_variables: Vec<String>,
    /// These variables are never written
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_variables: Vec<String>,
    /// Per-variable settings; `"*"` applies to every variable
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, VariableConfig>,

    /// Attributes merged into the cube's group attributes
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub attrs: Attrs,
    /// How slice group attributes update the cube's on append
    #[serde(default)]
    pub attrs_update_mode: AttrsUpdateMode,
    /// Allow `{{ … }}` expressions in `attrs` values
    #[serde(default)]
    pub permit_eval: bool,
    /// Version of the chunked array format; must be 2
    #[serde(default = "default_zarr_version")]
    pub zarr_version: u8,

    /// Storage options for slice URIs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_storage_options: Option<Attrs>,
    /// Format hint for slice URIs; only `"zarr"` is supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_engine: Option<String>,
    /// Wait for slices (and the lock) to become available
    #[serde(default)]
    pub slice_polling: SlicePolling,
    /// Reference to a slice source; only usable through the library API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_source_kwargs: Option<Attrs>,
    /// Persist in-memory slices to a temporary store before writing
    #[serde(default)]
    pub persist_mem_slices: bool,

    /// Directory for transaction journals and temporary slices;
    /// defaults to the OS temporary directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_storage_options: Option<Attrs>,

    /// Skip journalling entirely; failures leave the cube undefined
    #[serde(default)]
    pub disable_rollback: bool,
    /// Delete an existing cube (and lock) before processing
    #[serde(default)]
    pub force_new: bool,
    /// Log intended actions without writing anything
    #[serde(default)]
    pub dry_run: bool,

    /// Per-slice wall-clock timing
    #[serde(default)]
    pub profiling: Profiling,
    /// Logging level configuration, applied by the CLI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
    /// Free-form extra settings, ignored by the engine
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub extra: Attrs,
}

impl Config {
    /// Build and validate a configuration from a JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let config: Config = serde_json::from_value(value)
            .map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load, substitute, merge and validate configuration files.
    pub fn from_files(files: &[FileObj]) -> Result<Self> {
        Self::from_value(Self::value_from_files(files)?)
    }

    /// Load, substitute and merge configuration files without
    /// validating, so callers can apply overrides first.
    pub fn value_from_files(files: &[FileObj]) -> Result<serde_json::Value> {
        let mut merged = serde_json::Value::Object(serde_json::Map::new());
        for file in files {
            tracing::info!("Reading configuration {}", file.uri());
            let text = file.read_to_string()?;
            let text = substitute_env(&text)?;
            let value = parse_config_text(&text, file.uri())?;
            merged = merge_values(merged, value);
        }
        Ok(merged)
    }

    /// Validation beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        if self.target_dir.is_empty() {
            return Err(Error::config("'target_dir' must not be empty"));
        }
        if self.zarr_version != 2 {
            return Err(Error::config(format!(
                "'zarr_version' must be 2, got {}",
                self.zarr_version
            )));
        }
        if let Some((interval, _)) = self.slice_polling.resolved() {
            if interval.is_zero() {
                return Err(Error::config("polling 'interval' must be positive"));
            }
        }
        if let Some(fixed_dims) = &self.fixed_dims {
            if fixed_dims.contains_key(&self.append_dim) {
                return Err(Error::config(format!(
                    "size of append dimension {:?} must not be fixed",
                    self.append_dim
                )));
            }
        }
        if self.slice_source.is_some() {
            return Err(Error::config(
                "'slice_source' references are only supported through the \
                 library API; pass slice sources programmatically",
            ));
        }
        if let Some(engine) = &self.slice_engine {
            if engine != "zarr" {
                return Err(Error::config(format!(
                    "unsupported 'slice_engine' {engine:?}; only \"zarr\" is supported"
                )));
            }
        }
        for (name, var) in &self.variables {
            if let Some(encoding) = &var.encoding {
                validate_encoding(name, encoding)?;
            }
        }
        Ok(())
    }

    /// Polling knobs shared by slice acquisition and lock waiting.
    pub fn polling(&self) -> Option<(Duration, Duration)> {
        self.slice_polling.resolved()
    }

    /// The temporary directory URI for journals and temp slices.
    pub fn temp_dir_uri(&self) -> String {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().to_string_lossy().into_owned())
    }

    /// Merged variable settings for `name`: explicit entry over `"*"`.
    pub fn variable_config(&self, name: &str) -> VariableConfig {
        let wildcard = self.variables.get("*");
        let explicit = self.variables.get(name);
        match (wildcard, explicit) {
            (None, None) => VariableConfig::default(),
            (Some(w), None) => w.clone(),
            (None, Some(e)) => e.clone(),
            (Some(w), Some(e)) => {
                let mut merged = w.clone();
                if e.dims.is_some() {
                    merged.dims = e.dims.clone();
                }
                merged.encoding = match (&w.encoding, &e.encoding) {
                    (Some(we), Some(ee)) => Some(we.merge_with(ee)),
                    (None, other) => other.clone(),
                    (other, None) => other.clone(),
                };
                for (k, v) in &e.attrs {
                    merged.attrs.insert(k.clone(), v.clone());
                }
                merged
            }
        }
    }
}

fn validate_encoding(name: &str, encoding: &Encoding) -> Result<()> {
    if let Some(dtype) = &encoding.dtype {
        DataType::parse(dtype)
            .map_err(|e| Error::config(format!("variable {name:?}: {e}")))?;
    }
    if let Some(chunks) = &encoding.chunks {
        for chunk in chunks.iter().flatten() {
            if *chunk == 0 {
                return Err(Error::config(format!(
                    "variable {name:?}: chunk sizes must be positive"
                )));
            }
        }
    }
    if let Some(compressor) = &encoding.compressor {
        if !compressor.is_none_codec() && compressor.id() != "zlib" {
            return Err(Error::config(format!(
                "variable {name:?}: unsupported compressor {:?}",
                compressor.id()
            )));
        }
        if let Some(level) = compressor.level() {
            if level > 9 {
                return Err(Error::config(format!(
                    "variable {name:?}: compression level {level} out of range 0..=9"
                )));
            }
        }
    }
    if let Some(filters) = &encoding.filters {
        if !filters.is_empty() {
            return Err(Error::config(format!(
                "variable {name:?}: filters are not supported"
            )));
        }
    }
    Ok(())
}

/// Parse a configuration file's text by extension.
fn parse_config_text(text: &str, uri: &str) -> Result<serde_json::Value> {
    let lower = uri.to_ascii_lowercase();
    let value = if lower.ends_with(".toml") {
        let parsed: toml::Value = toml::from_str(text)
            .map_err(|e| Error::config(format!("{uri}: {e}")))?;
        serde_json::to_value(parsed).map_err(|e| Error::config(format!("{uri}: {e}")))?
    } else {
        serde_json::from_str(text).map_err(|e| Error::config(format!("{uri}: {e}")))?
    };
    if !value.is_object() {
        return Err(Error::config(format!("{uri}: object expected")));
    }
    Ok(value)
}

/// Deep-merge two JSON values: objects merge by key, everything else
/// (including lists) is replaced by the right-hand side.
pub fn merge_values(left: serde_json::Value, right: serde_json::Value) -> serde_json::Value {
    match (left, right) {
        (serde_json::Value::Object(mut l), serde_json::Value::Object(r)) => {
            for (key, rv) in r {
                match l.remove(&key) {
                    Some(lv) => {
                        l.insert(key, merge_values(lv, rv));
                    }
                    None => {
                        l.insert(key, rv);
                    }
                }
            }
            serde_json::Value::Object(l)
        }
        (_, right) => right,
    }
}

/// Substitute `${NAME}` and `$NAME` with environment variables.
/// `$$` escapes a literal dollar. Unresolved names are an error.
pub fn substitute_env(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(Error::config(format!(
                        "unterminated environment reference '${{{name}'"
                    )));
                }
                out.push_str(&lookup_env(&name)?);
            }
            Some((_, c)) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup_env(&name)?);
            }
            _ => out.push('$'),
        }
    }
    Ok(out)
}

fn lookup_env(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(Error::config("empty environment variable reference"));
    }
    std::env::var(name)
        .map_err(|_| Error::config(format!("unresolved environment variable ${{{name}}}")))
}

/// JSON schema of the configuration record.
pub fn config_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(Config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config =
            Config::from_value(serde_json::json!({"target_dir": "memory://t.cube"})).unwrap();
        assert_eq!(config.append_dim, "time");
        assert_eq!(config.zarr_version, 2);
        assert!(config.polling().is_none());
        assert!(!config.force_new);
        assert_eq!(config.attrs_update_mode, AttrsUpdateMode::Keep);
    }

    #[test]
    fn test_missing_target_dir_is_config_error() {
        let err = Config::from_value(serde_json::json!({})).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("target_dir"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = Config::from_value(serde_json::json!({
            "target_dir": "t.cube",
            "target_dri": "oops"
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let err = Config::from_value(serde_json::json!({
            "target_dir": "t.cube",
            "append_dim": 12
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_out_of_enum_rejected() {
        let err = Config::from_value(serde_json::json!({
            "target_dir": "t.cube",
            "attrs_update_mode": "merge"
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_zarr_version_must_be_2() {
        let err = Config::from_value(serde_json::json!({
            "target_dir": "t.cube",
            "zarr_version": 3
        }))
        .unwrap_err();
        assert!(err.to_string().contains("zarr_version"));
    }

    #[test]
    fn test_fixed_append_dim_rejected() {
        let err = Config::from_value(serde_json::json!({
            "target_dir": "t.cube",
            "append_dim": "t",
            "fixed_dims": {"t": 10}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("append dimension"));
    }

    #[test]
    fn test_append_step_forms() {
        let config = Config::from_value(serde_json::json!({
            "target_dir": "t.cube",
            "append_step": "+"
        }))
        .unwrap();
        assert_eq!(config.append_step, Some(AppendStep::Increasing));

        let config = Config::from_value(serde_json::json!({
            "target_dir": "t.cube",
            "append_step": 2.5
        }))
        .unwrap();
        assert_eq!(config.append_step, Some(AppendStep::Number(2.5)));

        let config = Config::from_value(serde_json::json!({
            "target_dir": "t.cube",
            "append_step": "1D"
        }))
        .unwrap();
        match config.append_step {
            Some(AppendStep::Duration { seconds, .. }) => assert_eq!(seconds, 86400.0),
            other => panic!("unexpected step: {other:?}"),
        }

        assert!(Config::from_value(serde_json::json!({
            "target_dir": "t.cube",
            "append_step": "1x"
        }))
        .is_err());
    }

    #[test]
    fn test_slice_polling_forms() {
        let config = Config::from_value(serde_json::json!({
            "target_dir": "t.cube",
            "slice_polling": true
        }))
        .unwrap();
        let (interval, timeout) = config.polling().unwrap();
        assert_eq!(interval, Duration::from_secs(2));
        assert_eq!(timeout, Duration::from_secs(60));

        let config = Config::from_value(serde_json::json!({
            "target_dir": "t.cube",
            "slice_polling": {"interval": 0.1, "timeout": 0.5}
        }))
        .unwrap();
        let (interval, timeout) = config.polling().unwrap();
        assert_eq!(interval, Duration::from_millis(100));
        assert_eq!(timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_filters_rejected() {
        let err = Config::from_value(serde_json::json!({
            "target_dir": "t.cube",
            "variables": {"v": {"encoding": {"filters": [{"id": "delta"}]}}}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("filters"));
    }

    #[test]
    fn test_variable_config_wildcard_merge() {
        let config = Config::from_value(serde_json::json!({
            "target_dir": "t.cube",
            "variables": {
                "*": {"encoding": {"compressor": "zlib", "dtype": "float32"}},
                "v": {"encoding": {"dtype": "int16"}}
            }
        }))
        .unwrap();
        let merged = config.variable_config("v");
        let encoding = merged.encoding.unwrap();
        assert_eq!(encoding.dtype.as_deref(), Some("int16"));
        assert_eq!(encoding.compressor.as_ref().unwrap().id(), "zlib");

        let other = config.variable_config("w");
        assert_eq!(other.encoding.unwrap().dtype.as_deref(), Some("float32"));
    }

    #[test]
    fn test_merge_values_deep() {
        let left = serde_json::json!({
            "a": {"x": 1, "y": 2},
            "list": [1, 2],
            "keep": true
        });
        let right = serde_json::json!({
            "a": {"y": 3, "z": 4},
            "list": [9]
        });
        let merged = merge_values(left, right);
        assert_eq!(
            merged,
            serde_json::json!({
                "a": {"x": 1, "y": 3, "z": 4},
                "list": [9],
                "keep": true
            })
        );
    }

    #[test]
    fn test_substitute_env() {
        std::env::set_var("CUBECAT_TEST_SUB", "world");
        assert_eq!(
            substitute_env("hello ${CUBECAT_TEST_SUB}").unwrap(),
            "hello world"
        );
        assert_eq!(
            substitute_env("hello $CUBECAT_TEST_SUB!").unwrap(),
            "hello world!"
        );
        assert_eq!(substitute_env("cost: $$5").unwrap(), "cost: $5");
        assert!(substitute_env("${CUBECAT_TEST_UNSET_VAR}").is_err());
    }

    #[test]
    fn test_from_files_merges_toml_and_json() {
        let base = FileObj::new(
            format!("memory://config-tests/{}/base.json", uuid::Uuid::new_v4()),
            None,
        )
        .unwrap();
        base.write(br#"{"target_dir": "memory://t.cube", "append_dim": "t"}"#)
            .unwrap();
        let over = base.parent().unwrap().child("over.toml");
        over.write(b"append_dim = \"step\"\nforce_new = true\n")
            .unwrap();

        let config = Config::from_files(&[base, over]).unwrap();
        assert_eq!(config.target_dir, "memory://t.cube");
        assert_eq!(config.append_dim, "step");
        assert!(config.force_new);
    }

    #[test]
    fn test_config_schema_has_required_target() {
        let schema = config_schema();
        let json = serde_json::to_value(&schema).unwrap();
        let required = json["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "target_dir"));
    }
}
