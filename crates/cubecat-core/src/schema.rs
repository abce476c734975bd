//! Cube schema derivation and slice validation.
//!
//! The cube schema is fixed when the cube is created: it is derived from
//! the first slice merged with the configuration (configuration wins),
//! and read back from the store afterwards. Every subsequent slice is
//! validated against it before anything is written.

use std::collections::BTreeMap;

use crate::config::{AppendStep, Config};
use crate::dataset::{Attrs, Compressor, DataType, Dataset, Encoding, Variable};
use crate::error::{Error, Result};

/// Storage schema of one cube variable.
#[derive(Debug, Clone)]
pub struct VariableSchema {
    pub dims: Vec<String>,
    /// Storage data type
    pub dtype: DataType,
    /// Chunk size per dimension
    pub chunks: Vec<usize>,
    pub fill_value: f64,
    pub scale_factor: Option<f64>,
    pub add_offset: Option<f64>,
    pub units: Option<String>,
    pub calendar: Option<String>,
    /// `None` means uncompressed chunks
    pub compressor: Option<Compressor>,
    pub attrs: Attrs,
}

impl VariableSchema {
    /// Index of the append dimension in this variable's dims, if any.
    pub fn append_axis(&self, append_dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == append_dim)
    }
}

/// The established schema of a cube.
#[derive(Debug, Clone)]
pub struct CubeSchema {
    pub append_dim: String,
    /// Sizes of the non-append dimensions
    pub fixed_dims: BTreeMap<String, usize>,
    /// Chunk size along the append dimension, shared by all variables
    /// that carry it
    pub append_chunk: usize,
    pub variables: BTreeMap<String, VariableSchema>,
}

/// Attribute keys that describe encoding rather than metadata; they are
/// lifted out of variable attributes during derivation.
const ENCODING_ATTR_KEYS: &[&str] = &[
    "scale_factor",
    "add_offset",
    "_FillValue",
    "fill_value",
    "units",
    "calendar",
];

/// The variable names of a slice that are kept after applying the
/// include/exclude filters.
pub fn kept_variable_names(config: &Config, slice: &Dataset) -> Vec<String> {
    slice
        .variables
        .keys()
        .filter(|name| {
            let included = config.included_variables.is_empty()
                || config.included_variables.iter().any(|n| n == *name);
            let excluded = config.excluded_variables.iter().any(|n| n == *name);
            included && !excluded
        })
        .cloned()
        .collect()
}

/// Derive the cube schema from the first slice and the configuration.
pub fn derive_schema(config: &Config, slice: &Dataset) -> Result<CubeSchema> {
    let slice_dims = slice.dims().map_err(reword_first_slice)?;

    let append_chunk = *slice_dims.get(&config.append_dim).ok_or_else(|| {
        Error::config(format!(
            "append dimension {:?} not found in first slice",
            config.append_dim
        ))
    })?;

    if let Some(fixed_dims) = &config.fixed_dims {
        for (dim, &size) in fixed_dims {
            match slice_dims.get(dim) {
                None => {
                    return Err(Error::config(format!(
                        "fixed dimension {dim:?} not found in first slice"
                    )));
                }
                Some(&actual) if actual as u64 != size => {
                    return Err(Error::config(format!(
                        "wrong size for fixed dimension {dim:?}: expected {size}, \
                         found {actual}"
                    )));
                }
                Some(_) => {}
            }
        }
    }

    let mut fixed_dims: BTreeMap<String, usize> = slice_dims;
    fixed_dims.remove(&config.append_dim);

    let mut variables = BTreeMap::new();
    for name in kept_variable_names(config, slice) {
        let variable = &slice.variables[&name];
        let schema = derive_variable_schema(config, &name, variable, append_chunk)?;
        variables.insert(name, schema);
    }

    for name in config.variables.keys() {
        if name != "*" && !slice.variables.contains_key(name) {
            tracing::warn!(
                "Configured variable {:?} not present in the first slice; ignoring it",
                name
            );
        }
    }

    Ok(CubeSchema {
        append_dim: config.append_dim.clone(),
        fixed_dims,
        append_chunk,
        variables,
    })
}

fn reword_first_slice(err: Error) -> Error {
    match err {
        Error::SliceSchema(msg) => Error::SliceSchema(format!("first slice: {msg}")),
        other => other,
    }
}

fn derive_variable_schema(
    config: &Config,
    name: &str,
    variable: &Variable,
    append_chunk: usize,
) -> Result<VariableSchema> {
    let var_config = config.variable_config(name);

    if let Some(config_dims) = &var_config.dims {
        if config_dims != &variable.dims {
            return Err(Error::config(format!(
                "dimension mismatch for variable {name:?}: expected {:?}, got {:?}",
                config_dims, variable.dims
            )));
        }
    }

    // Encoding precedence: explicit config > wildcard config > slice.
    // `variable_config` already merged the config layers.
    let (slice_encoding, attrs) = split_encoding_attrs(variable);
    let encoding = match &var_config.encoding {
        Some(config_encoding) => slice_encoding.merge_with(config_encoding),
        None => slice_encoding,
    };

    let dtype = match &encoding.dtype {
        Some(text) => DataType::parse(text)
            .map_err(|e| Error::config(format!("variable {name:?}: {e}")))?,
        None => variable.array.dtype(),
    };

    let append_axis = variable.dims.iter().position(|d| d == &config.append_dim);
    let chunks = resolve_chunks(
        name,
        &variable.dims,
        variable.array.shape(),
        append_axis,
        append_chunk,
        encoding.chunks.as_deref(),
    )?;

    let fill_value = encoding
        .fill_value
        .unwrap_or_else(|| dtype.default_fill());

    let compressor = match &encoding.compressor {
        Some(c) if c.is_none_codec() => None,
        other => other.clone(),
    };

    let mut attrs = attrs;
    for (key, value) in &var_config.attrs {
        attrs.insert(key.clone(), value.clone());
    }

    Ok(VariableSchema {
        dims: variable.dims.clone(),
        dtype,
        chunks,
        fill_value,
        scale_factor: encoding.scale_factor,
        add_offset: encoding.add_offset,
        units: encoding.units,
        calendar: encoding.calendar,
        compressor,
        attrs,
    })
}

/// Lift encoding-ish keys out of a slice variable's attributes, merge
/// them under the variable's declared encoding.
fn split_encoding_attrs(variable: &Variable) -> (Encoding, Attrs) {
    let mut encoding = variable.encoding.clone();
    let mut attrs = Attrs::new();
    for (key, value) in &variable.attrs {
        if !ENCODING_ATTR_KEYS.contains(&key.as_str()) {
            attrs.insert(key.clone(), value.clone());
            continue;
        }
        let number = value.as_f64();
        match (key.as_str(), number) {
            ("scale_factor", Some(n)) => {
                encoding.scale_factor.get_or_insert(n);
            }
            ("add_offset", Some(n)) => {
                encoding.add_offset.get_or_insert(n);
            }
            ("_FillValue" | "fill_value", Some(n)) => {
                encoding.fill_value.get_or_insert(n);
            }
            ("units", None) => {
                if let Some(text) = value.as_str() {
                    encoding
                        .units
                        .get_or_insert_with(|| text.to_string());
                }
            }
            ("calendar", None) => {
                if let Some(text) = value.as_str() {
                    encoding
                        .calendar
                        .get_or_insert_with(|| text.to_string());
                }
            }
            _ => {
                attrs.insert(key.clone(), value.clone());
            }
        }
    }
    (encoding, attrs)
}

fn resolve_chunks(
    name: &str,
    dims: &[String],
    shape: &[usize],
    append_axis: Option<usize>,
    append_chunk: usize,
    configured: Option<&[Option<u64>]>,
) -> Result<Vec<usize>> {
    if let Some(configured) = configured {
        if configured.len() != dims.len() {
            return Err(Error::config(format!(
                "variable {name:?}: {} chunk sizes given for {} dimensions",
                configured.len(),
                dims.len()
            )));
        }
    }
    let mut chunks = Vec::with_capacity(dims.len());
    for (axis, &dim_size) in shape.iter().enumerate() {
        let configured_chunk = configured
            .and_then(|c| c.get(axis).copied())
            .flatten()
            .map(|c| c as usize);
        let chunk = if Some(axis) == append_axis {
            // The append-axis chunk always equals the slice size; a
            // conflicting configured value is rejected, not reconciled.
            if let Some(configured_chunk) = configured_chunk {
                if configured_chunk != append_chunk {
                    return Err(Error::config(format!(
                        "variable {name:?}: append-axis chunk size {configured_chunk} \
                         conflicts with slice size {append_chunk}"
                    )));
                }
            }
            append_chunk
        } else {
            match configured_chunk {
                Some(chunk) => chunk,
                // Coordinates and unconfigured dims default to a single
                // chunk spanning the dimension.
                None => dim_size.max(1),
            }
        };
        chunks.push(chunk.max(1));
    }
    Ok(chunks)
}

/// State of an existing cube relevant to an append.
#[derive(Debug, Clone)]
pub struct CubeState {
    pub schema: CubeSchema,
    /// Current size along the append dimension
    pub append_size: usize,
    /// Decoded labels of the append coordinate, if present
    pub append_labels: Vec<f64>,
    /// Current group attributes
    pub attrs: Attrs,
}

/// Validate a slice against the established schema.
pub fn validate_slice(schema: &CubeSchema, slice: &Dataset) -> Result<()> {
    let slice_dims = slice.dims()?;

    let missing: Vec<&String> = schema
        .variables
        .keys()
        .filter(|name| !slice.variables.contains_key(*name))
        .collect();
    if !missing.is_empty() {
        return Err(Error::SliceSchema(format!(
            "missing variables: {}",
            missing
                .iter()
                .map(|n| format!("{n:?}"))
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    match slice_dims.get(&schema.append_dim) {
        None => {
            return Err(Error::SliceSchema(format!(
                "append dimension {:?} not found in slice",
                schema.append_dim
            )));
        }
        Some(&size) if size != schema.append_chunk => {
            return Err(Error::SliceShape(format!(
                "slice has size {size} along {:?}, but the cube's chunk size \
                 along the append dimension is {}",
                schema.append_dim, schema.append_chunk
            )));
        }
        Some(_) => {}
    }

    for (dim, &size) in &schema.fixed_dims {
        match slice_dims.get(dim) {
            None => {
                return Err(Error::SliceSchema(format!(
                    "dimension {dim:?} not found in slice"
                )));
            }
            Some(&actual) if actual != size => {
                return Err(Error::SliceSchema(format!(
                    "dimension {dim:?} has size {actual} in slice, expected {size}"
                )));
            }
            Some(_) => {}
        }
    }

    for (name, var_schema) in &schema.variables {
        let variable = &slice.variables[name];
        if variable.dims != var_schema.dims {
            return Err(Error::SliceSchema(format!(
                "variable {name:?} has dimensions {:?}, expected {:?}",
                variable.dims, var_schema.dims
            )));
        }
        if !variable.array.dtype().convertible_to(var_schema.dtype) {
            return Err(Error::SliceSchema(format!(
                "variable {name:?} has data type {}, which cannot be stored \
                 as {}",
                variable.array.dtype().name(),
                var_schema.dtype.name()
            )));
        }
    }

    Ok(())
}

/// Check the configured step constraint between the cube's last label
/// and the slice's first label.
pub fn check_append_step(
    step: &AppendStep,
    coord_units: Option<&str>,
    last_label: f64,
    first_new: f64,
) -> Result<()> {
    let delta = first_new - last_label;
    match step {
        AppendStep::Increasing => {
            if delta <= 0.0 {
                return Err(Error::AppendOrder(format!(
                    "append labels must be increasing, but {first_new} follows \
                     {last_label}"
                )));
            }
        }
        AppendStep::Decreasing => {
            if delta >= 0.0 {
                return Err(Error::AppendOrder(format!(
                    "append labels must be decreasing, but {first_new} follows \
                     {last_label}"
                )));
            }
        }
        AppendStep::Number(expected) => {
            if !deltas_equal(delta, *expected) {
                return Err(Error::AppendOrder(format!(
                    "expected append label step {expected}, got {delta}"
                )));
            }
        }
        AppendStep::Duration { seconds, text } => {
            let factor = units_to_seconds(coord_units).ok_or_else(|| {
                Error::config(format!(
                    "append_step {text:?} requires the append coordinate to \
                     carry time units such as \"seconds since …\""
                ))
            })?;
            let delta_seconds = delta * factor;
            if !deltas_equal(delta_seconds, *seconds) {
                return Err(Error::AppendOrder(format!(
                    "expected append label step {text}, got {delta_seconds} seconds"
                )));
            }
        }
    }
    Ok(())
}

fn deltas_equal(a: f64, b: f64) -> bool {
    let tolerance = 1e-6 * b.abs().max(1.0);
    (a - b).abs() <= tolerance
}

/// Seconds per unit for CF-style time units, `"<unit> since <epoch>"`.
fn units_to_seconds(units: Option<&str>) -> Option<f64> {
    let units = units?;
    let unit = units.split_whitespace().next()?;
    match unit {
        "seconds" | "second" => Some(1.0),
        "minutes" | "minute" => Some(60.0),
        "hours" | "hour" => Some(3600.0),
        "days" | "day" => Some(86400.0),
        _ => None,
    }
}
