//! In-memory dataset model: variables, dimensions, encodings.
//!
//! This is the representation slices arrive in and the cube is read
//! back into. It is deliberately small: named variables over named
//! dimensions, plus free-form attributes at both levels.

pub mod array;
pub mod dtype;

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use array::Array;
pub use dtype::DataType;

/// Free-form JSON attributes, insertion-ordered.
pub type Attrs = serde_json::Map<String, serde_json::Value>;

/// A compressor reference: either a bare codec name or a spec with
/// parameters. `"none"` and `"null"` disable compression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Compressor {
    Name(String),
    Spec {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<u32>,
    },
}

impl Compressor {
    pub fn id(&self) -> &str {
        match self {
            Compressor::Name(name) => name,
            Compressor::Spec { id, .. } => id,
        }
    }

    pub fn level(&self) -> Option<u32> {
        match self {
            Compressor::Name(_) => None,
            Compressor::Spec { level, .. } => *level,
        }
    }

    /// Whether this reference means "no compression".
    pub fn is_none_codec(&self) -> bool {
        matches!(self.id(), "none" | "null")
    }
}

/// Per-variable storage encoding.
///
/// In configuration this appears under `variables.<name>.encoding`;
/// slice datasets may carry the same fields, with configuration taking
/// precedence (see the schema derivation rules).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Encoding {
    /// Storage data type (Zarr code or name, e.g. `"int16"`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    /// Chunk sizes per dimension; `null` entries mean "dimension size"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<Option<u64>>>,
    /// Storage fill value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_value: Option<f64>,
    /// Packing: `decoded = scale_factor * stored + add_offset`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_offset: Option<f64>,
    /// Units of the values, e.g. `"days since 2020-01-01"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressor: Option<Compressor>,
    /// Pre-compression filters; must be empty, kept for schema
    /// compatibility
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<serde_json::Value>>,
}

impl Encoding {
    /// Merge with another encoding, where `other` takes precedence for
    /// set values.
    pub fn merge_with(&self, other: &Encoding) -> Encoding {
        Encoding {
            dtype: other.dtype.clone().or_else(|| self.dtype.clone()),
            chunks: other.chunks.clone().or_else(|| self.chunks.clone()),
            fill_value: other.fill_value.or(self.fill_value),
            scale_factor: other.scale_factor.or(self.scale_factor),
            add_offset: other.add_offset.or(self.add_offset),
            units: other.units.clone().or_else(|| self.units.clone()),
            calendar: other.calendar.clone().or_else(|| self.calendar.clone()),
            compressor: other
                .compressor
                .clone()
                .or_else(|| self.compressor.clone()),
            filters: other.filters.clone().or_else(|| self.filters.clone()),
        }
    }
}

/// A named variable: dimension names, data, and metadata.
#[derive(Debug, Clone)]
pub struct Variable {
    pub dims: Vec<String>,
    pub array: Array,
    pub encoding: Encoding,
    pub attrs: Attrs,
}

impl Variable {
    pub fn new(dims: Vec<String>, array: Array) -> Self {
        Self {
            dims,
            array,
            encoding: Encoding::default(),
            attrs: Attrs::new(),
        }
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_attrs(mut self, attrs: Attrs) -> Self {
        self.attrs = attrs;
        self
    }
}

/// A dataset: variables plus group attributes.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub variables: BTreeMap<String, Variable>,
    pub attrs: Attrs,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a variable, checking its rank against its dimension list.
    pub fn add_variable(&mut self, name: impl Into<String>, variable: Variable) -> Result<()> {
        let name = name.into();
        if variable.dims.len() != variable.array.shape().len() {
            return Err(Error::SliceSchema(format!(
                "variable {:?} declares {} dimensions but has rank {}",
                name,
                variable.dims.len(),
                variable.array.shape().len()
            )));
        }
        self.variables.insert(name, variable);
        Ok(())
    }

    /// Dimension sizes across all variables; inconsistent sizes for the
    /// same dimension name are a schema error.
    pub fn dims(&self) -> Result<BTreeMap<String, usize>> {
        let mut dims: BTreeMap<String, usize> = BTreeMap::new();
        for (var_name, variable) in &self.variables {
            for (dim_name, &size) in variable.dims.iter().zip(variable.array.shape()) {
                match dims.get(dim_name) {
                    Some(&existing) if existing != size => {
                        return Err(Error::SliceSchema(format!(
                            "dimension {dim_name:?} has size {size} in variable \
                             {var_name:?} but size {existing} elsewhere"
                        )));
                    }
                    _ => {
                        dims.insert(dim_name.clone(), size);
                    }
                }
            }
        }
        Ok(dims)
    }

    pub fn dim_size(&self, dim: &str) -> Option<usize> {
        for variable in self.variables.values() {
            if let Some(pos) = variable.dims.iter().position(|d| d == dim) {
                return Some(variable.array.shape()[pos]);
            }
        }
        None
    }

    /// A coordinate variable is named after its only dimension.
    pub fn is_coordinate(name: &str, variable: &Variable) -> bool {
        variable.dims.len() == 1 && variable.dims[0] == name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dataset() -> Dataset {
        let mut ds = Dataset::new();
        ds.add_variable(
            "t",
            Variable::new(
                vec!["t".to_string()],
                Array::from_vec(vec![1], vec![0i64]).unwrap(),
            ),
        )
        .unwrap();
        ds.add_variable(
            "v",
            Variable::new(
                vec!["t".to_string(), "y".to_string(), "x".to_string()],
                Array::filled(DataType::Float32, vec![1, 4, 4], 1.0),
            ),
        )
        .unwrap();
        ds
    }

    #[test]
    fn test_dims_collects_sizes() {
        let ds = sample_dataset();
        let dims = ds.dims().unwrap();
        assert_eq!(dims.get("t"), Some(&1));
        assert_eq!(dims.get("x"), Some(&4));
        assert_eq!(dims.get("y"), Some(&4));
    }

    #[test]
    fn test_dims_rejects_inconsistent_sizes() {
        let mut ds = sample_dataset();
        ds.add_variable(
            "w",
            Variable::new(
                vec!["x".to_string()],
                Array::filled(DataType::Float32, vec![5], 0.0),
            ),
        )
        .unwrap();
        assert!(ds.dims().is_err());
    }

    #[test]
    fn test_add_variable_checks_rank() {
        let mut ds = Dataset::new();
        let result = ds.add_variable(
            "v",
            Variable::new(
                vec!["t".to_string()],
                Array::filled(DataType::Float32, vec![1, 2], 0.0),
            ),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_is_coordinate() {
        let ds = sample_dataset();
        assert!(Dataset::is_coordinate("t", &ds.variables["t"]));
        assert!(!Dataset::is_coordinate("v", &ds.variables["v"]));
    }

    #[test]
    fn test_compressor_accepts_name_or_spec() {
        let c: Compressor = serde_json::from_str("\"zlib\"").unwrap();
        assert_eq!(c.id(), "zlib");
        assert_eq!(c.level(), None);

        let c: Compressor = serde_json::from_str(r#"{"id": "zlib", "level": 6}"#).unwrap();
        assert_eq!(c.id(), "zlib");
        assert_eq!(c.level(), Some(6));

        let c: Compressor = serde_json::from_str("\"none\"").unwrap();
        assert!(c.is_none_codec());
    }

    #[test]
    fn test_encoding_merge_prefers_other() {
        let base = Encoding {
            dtype: Some("float32".to_string()),
            fill_value: Some(-1.0),
            ..Default::default()
        };
        let over = Encoding {
            dtype: Some("int16".to_string()),
            scale_factor: Some(0.1),
            ..Default::default()
        };
        let merged = base.merge_with(&over);
        assert_eq!(merged.dtype.as_deref(), Some("int16"));
        assert_eq!(merged.fill_value, Some(-1.0));
        assert_eq!(merged.scale_factor, Some(0.1));
    }
}
