//! Zarr v2 metadata documents.

use serde::{Deserialize, Serialize};

use crate::dataset::{Attrs, Compressor, DataType};
use crate::error::{Error, Result};
use crate::schema::VariableSchema;
use crate::zarr::ARRAY_DIMENSIONS_ATTR;

/// The `.zgroup` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZGroup {
    pub zarr_format: u8,
}

impl Default for ZGroup {
    fn default() -> Self {
        Self { zarr_format: 2 }
    }
}

/// Compressor entry of a `.zarray` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressorSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
}

/// The per-variable `.zarray` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZArray {
    pub zarr_format: u8,
    pub shape: Vec<u64>,
    pub chunks: Vec<u64>,
    pub dtype: String,
    pub compressor: Option<CompressorSpec>,
    pub fill_value: serde_json::Value,
    pub order: String,
    pub filters: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension_separator: Option<String>,
}

impl ZArray {
    /// Build the document for a variable schema at a given shape.
    pub fn for_variable(schema: &VariableSchema, shape: &[usize]) -> Self {
        Self {
            zarr_format: 2,
            shape: shape.iter().map(|&s| s as u64).collect(),
            chunks: schema.chunks.iter().map(|&c| c as u64).collect(),
            dtype: schema.dtype.zarr_code().to_string(),
            compressor: schema.compressor.as_ref().map(|c| CompressorSpec {
                id: c.id().to_string(),
                level: c.level(),
            }),
            fill_value: fill_value_to_json(schema.fill_value, schema.dtype),
            order: "C".to_string(),
            filters: None,
            dimension_separator: None,
        }
    }

    pub fn data_type(&self) -> Result<DataType> {
        DataType::parse(&self.dtype)
            .map_err(|_| Error::transaction(format!("unsupported stored dtype {:?}", self.dtype)))
    }

    pub fn shape_usize(&self) -> Vec<usize> {
        self.shape.iter().map(|&s| s as usize).collect()
    }

    pub fn chunks_usize(&self) -> Vec<usize> {
        self.chunks.iter().map(|&c| c as usize).collect()
    }

    pub fn compressor_config(&self) -> Option<Compressor> {
        self.compressor.as_ref().map(|c| Compressor::Spec {
            id: c.id.clone(),
            level: c.level,
        })
    }
}

/// Encode a fill value for JSON: non-finite floats become the strings
/// Zarr v2 uses, integral types use integer literals.
pub fn fill_value_to_json(fill: f64, dtype: DataType) -> serde_json::Value {
    if fill.is_nan() {
        return serde_json::Value::String("NaN".to_string());
    }
    if fill == f64::INFINITY {
        return serde_json::Value::String("Infinity".to_string());
    }
    if fill == f64::NEG_INFINITY {
        return serde_json::Value::String("-Infinity".to_string());
    }
    if dtype.is_float() {
        serde_json::json!(fill)
    } else {
        serde_json::json!(fill as i64)
    }
}

/// Decode a `.zarray` fill value.
pub fn fill_value_from_json(value: &serde_json::Value) -> Result<f64> {
    match value {
        serde_json::Value::Null => Ok(f64::NAN),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::transaction(format!("fill value out of range: {n}"))),
        serde_json::Value::String(s) => match s.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => Err(Error::transaction(format!(
                "unsupported fill value {other:?}"
            ))),
        },
        other => Err(Error::transaction(format!(
            "unsupported fill value {other}"
        ))),
    }
}

/// Build the `.zattrs` document of a variable: dimension names first,
/// then metadata attributes, then the encoding attributes readers use
/// to decode values.
pub fn zattrs_for_variable(schema: &VariableSchema) -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert(
        ARRAY_DIMENSIONS_ATTR.to_string(),
        serde_json::json!(schema.dims),
    );
    for (key, value) in &schema.attrs {
        attrs.insert(key.clone(), value.clone());
    }
    if let Some(units) = &schema.units {
        attrs.insert("units".to_string(), serde_json::json!(units));
    }
    if let Some(calendar) = &schema.calendar {
        attrs.insert("calendar".to_string(), serde_json::json!(calendar));
    }
    if let Some(scale) = schema.scale_factor {
        attrs.insert("scale_factor".to_string(), serde_json::json!(scale));
    }
    if let Some(offset) = schema.add_offset {
        attrs.insert("add_offset".to_string(), serde_json::json!(offset));
    }
    if schema.scale_factor.is_some() || schema.add_offset.is_some() {
        attrs.insert(
            "_FillValue".to_string(),
            fill_value_to_json(schema.fill_value, schema.dtype),
        );
    }
    attrs
}
