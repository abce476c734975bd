//! Storage data types and their Zarr v2 codes.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Element type of an array, in storage terms.
///
/// Serialized with the Zarr v2 dtype codes; the human-readable names
/// (`"float32"`, `"int16"`, …) are accepted on input as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl DataType {
    /// Element size in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::Bool | DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
        }
    }

    /// Zarr v2 dtype code, little-endian for multi-byte types.
    pub const fn zarr_code(self) -> &'static str {
        match self {
            DataType::Bool => "|b1",
            DataType::Int8 => "|i1",
            DataType::Int16 => "<i2",
            DataType::Int32 => "<i4",
            DataType::Int64 => "<i8",
            DataType::UInt8 => "|u1",
            DataType::UInt16 => "<u2",
            DataType::UInt32 => "<u4",
            DataType::UInt64 => "<u8",
            DataType::Float32 => "<f4",
            DataType::Float64 => "<f8",
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// Parse either a Zarr dtype code or a human-readable name.
    pub fn parse(s: &str) -> Result<Self> {
        let dtype = match s {
            "|b1" | "bool" => DataType::Bool,
            "|i1" | "int8" | "i1" => DataType::Int8,
            "<i2" | "int16" | "i2" => DataType::Int16,
            "<i4" | "int32" | "i4" => DataType::Int32,
            "<i8" | "int64" | "i8" => DataType::Int64,
            "|u1" | "uint8" | "u1" => DataType::UInt8,
            "<u2" | "uint16" | "u2" => DataType::UInt16,
            "<u4" | "uint32" | "u4" => DataType::UInt32,
            "<u8" | "uint64" | "u8" => DataType::UInt64,
            "<f4" | "float32" | "f4" => DataType::Float32,
            "<f8" | "float64" | "f8" => DataType::Float64,
            other => {
                return Err(Error::config(format!("unsupported data type {other:?}")));
            }
        };
        Ok(dtype)
    }

    /// Whether values of this type can be stored as `target`, possibly
    /// through packing. Numeric types are mutually convertible via the
    /// f64 path; bool only maps to itself.
    pub fn convertible_to(self, target: DataType) -> bool {
        match (self, target) {
            (DataType::Bool, DataType::Bool) => true,
            (DataType::Bool, _) | (_, DataType::Bool) => false,
            _ => true,
        }
    }

    /// Default fill value when neither slice nor configuration provide
    /// one: NaN for floats, zero otherwise.
    pub fn default_fill(self) -> f64 {
        if self.is_float() {
            f64::NAN
        } else {
            0.0
        }
    }
}

impl Serialize for DataType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.zarr_code())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DataType::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zarr_code_roundtrip() {
        for dtype in [
            DataType::Bool,
            DataType::Int8,
            DataType::Int16,
            DataType::Int32,
            DataType::Int64,
            DataType::UInt8,
            DataType::UInt16,
            DataType::UInt32,
            DataType::UInt64,
            DataType::Float32,
            DataType::Float64,
        ] {
            assert_eq!(DataType::parse(dtype.zarr_code()).unwrap(), dtype);
            assert_eq!(DataType::parse(dtype.name()).unwrap(), dtype);
        }
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(DataType::parse("complex64").is_err());
        assert!(DataType::parse("<U12").is_err());
    }

    #[test]
    fn test_convertible() {
        assert!(DataType::Float64.convertible_to(DataType::Int16));
        assert!(DataType::Int32.convertible_to(DataType::Float32));
        assert!(!DataType::Bool.convertible_to(DataType::Int8));
        assert!(DataType::Bool.convertible_to(DataType::Bool));
    }

    #[test]
    fn test_default_fill() {
        assert!(DataType::Float32.default_fill().is_nan());
        assert_eq!(DataType::Int32.default_fill(), 0.0);
    }

    #[test]
    fn test_serde_uses_zarr_code() {
        let json = serde_json::to_string(&DataType::Float32).unwrap();
        assert_eq!(json, "\"<f4\"");
        let back: DataType = serde_json::from_str("\"float64\"").unwrap();
        assert_eq!(back, DataType::Float64);
    }
}
