//! Read-side access to an existing cube: schema, sizes, and values.

use std::collections::BTreeMap;

use crate::dataset::array::{paste, unpack, with_element, Element};
use crate::dataset::{Array, Attrs};
use crate::error::{Error, Result};
use crate::fsutil::FileObj;
use crate::schema::{CubeSchema, CubeState, VariableSchema};
use crate::zarr::meta::{fill_value_from_json, ZArray};
use crate::zarr::{
    chunk_grid, chunk_key, chunk_region, codec, ARRAY_DIMENSIONS_ATTR, ZARRAY_FILE, ZATTRS_FILE,
    ZGROUP_FILE,
};

/// Whether a cube exists at the directory.
pub fn is_cube(dir: &FileObj) -> Result<bool> {
    dir.child(ZGROUP_FILE).exists()
}

/// The cube's group attributes, empty if none were written.
pub fn read_group_attrs(dir: &FileObj) -> Result<Attrs> {
    let file = dir.child(ZATTRS_FILE);
    if file.exists()? {
        file.read_json()
    } else {
        Ok(Attrs::new())
    }
}

/// Names of the variables stored in the cube.
pub fn variable_names(dir: &FileObj) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in dir.list()? {
        if entry.is_dir()? && entry.child(ZARRAY_FILE).exists()? {
            names.push(entry.filename().to_string());
        }
    }
    Ok(names)
}

/// Read a variable's schema and current shape from its documents.
pub fn read_variable_schema(dir: &FileObj, name: &str) -> Result<(VariableSchema, Vec<usize>)> {
    let var_dir = dir.child(name);
    let zarray: ZArray = var_dir.child(ZARRAY_FILE).read_json()?;

    let zattrs_file = var_dir.child(ZATTRS_FILE);
    let mut attrs: Attrs = if zattrs_file.exists()? {
        zattrs_file.read_json()?
    } else {
        Attrs::new()
    };

    let dims: Vec<String> = match attrs.remove(ARRAY_DIMENSIONS_ATTR) {
        Some(value) => serde_json::from_value(value).map_err(|e| {
            Error::transaction(format!("invalid dimension names for {name:?}: {e}"))
        })?,
        None => {
            return Err(Error::transaction(format!(
                "missing {ARRAY_DIMENSIONS_ATTR} for variable {name:?}"
            )));
        }
    };

    let scale_factor = take_number(&mut attrs, "scale_factor");
    let add_offset = take_number(&mut attrs, "add_offset");
    attrs.remove("_FillValue");
    let units = take_string(&mut attrs, "units");
    let calendar = take_string(&mut attrs, "calendar");

    let schema = VariableSchema {
        dims,
        dtype: zarray.data_type()?,
        chunks: zarray.chunks_usize(),
        fill_value: fill_value_from_json(&zarray.fill_value)?,
        scale_factor,
        add_offset,
        units,
        calendar,
        compressor: zarray.compressor_config(),
        attrs,
    };
    Ok((schema, zarray.shape_usize()))
}

fn take_number(attrs: &mut Attrs, key: &str) -> Option<f64> {
    let number = attrs.get(key).and_then(|v| v.as_f64());
    if number.is_some() {
        attrs.remove(key);
    }
    number
}

fn take_string(attrs: &mut Attrs, key: &str) -> Option<String> {
    let text = attrs
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if text.is_some() {
        attrs.remove(key);
    }
    text
}

/// Read a variable's full storage values, assembling chunks. Chunks
/// that were never written read as fill values.
pub fn read_variable_values(dir: &FileObj, name: &str) -> Result<(VariableSchema, Array)> {
    let (schema, shape) = read_variable_schema(dir, name)?;
    let var_dir = dir.child(name);
    let chunk_elems: usize = schema.chunks.iter().product();

    let array = with_element!(schema.dtype, T => {
        let fill = T::from_f64(schema.fill_value);
        let mut full: Vec<T> = vec![fill; shape.iter().product()];
        for index in chunk_grid(&shape, &schema.chunks) {
            let file = var_dir.child(&chunk_key(&index));
            if !file.exists()? {
                continue;
            }
            let raw = file.read()?;
            let bytes = codec::decompress(
                &raw,
                schema.compressor.as_ref(),
                chunk_elems * schema.dtype.size(),
            )?;
            let chunk = Array::try_new(schema.dtype, schema.chunks.clone(), bytes)?;
            let region = chunk_region(&index, &shape, &schema.chunks);
            let covered: Vec<usize> = region.iter().map(|r| r.end - r.start).collect();
            let chunk = if covered != schema.chunks {
                chunk.extract(&covered.iter().map(|&n| 0..n).collect::<Vec<_>>())?
            } else {
                chunk
            };
            let src: Vec<T> = chunk.elems()?;
            paste(&mut full, &shape, &region, &src)?;
        }
        Array::from_vec(shape.clone(), full)?
    });
    Ok((schema, array))
}

/// Read a variable and decode it: packed values are widened to f64 with
/// fill mapped back to NaN.
pub fn read_variable_decoded(dir: &FileObj, name: &str) -> Result<(VariableSchema, Array)> {
    let (schema, values) = read_variable_values(dir, name)?;
    if schema.scale_factor.is_some() || schema.add_offset.is_some() {
        let decoded = unpack(
            &values,
            schema.scale_factor,
            schema.add_offset,
            Some(schema.fill_value),
        );
        Ok((schema, decoded))
    } else {
        Ok((schema, values))
    }
}

/// Open a stored group as an in-memory dataset: values decoded, the
/// store's encoding carried along as hints for schema derivation.
pub fn open_dataset(dir: &FileObj) -> Result<crate::dataset::Dataset> {
    use crate::dataset::{Encoding, Variable};

    let mut dataset = crate::dataset::Dataset::new();
    dataset.attrs = read_group_attrs(dir)?;
    for name in variable_names(dir)? {
        let (schema, values) = read_variable_decoded(dir, &name)?;
        let encoding = Encoding {
            dtype: Some(schema.dtype.zarr_code().to_string()),
            chunks: Some(schema.chunks.iter().map(|&c| Some(c as u64)).collect()),
            fill_value: if schema.fill_value.is_nan() {
                None
            } else {
                Some(schema.fill_value)
            },
            scale_factor: schema.scale_factor,
            add_offset: schema.add_offset,
            units: schema.units.clone(),
            calendar: schema.calendar.clone(),
            compressor: schema.compressor.clone(),
            filters: None,
        };
        let variable = Variable::new(schema.dims.clone(), values)
            .with_encoding(encoding)
            .with_attrs(schema.attrs.clone());
        dataset.add_variable(name, variable)?;
    }
    Ok(dataset)
}

/// Read the cube state needed for an append: schema, current append
/// size and the append coordinate labels.
pub fn read_state(dir: &FileObj, append_dim: &str) -> Result<CubeState> {
    let names = variable_names(dir)?;
    if names.is_empty() {
        return Err(Error::transaction(format!(
            "no variables found in cube {}",
            dir.uri()
        )));
    }

    let mut variables = BTreeMap::new();
    let mut fixed_dims: BTreeMap<String, usize> = BTreeMap::new();
    let mut append_size: Option<usize> = None;
    let mut append_chunk: Option<usize> = None;

    for name in &names {
        let (schema, shape) = read_variable_schema(dir, name)?;
        for (axis, (dim, &size)) in schema.dims.iter().zip(&shape).enumerate() {
            if dim == append_dim {
                match append_size {
                    Some(existing) if existing != size => {
                        return Err(Error::transaction(format!(
                            "inconsistent append sizes in cube: variable {name:?} \
                             has {size}, expected {existing}"
                        )));
                    }
                    _ => append_size = Some(size),
                }
                let chunk = schema.chunks[axis];
                match append_chunk {
                    Some(existing) if existing != chunk => {
                        return Err(Error::transaction(format!(
                            "inconsistent append chunking in cube: variable \
                             {name:?} has {chunk}, expected {existing}"
                        )));
                    }
                    _ => append_chunk = Some(chunk),
                }
            } else {
                fixed_dims.insert(dim.clone(), size);
            }
        }
        variables.insert(name.clone(), schema);
    }

    let (Some(append_size), Some(append_chunk)) = (append_size, append_chunk) else {
        return Err(Error::transaction(format!(
            "cube {} has no variable with append dimension {append_dim:?}",
            dir.uri()
        )));
    };

    let append_labels = if names.iter().any(|n| n == append_dim) {
        let (_, decoded) = read_variable_decoded(dir, append_dim)?;
        decoded.to_f64_vec()
    } else {
        Vec::new()
    };

    Ok(CubeState {
        schema: CubeSchema {
            append_dim: append_dim.to_string(),
            fixed_dims,
            append_chunk,
            variables,
        },
        append_size,
        append_labels,
        attrs: read_group_attrs(dir)?,
    })
}
