//! Write-side helpers: chunk encoding and metadata consolidation.
//!
//! The append engine decides *where* bytes go and journals every
//! mutation; these helpers only produce the bytes.

use crate::dataset::array::pack;
use crate::dataset::Array;
use crate::error::Result;
use crate::fsutil::FileObj;
use crate::schema::VariableSchema;
use crate::zarr::{codec, ZARRAY_FILE, ZATTRS_FILE, ZGROUP_FILE};

/// Encode one chunk's worth of values for storage.
///
/// Applies packing and the storage dtype, pads edge chunks with the
/// fill value, and compresses. Returns `None` for all-fill chunks,
/// which are not written (sparse store).
pub fn encode_chunk(values: &Array, schema: &VariableSchema) -> Result<Option<Vec<u8>>> {
    let packed = pack(
        values,
        schema.dtype,
        schema.scale_factor,
        schema.add_offset,
        Some(schema.fill_value),
    )?;
    if packed.is_all(schema.fill_value) {
        return Ok(None);
    }
    let full = packed.embed(&schema.chunks, schema.fill_value)?;
    let bytes = codec::compress(full.data(), schema.compressor.as_ref())?;
    Ok(Some(bytes))
}

/// Write a dataset as a plain, unjournalled Zarr group: one chunk per
/// variable, no compression. Used for temporary slice stores and test
/// fixtures; the cube itself is only ever written through a
/// transaction.
pub fn write_dataset(dir: &FileObj, dataset: &crate::dataset::Dataset) -> Result<()> {
    use crate::zarr::meta::{zattrs_for_variable, ZArray, ZGroup};
    use crate::zarr::{chunk_grid, chunk_key, chunk_region};

    dir.child(ZGROUP_FILE).write_json(&ZGroup::default())?;
    if !dataset.attrs.is_empty() {
        dir.child(ZATTRS_FILE).write_json(&dataset.attrs)?;
    }
    for (name, variable) in &dataset.variables {
        let shape = variable.array.shape().to_vec();
        let schema = VariableSchema {
            dims: variable.dims.clone(),
            dtype: variable.array.dtype(),
            chunks: shape.iter().map(|&s| s.max(1)).collect(),
            fill_value: variable.array.dtype().default_fill(),
            scale_factor: None,
            add_offset: None,
            units: variable.encoding.units.clone(),
            calendar: variable.encoding.calendar.clone(),
            compressor: None,
            attrs: variable.attrs.clone(),
        };
        let var_dir = dir.child(name);
        var_dir
            .child(ZARRAY_FILE)
            .write_json(&ZArray::for_variable(&schema, &shape))?;
        var_dir
            .child(ZATTRS_FILE)
            .write_json(&zattrs_for_variable(&schema))?;
        for index in chunk_grid(&shape, &schema.chunks) {
            let region = chunk_region(&index, &shape, &schema.chunks);
            let values = variable.array.extract(&region)?;
            if let Some(bytes) = encode_chunk(&values, &schema)? {
                var_dir.child(&chunk_key(&index)).write(&bytes)?;
            }
        }
    }
    Ok(())
}

/// Build the consolidated `.zmetadata` document from the documents
/// currently in the store.
pub fn consolidated_metadata(dir: &FileObj) -> Result<serde_json::Value> {
    let mut metadata = serde_json::Map::new();
    for doc in [ZGROUP_FILE, ZATTRS_FILE] {
        let file = dir.child(doc);
        if file.exists()? {
            metadata.insert(doc.to_string(), file.read_json()?);
        }
    }
    for entry in dir.list()? {
        if !entry.is_dir()? {
            continue;
        }
        let name = entry.filename().to_string();
        for doc in [ZARRAY_FILE, ZATTRS_FILE] {
            let file = entry.child(doc);
            if file.exists()? {
                metadata.insert(format!("{name}/{doc}"), file.read_json()?);
            }
        }
    }
    Ok(serde_json::json!({
        "zarr_consolidated_format": 1,
        "metadata": metadata,
    }))
}
