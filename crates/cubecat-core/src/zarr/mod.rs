//! Minimal Zarr v2 group persistence, driven through the filesystem
//! facade.
//!
//! Only what the append engine needs: the group/array metadata
//! documents, `zlib`-or-nothing chunk compression, C order and
//! little-endian storage, and sparse chunk handling (all-fill chunks
//! are not written).

pub mod codec;
pub mod meta;
pub mod read;
pub mod write;

use std::ops::Range;

pub const ZGROUP_FILE: &str = ".zgroup";
pub const ZATTRS_FILE: &str = ".zattrs";
pub const ZARRAY_FILE: &str = ".zarray";
pub const ZMETADATA_FILE: &str = ".zmetadata";

/// Attribute naming the dimensions of an array, by convention.
pub const ARRAY_DIMENSIONS_ATTR: &str = "_ARRAY_DIMENSIONS";

/// File name of a chunk, e.g. `"0.2.1"`.
pub fn chunk_key(indices: &[usize]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// Number of chunks covering `size` elements.
pub fn chunk_count(size: usize, chunk: usize) -> usize {
    size.div_ceil(chunk)
}

/// All chunk index tuples for a shape, with one axis restricted to a
/// given chunk index range.
pub fn chunk_grid_range(
    shape: &[usize],
    chunks: &[usize],
    axis: Option<usize>,
    axis_range: Option<Range<usize>>,
) -> Vec<Vec<usize>> {
    let ranges: Vec<Range<usize>> = shape
        .iter()
        .zip(chunks)
        .enumerate()
        .map(|(i, (&size, &chunk))| {
            if Some(i) == axis {
                axis_range.clone().expect("axis range given with axis")
            } else {
                0..chunk_count(size, chunk)
            }
        })
        .collect();

    let mut indices = vec![Vec::new()];
    for range in ranges {
        let mut next = Vec::new();
        for prefix in &indices {
            for i in range.clone() {
                let mut index = prefix.clone();
                index.push(i);
                next.push(index);
            }
        }
        indices = next;
    }
    indices
}

/// All chunk index tuples for a shape.
pub fn chunk_grid(shape: &[usize], chunks: &[usize]) -> Vec<Vec<usize>> {
    chunk_grid_range(shape, chunks, None, None)
}

/// The element region a chunk covers, clipped to the array shape.
pub fn chunk_region(index: &[usize], shape: &[usize], chunks: &[usize]) -> Vec<Range<usize>> {
    index
        .iter()
        .zip(shape.iter().zip(chunks))
        .map(|(&i, (&size, &chunk))| {
            let start = i * chunk;
            start..(start + chunk).min(size)
        })
        .collect()
}
