//! Typed n-dimensional arrays over contiguous little-endian buffers.
//!
//! Buffers are held as [`bytes::Bytes`] and decoded into typed vectors
//! on demand, so no alignment assumptions are made about the raw data.

use std::ops::Range;

use bytes::Bytes;
use ndarray::{ArrayViewD, ArrayViewMutD, IxDyn, Slice};

use crate::dataset::dtype::DataType;
use crate::error::{Error, Result};

/// Element types an [`Array`] can hold.
pub trait Element: Copy + PartialEq + 'static {
    const DTYPE: DataType;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut Vec<u8>);
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
}

macro_rules! impl_numeric_element {
    ($($t:ty => $dtype:expr),* $(,)?) => {
        $(
            impl Element for $t {
                const DTYPE: DataType = $dtype;

                fn read_le(bytes: &[u8]) -> Self {
                    <$t>::from_le_bytes(bytes.try_into().expect("element byte width"))
                }

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn from_f64(v: f64) -> Self {
                    v as $t
                }
            }
        )*
    };
}

impl_numeric_element!(
    i8 => DataType::Int8,
    i16 => DataType::Int16,
    i32 => DataType::Int32,
    i64 => DataType::Int64,
    u8 => DataType::UInt8,
    u16 => DataType::UInt16,
    u32 => DataType::UInt32,
    u64 => DataType::UInt64,
    f32 => DataType::Float32,
    f64 => DataType::Float64,
);

impl Element for bool {
    const DTYPE: DataType = DataType::Bool;

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }

    fn to_f64(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }

    fn from_f64(v: f64) -> Self {
        v != 0.0
    }
}

/// Dispatch a block over the concrete element type of a `DataType`.
macro_rules! with_element {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            $crate::dataset::dtype::DataType::Bool => {
                type $t = bool;
                $body
            }
            $crate::dataset::dtype::DataType::Int8 => {
                type $t = i8;
                $body
            }
            $crate::dataset::dtype::DataType::Int16 => {
                type $t = i16;
                $body
            }
            $crate::dataset::dtype::DataType::Int32 => {
                type $t = i32;
                $body
            }
            $crate::dataset::dtype::DataType::Int64 => {
                type $t = i64;
                $body
            }
            $crate::dataset::dtype::DataType::UInt8 => {
                type $t = u8;
                $body
            }
            $crate::dataset::dtype::DataType::UInt16 => {
                type $t = u16;
                $body
            }
            $crate::dataset::dtype::DataType::UInt32 => {
                type $t = u32;
                $body
            }
            $crate::dataset::dtype::DataType::UInt64 => {
                type $t = u64;
                $body
            }
            $crate::dataset::dtype::DataType::Float32 => {
                type $t = f32;
                $body
            }
            $crate::dataset::dtype::DataType::Float64 => {
                type $t = f64;
                $body
            }
        }
    };
}

pub(crate) use with_element;

/// An n-dimensional array: dtype, shape and a little-endian buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    dtype: DataType,
    shape: Vec<usize>,
    data: Bytes,
}

impl Array {
    /// Create an array, validating buffer length against dtype and shape.
    pub fn try_new(dtype: DataType, shape: Vec<usize>, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let expected = shape.iter().product::<usize>() * dtype.size();
        if data.len() != expected {
            return Err(Error::internal(format!(
                "array buffer has {} bytes, expected {} for shape {:?} and dtype {}",
                data.len(),
                expected,
                shape,
                dtype.name(),
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    /// Create an array from typed values.
    pub fn from_vec<T: Element>(shape: Vec<usize>, values: Vec<T>) -> Result<Self> {
        if shape.iter().product::<usize>() != values.len() {
            return Err(Error::internal(format!(
                "{} values do not fill shape {:?}",
                values.len(),
                shape
            )));
        }
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.size());
        for v in values {
            v.write_le(&mut data);
        }
        Ok(Self {
            dtype: T::DTYPE,
            shape,
            data: Bytes::from(data),
        })
    }

    /// Create an array filled with a single value.
    pub fn filled(dtype: DataType, shape: Vec<usize>, fill: f64) -> Self {
        with_element!(dtype, T => {
            let value = T::from_f64(fill);
            let len = shape.iter().product();
            Array::from_vec(shape, vec![value; len]).expect("shape matches value count")
        })
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Decode the buffer into typed values; the dtype must match `T`.
    pub fn elems<T: Element>(&self) -> Result<Vec<T>> {
        if self.dtype != T::DTYPE {
            return Err(Error::internal(format!(
                "requested {} elements from {} array",
                T::DTYPE.name(),
                self.dtype.name()
            )));
        }
        let size = self.dtype.size();
        Ok(self
            .data
            .chunks_exact(size)
            .map(|chunk| T::read_le(chunk))
            .collect())
    }

    /// All values widened to f64.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        with_element!(self.dtype, T => {
            self.elems::<T>()
                .expect("dtype dispatch matches")
                .into_iter()
                .map(Element::to_f64)
                .collect()
        })
    }

    /// Build an array of the given dtype from f64 values.
    pub fn from_f64_slice(dtype: DataType, shape: Vec<usize>, values: &[f64]) -> Result<Self> {
        with_element!(dtype, T => {
            let typed: Vec<T> = values.iter().map(|&v| T::from_f64(v)).collect();
            Array::from_vec(shape, typed)
        })
    }

    /// Convert to another dtype through the f64 path. Identity types are
    /// returned as a cheap clone.
    pub fn cast(&self, dtype: DataType) -> Result<Self> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }
        if !self.dtype.convertible_to(dtype) {
            return Err(Error::internal(format!(
                "cannot convert {} array to {}",
                self.dtype.name(),
                dtype.name()
            )));
        }
        Array::from_f64_slice(dtype, self.shape.clone(), &self.to_f64_vec())
    }

    /// Copy out a hyper-rectangular region.
    pub fn extract(&self, region: &[Range<usize>]) -> Result<Self> {
        if region.len() != self.shape.len() {
            return Err(Error::internal(format!(
                "region rank {} does not match array rank {}",
                region.len(),
                self.shape.len()
            )));
        }
        for (r, &dim) in region.iter().zip(&self.shape) {
            if r.start > r.end || r.end > dim {
                return Err(Error::internal(format!(
                    "region {:?} out of bounds for shape {:?}",
                    region, self.shape
                )));
            }
        }
        let out_shape: Vec<usize> = region.iter().map(|r| r.end - r.start).collect();
        with_element!(self.dtype, T => {
            let elems: Vec<T> = self.elems()?;
            let view = ArrayViewD::from_shape(IxDyn(&self.shape), elems.as_slice())
                .map_err(|e| Error::internal(format!("shape error: {e}")))?;
            let sub = view.slice_each_axis(|ax| {
                let r = &region[ax.axis.index()];
                Slice::new(r.start as isize, Some(r.end as isize), 1)
            });
            let values: Vec<T> = sub.iter().copied().collect();
            Array::from_vec(out_shape, values)
        })
    }

    /// Pad this array up to `shape` with `fill`, keeping the existing
    /// data at the origin. Used for edge chunks.
    pub fn embed(&self, shape: &[usize], fill: f64) -> Result<Self> {
        if shape == self.shape.as_slice() {
            return Ok(self.clone());
        }
        if shape.len() != self.shape.len()
            || shape.iter().zip(&self.shape).any(|(&big, &small)| big < small)
        {
            return Err(Error::internal(format!(
                "cannot embed shape {:?} into {:?}",
                self.shape, shape
            )));
        }
        with_element!(self.dtype, T => {
            let mut full = vec![T::from_f64(fill); shape.iter().product()];
            let region: Vec<Range<usize>> = self.shape.iter().map(|&n| 0..n).collect();
            let src: Vec<T> = self.elems()?;
            paste(&mut full, shape, &region, &src)?;
            Array::from_vec(shape.to_vec(), full)
        })
    }

    /// Whether every element equals `value` (NaN matches NaN).
    pub fn is_all(&self, value: f64) -> bool {
        with_element!(self.dtype, T => {
            self.elems::<T>()
                .expect("dtype dispatch matches")
                .iter()
                .all(|v| {
                    let f = v.to_f64();
                    f == value || (f.is_nan() && value.is_nan())
                })
        })
    }
}

/// Write `src` values into the given region of a flat destination buffer.
pub fn paste<T: Element>(
    dst: &mut [T],
    dst_shape: &[usize],
    region: &[Range<usize>],
    src: &[T],
) -> Result<()> {
    let src_shape: Vec<usize> = region.iter().map(|r| r.end - r.start).collect();
    let mut view = ArrayViewMutD::from_shape(IxDyn(dst_shape), dst)
        .map_err(|e| Error::internal(format!("shape error: {e}")))?;
    let mut sub = view.slice_each_axis_mut(|ax| {
        let r = &region[ax.axis.index()];
        Slice::new(r.start as isize, Some(r.end as isize), 1)
    });
    let src_view = ArrayViewD::from_shape(IxDyn(&src_shape), src)
        .map_err(|e| Error::internal(format!("shape error: {e}")))?;
    sub.assign(&src_view);
    Ok(())
}

/// Convert values for storage: optional scale/offset packing, NaN
/// replaced by the fill value, then cast to the storage dtype.
///
/// Packing follows the CF convention `decoded = scale * stored + offset`,
/// so storing computes `stored = (decoded - offset) / scale`.
pub fn pack(
    array: &Array,
    storage: DataType,
    scale: Option<f64>,
    offset: Option<f64>,
    fill: Option<f64>,
) -> Result<Array> {
    if scale.is_none() && offset.is_none() {
        if array.dtype() == storage {
            return Ok(array.clone());
        }
        if storage.is_float() || !array.dtype().is_float() {
            return array.cast(storage);
        }
        // Float values stored as integers without packing: NaN still
        // maps to the fill value, not to a cast artifact.
        let fill = fill.unwrap_or_else(|| storage.default_fill());
        let values: Vec<f64> = array
            .to_f64_vec()
            .into_iter()
            .map(|v| if v.is_nan() { fill } else { v.round() })
            .collect();
        return Array::from_f64_slice(storage, array.shape().to_vec(), &values);
    }
    let scale = scale.unwrap_or(1.0);
    let offset = offset.unwrap_or(0.0);
    let fill = fill.unwrap_or_else(|| storage.default_fill());
    let packed: Vec<f64> = array
        .to_f64_vec()
        .into_iter()
        .map(|v| {
            if v.is_nan() {
                fill
            } else {
                let stored = (v - offset) / scale;
                if storage.is_float() {
                    stored
                } else {
                    stored.round()
                }
            }
        })
        .collect();
    Array::from_f64_slice(storage, array.shape().to_vec(), &packed)
}

/// Reverse of [`pack`]: widen to f64, map fill back to NaN, apply
/// scale/offset.
pub fn unpack(array: &Array, scale: Option<f64>, offset: Option<f64>, fill: Option<f64>) -> Array {
    if scale.is_none() && offset.is_none() {
        return array.clone();
    }
    let scale = scale.unwrap_or(1.0);
    let offset = offset.unwrap_or(0.0);
    let values: Vec<f64> = array
        .to_f64_vec()
        .into_iter()
        .map(|v| {
            let is_fill = match fill {
                Some(f) => v == f || (v.is_nan() && f.is_nan()),
                None => false,
            };
            if is_fill {
                f64::NAN
            } else {
                scale * v + offset
            }
        })
        .collect();
    Array::from_f64_slice(DataType::Float64, array.shape().to_vec(), &values)
        .expect("shape unchanged")
}
