//! Array data and metadata that flow through the graph.
//!
//! The buffer type uses an enum over element types for several reasons:
//! - Closed set of types: scientific volumes use a handful of numeric dtypes
//! - Slots can be wired and checked from metadata alone, before any data exists
//! - Exhaustive matching catches a missing dtype at compile time

use crate::core::error::{ExecutionError, ExecutionResult};
use crate::core::roi::Roi;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// Unsigned 8-bit integer
    U8,
    /// Unsigned 16-bit integer
    U16,
    /// Unsigned 32-bit integer
    U32,
    /// Unsigned 64-bit integer
    U64,
    /// Signed 32-bit integer
    I32,
    /// Signed 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::U8 => 1,
            DType::U16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }

    /// Short lowercase name (e.g. "u8").
    pub fn name(&self) -> &'static str {
        match self {
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::U32 => "u32",
            DType::U64 => "u64",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    /// Whether this is a floating point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape, dtype and axis tags of the array a slot carries.
///
/// Slots resolve this lazily from their upstream partner; a slot without
/// metadata is "not ready".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayMeta {
    /// Extent of each axis
    pub shape: Vec<usize>,
    /// Element type
    pub dtype: DType,
    /// Axis labels such as "zyxc", one character per axis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axistags: Option<String>,
}

impl ArrayMeta {
    /// Metadata for an untagged array.
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
            axistags: None,
        }
    }

    /// Attach axis labels.
    pub fn with_axistags(mut self, tags: impl Into<String>) -> Self {
        self.axistags = Some(tags.into());
        self
    }

    /// Number of axes.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Size of the full array in bytes.
    pub fn nbytes(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.size_in_bytes()
    }

    /// ROI covering the whole array.
    pub fn full_roi(&self) -> Roi {
        Roi::from_shape(&self.shape)
    }
}

/// A dense, owned N-dimensional array of one of the supported dtypes.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayBuffer {
    /// u8 elements
    U8(ArrayD<u8>),
    /// u16 elements
    U16(ArrayD<u16>),
    /// u32 elements
    U32(ArrayD<u32>),
    /// u64 elements
    U64(ArrayD<u64>),
    /// i32 elements
    I32(ArrayD<i32>),
    /// i64 elements
    I64(ArrayD<i64>),
    /// f32 elements
    F32(ArrayD<f32>),
    /// f64 elements
    F64(ArrayD<f64>),
}

/// Rust element types that can live in an [`ArrayBuffer`].
pub trait Element: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// The matching dtype tag.
    const DTYPE: DType;

    /// Wrap a typed array.
    fn into_buffer(array: ArrayD<Self>) -> ArrayBuffer;

    /// Borrow the typed array if the dtype matches.
    fn view(buffer: &ArrayBuffer) -> Option<&ArrayD<Self>>;

    /// Mutably borrow the typed array if the dtype matches.
    fn view_mut(buffer: &mut ArrayBuffer) -> Option<&mut ArrayD<Self>>;

    /// Take the typed array out, handing the buffer back on dtype mismatch.
    fn unwrap_buffer(buffer: ArrayBuffer) -> Result<ArrayD<Self>, ArrayBuffer>;
}

macro_rules! impl_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = DType::$variant;

                fn into_buffer(array: ArrayD<Self>) -> ArrayBuffer {
                    ArrayBuffer::$variant(array)
                }

                fn view(buffer: &ArrayBuffer) -> Option<&ArrayD<Self>> {
                    match buffer {
                        ArrayBuffer::$variant(a) => Some(a),
                        _ => None,
                    }
                }

                fn view_mut(buffer: &mut ArrayBuffer) -> Option<&mut ArrayD<Self>> {
                    match buffer {
                        ArrayBuffer::$variant(a) => Some(a),
                        _ => None,
                    }
                }

                fn unwrap_buffer(buffer: ArrayBuffer) -> Result<ArrayD<Self>, ArrayBuffer> {
                    match buffer {
                        ArrayBuffer::$variant(a) => Ok(a),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

impl_element!(
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
);

/// Apply one expression to the typed array inside a buffer.
macro_rules! dispatch {
    ($buffer:expr, $array:ident => $body:expr) => {
        match $buffer {
            ArrayBuffer::U8($array) => $body,
            ArrayBuffer::U16($array) => $body,
            ArrayBuffer::U32($array) => $body,
            ArrayBuffer::U64($array) => $body,
            ArrayBuffer::I32($array) => $body,
            ArrayBuffer::I64($array) => $body,
            ArrayBuffer::F32($array) => $body,
            ArrayBuffer::F64($array) => $body,
        }
    };
}

/// Apply one expression to two buffers of the same dtype.
macro_rules! dispatch_pair {
    ($dst:expr, $src:expr, ($d:ident, $s:ident) => $body:expr, $mismatch:expr) => {
        match ($dst, $src) {
            (ArrayBuffer::U8($d), ArrayBuffer::U8($s)) => $body,
            (ArrayBuffer::U16($d), ArrayBuffer::U16($s)) => $body,
            (ArrayBuffer::U32($d), ArrayBuffer::U32($s)) => $body,
            (ArrayBuffer::U64($d), ArrayBuffer::U64($s)) => $body,
            (ArrayBuffer::I32($d), ArrayBuffer::I32($s)) => $body,
            (ArrayBuffer::I64($d), ArrayBuffer::I64($s)) => $body,
            (ArrayBuffer::F32($d), ArrayBuffer::F32($s)) => $body,
            (ArrayBuffer::F64($d), ArrayBuffer::F64($s)) => $body,
            _ => $mismatch,
        }
    };
}

fn zeros_of<T: Element>(shape: &[usize]) -> ArrayBuffer {
    T::into_buffer(ArrayD::from_elem(IxDyn(shape), T::default()))
}

impl ArrayBuffer {
    /// A zero-filled buffer.
    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        match dtype {
            DType::U8 => zeros_of::<u8>(shape),
            DType::U16 => zeros_of::<u16>(shape),
            DType::U32 => zeros_of::<u32>(shape),
            DType::U64 => zeros_of::<u64>(shape),
            DType::I32 => zeros_of::<i32>(shape),
            DType::I64 => zeros_of::<i64>(shape),
            DType::F32 => zeros_of::<f32>(shape),
            DType::F64 => zeros_of::<f64>(shape),
        }
    }

    /// A buffer with every element set to `value`.
    pub fn filled<T: Element>(shape: &[usize], value: T) -> Self {
        T::into_buffer(ArrayD::from_elem(IxDyn(shape), value))
    }

    /// Wrap a typed array.
    pub fn from_array<T: Element>(array: ArrayD<T>) -> Self {
        T::into_buffer(array)
    }

    /// Build a buffer from row-major data.
    pub fn from_shape_vec<T: Element>(shape: &[usize], data: Vec<T>) -> ExecutionResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ExecutionError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(T::into_buffer)
            .map_err(|e| ExecutionError::Other(e.to_string()))
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        match self {
            ArrayBuffer::U8(_) => DType::U8,
            ArrayBuffer::U16(_) => DType::U16,
            ArrayBuffer::U32(_) => DType::U32,
            ArrayBuffer::U64(_) => DType::U64,
            ArrayBuffer::I32(_) => DType::I32,
            ArrayBuffer::I64(_) => DType::I64,
            ArrayBuffer::F32(_) => DType::F32,
            ArrayBuffer::F64(_) => DType::F64,
        }
    }

    /// Extent of each axis.
    pub fn shape(&self) -> &[usize] {
        dispatch!(self, a => a.shape())
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        dispatch!(self, a => a.len())
    }

    /// Whether the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Memory held by the elements, in bytes.
    pub fn nbytes(&self) -> usize {
        self.len() * self.dtype().size_in_bytes()
    }

    /// Untagged metadata describing this buffer.
    pub fn meta(&self) -> ArrayMeta {
        ArrayMeta::new(self.shape().to_vec(), self.dtype())
    }

    /// Borrow as a typed array.
    pub fn as_array<T: Element>(&self) -> Option<&ArrayD<T>> {
        T::view(self)
    }

    /// Mutably borrow as a typed array.
    pub fn as_array_mut<T: Element>(&mut self) -> Option<&mut ArrayD<T>> {
        T::view_mut(self)
    }

    /// Convert into a typed array.
    pub fn into_array<T: Element>(self) -> ExecutionResult<ArrayD<T>> {
        T::unwrap_buffer(self).map_err(|other| ExecutionError::DTypeMismatch {
            expected: T::DTYPE,
            got: other.dtype(),
        })
    }

    /// Copy out the sub-array selected by `roi` (in this buffer's coordinates).
    pub fn region(&self, roi: &Roi) -> ExecutionResult<ArrayBuffer> {
        roi.check_within(self.shape())?;
        let slices = roi.to_slices();
        Ok(dispatch!(self, a => ArrayBuffer::from(
            a.slice_each_axis(|ax| slices[ax.axis.index()]).to_owned()
        )))
    }

    /// Overwrite the sub-array selected by `roi` with `src`.
    pub fn write_region(&mut self, roi: &Roi, src: &ArrayBuffer) -> ExecutionResult<()> {
        roi.check_within(self.shape())?;
        if roi.shape() != src.shape() {
            return Err(ExecutionError::ShapeMismatch {
                expected: roi.shape(),
                got: src.shape().to_vec(),
            });
        }
        let expected = self.dtype();
        let got = src.dtype();
        let slices = roi.to_slices();
        dispatch_pair!(
            self,
            src,
            (d, s) => {
                d.slice_each_axis_mut(|ax| slices[ax.axis.index()]).assign(s);
                Ok(())
            },
            Err(ExecutionError::DTypeMismatch { expected, got })
        )
    }

    /// Overwrite the whole buffer with `src`, which must match in shape and dtype.
    pub fn copy_from(&mut self, src: &ArrayBuffer) -> ExecutionResult<()> {
        let full = Roi::from_shape(self.shape());
        self.write_region(&full, src)
    }
}

impl<T: Element> From<ArrayD<T>> for ArrayBuffer {
    fn from(array: ArrayD<T>) -> Self {
        T::into_buffer(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros_and_meta() {
        let buffer = ArrayBuffer::zeros(DType::U16, &[4, 5]);
        assert_eq!(buffer.dtype(), DType::U16);
        assert_eq!(buffer.shape(), &[4, 5]);
        assert_eq!(buffer.nbytes(), 40);
        assert_eq!(buffer.meta(), ArrayMeta::new(vec![4, 5], DType::U16));
    }

    #[test]
    fn test_region_copies_sub_array() {
        let data: Vec<u32> = (0..20).collect();
        let buffer = ArrayBuffer::from_shape_vec(&[4, 5], data).unwrap();
        let roi = Roi::new(vec![1, 2], vec![3, 4]).unwrap();
        let region = buffer.region(&roi).unwrap();
        let array = region.into_array::<u32>().unwrap();
        assert_eq!(array.shape(), &[2, 2]);
        assert_eq!(array.iter().copied().collect::<Vec<_>>(), vec![7, 8, 12, 13]);
    }

    #[test]
    fn test_write_region_checks_shape_and_dtype() {
        let mut buffer = ArrayBuffer::zeros(DType::F32, &[3, 3]);
        let roi = Roi::new(vec![0, 1], vec![2, 3]).unwrap();

        let patch = ArrayBuffer::filled(&[2, 2], 1.5f32);
        buffer.write_region(&roi, &patch).unwrap();
        let array = buffer.as_array::<f32>().unwrap();
        assert_eq!(array[[0, 0]], 0.0);
        assert_eq!(array[[1, 2]], 1.5);

        let wrong_dtype = ArrayBuffer::filled(&[2, 2], 1u8);
        assert!(matches!(
            buffer.write_region(&roi, &wrong_dtype),
            Err(ExecutionError::DTypeMismatch { .. })
        ));

        let wrong_shape = ArrayBuffer::filled(&[1, 2], 1.5f32);
        assert!(matches!(
            buffer.write_region(&roi, &wrong_shape),
            Err(ExecutionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_region_out_of_bounds() {
        let buffer = ArrayBuffer::zeros(DType::U8, &[2, 2]);
        let roi = Roi::new(vec![0, 0], vec![3, 2]).unwrap();
        assert!(buffer.region(&roi).is_err());
    }

    #[test]
    fn test_into_array_dtype_mismatch() {
        let buffer = ArrayBuffer::zeros(DType::I64, &[2]);
        assert!(matches!(
            buffer.into_array::<f64>(),
            Err(ExecutionError::DTypeMismatch {
                expected: DType::F64,
                got: DType::I64
            })
        ));
    }

    #[test]
    fn test_meta_serializes_lowercase_dtype() {
        let meta = ArrayMeta::new(vec![10, 20], DType::F32).with_axistags("yx");
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"f32\""));
        assert_eq!(meta.nbytes(), 800);
    }
}
