//! Host-memory tensors carried over the transport.
//!
//! Tensors are dense, row-major byte buffers with a shape and element type.
//! Typed access goes through [`Element`], which ties a `bytemuck::Pod` type to
//! its [`DType`].

use std::fmt;

use bytemuck::Pod;
use bytes::{Bytes, BytesMut};
use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::transfer::TransportError;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    #[serde(rename = "float16")]
    F16,
    #[serde(rename = "bfloat16")]
    BF16,
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "int64")]
    I64,
    #[serde(rename = "uint8")]
    U8,
}

impl DType {
    /// Bytes per element.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 => 4,
            DType::I64 => 8,
            DType::U8 => 1,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F16 => write!(f, "float16"),
            DType::BF16 => write!(f, "bfloat16"),
            DType::F32 => write!(f, "float32"),
            DType::I64 => write!(f, "int64"),
            DType::U8 => write!(f, "uint8"),
        }
    }
}

/// A plain-data element type with a fixed [`DType`].
pub trait Element: Pod {
    const DTYPE: DType;
}

impl Element for f16 {
    const DTYPE: DType = DType::F16;
}

impl Element for bf16 {
    const DTYPE: DType = DType::BF16;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

impl Element for i64 {
    const DTYPE: DType = DType::I64;
}

impl Element for u8 {
    const DTYPE: DType = DType::U8;
}

/// Number of elements in a shape (1 for a scalar `[]`).
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Byte length of a dense tensor of `shape` x `dtype`.
pub fn byte_len(shape: &[usize], dtype: DType) -> usize {
    numel(shape) * dtype.size_in_bytes()
}

/// A dense row-major tensor in host memory.
#[derive(Clone, PartialEq, Eq)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DType,
    data: Bytes,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("nbytes", &self.data.len())
            .finish()
    }
}

impl Tensor {
    /// Wrap raw bytes, checking that their length matches `shape` x `dtype`.
    pub fn from_bytes(
        shape: Vec<usize>,
        dtype: DType,
        data: Bytes,
    ) -> Result<Self, TransportError> {
        let expected = byte_len(&shape, dtype);
        if data.len() != expected {
            return Err(TransportError::InvalidArgument(format!(
                "{} bytes do not fill a {dtype} tensor of shape {shape:?} ({expected} bytes)",
                data.len()
            )));
        }
        Ok(Self { shape, dtype, data })
    }

    /// A zero-filled tensor.
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Self {
        let data = BytesMut::zeroed(byte_len(&shape, dtype)).freeze();
        Self { shape, dtype, data }
    }

    /// Copy typed elements into a new tensor.
    pub fn from_slice<T: Element>(shape: Vec<usize>, values: &[T]) -> Result<Self, TransportError> {
        let data = Bytes::copy_from_slice(bytemuck::cast_slice(values));
        Self::from_bytes(shape, T::DTYPE, data)
    }

    /// Copy the elements out as a typed vector.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, TransportError> {
        if T::DTYPE != self.dtype {
            return Err(TransportError::InvalidArgument(format!(
                "tensor holds {}, requested {}",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(bytemuck::pod_collect_to_vec(&self.data[..]))
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Cheap clone of the underlying buffer.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Select `len` entries starting at `start` along dimension `dim`.
    ///
    /// Narrowing the leading dimension shares the buffer; other dimensions copy.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self, TransportError> {
        let Some(&extent) = self.shape.get(dim) else {
            return Err(TransportError::InvalidArgument(format!(
                "dimension {dim} out of range for shape {:?}",
                self.shape
            )));
        };
        if start + len > extent {
            return Err(TransportError::InvalidArgument(format!(
                "range {start}..{} out of bounds for dimension {dim} of size {extent}",
                start + len
            )));
        }

        let mut shape = self.shape.clone();
        shape[dim] = len;

        // Bytes in one step along `dim`.
        let inner = numel(&self.shape[dim + 1..]) * self.dtype.size_in_bytes();
        let outer = numel(&self.shape[..dim]);

        let data = if outer == 1 {
            self.data.slice(start * inner..(start + len) * inner)
        } else {
            let stride = extent * inner;
            let mut out = BytesMut::with_capacity(outer * len * inner);
            for o in 0..outer {
                let base = o * stride + start * inner;
                out.extend_from_slice(&self.data[base..base + len * inner]);
            }
            out.freeze()
        };

        Ok(Self {
            shape,
            dtype: self.dtype,
            data,
        })
    }
}
