//! # fedlink Models
//!
//! Model parameter containers and the code that works on them.
//!
//! This crate provides:
//! - [`ModelState`]: ordered, named tensors with raw little-endian payloads
//! - [`ModelCodec`]: the container format seam, with a postcard default
//! - [`diff`]: element-wise update computation and report encoding
//! - [`executor`]: the training-executor seam and a cooperative batch loop

#![forbid(unsafe_code)]

pub mod diff;
pub mod executor;

use fedlink_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::diff::*;
    pub use crate::executor::*;
    pub use crate::{DType, ModelCodec, ModelState, PostcardCodec, Tensor, TensorBuffer};
}

/// Element type of a tensor payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
}

impl DType {
    /// Width of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }
}

/// Owned little-endian payload of a tensor
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TensorBuffer(Vec<u8>);

impl TensorBuffer {
    /// Wrap raw bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Encode `f32` values
    pub fn from_f32(values: &[f32]) -> Self {
        Self(values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    /// Encode `f64` values
    pub fn from_f64(values: &[f64]) -> Self {
        Self(values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    /// Encode `i32` values
    pub fn from_i32(values: &[i32]) -> Self {
        Self(values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    /// Encode `i64` values
    pub fn from_i64(values: &[i64]) -> Self {
        Self(values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    /// Decode as `f32` values; trailing partial elements are ignored
    pub fn to_f32(&self) -> Vec<f32> {
        self.0
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Decode as `f64` values
    pub fn to_f64(&self) -> Vec<f64> {
        self.0
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect()
    }

    /// Decode as `i32` values
    pub fn to_i32(&self) -> Vec<i32> {
        self.0
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Decode as `i64` values
    pub fn to_i64(&self) -> Vec<i64> {
        self.0
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect()
    }

    /// Borrow the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A named, shaped tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Parameter name
    pub name: String,
    /// Dimensions, outermost first
    pub shape: Vec<usize>,
    /// Element type
    pub dtype: DType,
    /// Raw payload
    pub data: TensorBuffer,
}

impl Tensor {
    /// Create a tensor from raw parts
    pub fn new(name: impl Into<String>, shape: Vec<usize>, dtype: DType, data: TensorBuffer) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
            data,
        }
    }

    /// Create an `f32` tensor
    pub fn f32(name: impl Into<String>, shape: Vec<usize>, values: &[f32]) -> Self {
        Self::new(name, shape, DType::F32, TensorBuffer::from_f32(values))
    }

    /// Number of elements implied by the shape, `None` if it overflows `usize`
    pub fn element_count(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |count, &dim| count.checked_mul(dim))
    }

    /// Check that the payload length matches shape and dtype
    pub fn validate(&self) -> Result<()> {
        let expected = self
            .element_count()
            .and_then(|count| count.checked_mul(self.dtype.size()))
            .ok_or_else(|| {
                Error::StructuralMismatch(format!(
                    "tensor `{}` shape {:?} is too large",
                    self.name, self.shape
                ))
            })?;
        if self.data.len() != expected {
            return Err(Error::StructuralMismatch(format!(
                "tensor `{}` payload is {} bytes, expected {}",
                self.name,
                self.data.len(),
                expected
            )));
        }
        Ok(())
    }
}

/// Model parameters as an ordered sequence of tensors
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelState {
    /// Parameters in model order
    pub tensors: Vec<Tensor>,
}

impl ModelState {
    /// Create a model state from tensors
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self { tensors }
    }

    /// Append a tensor
    pub fn with_tensor(mut self, tensor: Tensor) -> Self {
        self.tensors.push(tensor);
        self
    }

    /// Number of tensors
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the state has no tensors
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Look up a tensor by name
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| Error::Decoding(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(|e| Error::Decoding(e.to_string()))
    }
}

/// Binary container format for downloaded models and uploaded diffs
pub trait ModelCodec: Send + Sync {
    /// Decode a model container into parameters
    fn decode(&self, bytes: &[u8]) -> Result<ModelState>;

    /// Encode parameters into a model container
    fn encode(&self, state: &ModelState) -> Result<Vec<u8>>;
}

/// Default codec: postcard serialization of [`ModelState`]
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardCodec;

impl ModelCodec for PostcardCodec {
    fn decode(&self, bytes: &[u8]) -> Result<ModelState> {
        let state = ModelState::from_bytes(bytes)?;
        for tensor in &state.tensors {
            tensor.validate()?;
        }
        Ok(state)
    }

    fn encode(&self, state: &ModelState) -> Result<Vec<u8>> {
        state.to_bytes()
    }
}
