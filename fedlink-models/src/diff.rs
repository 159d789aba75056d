//! Diff builder
//!
//! Computes the per-parameter update `original - updated` that the
//! coordinator subtracts (after averaging) from the global model, and encodes
//! it for the report message.

use base64::Engine;
use fedlink_core::{Error, Result};

use crate::{DType, ModelCodec, ModelState, Tensor, TensorBuffer};

/// Element-wise `original - updated` over every tensor.
///
/// Both states must agree on tensor count, order, names, shapes and dtypes.
pub fn diff_state(original: &ModelState, updated: &ModelState) -> Result<ModelState> {
    if original.len() != updated.len() {
        return Err(Error::StructuralMismatch(format!(
            "tensor count differs: {} vs {}",
            original.len(),
            updated.len()
        )));
    }

    let tensors = original
        .tensors
        .iter()
        .zip(&updated.tensors)
        .map(|(a, b)| diff_tensor(a, b))
        .collect::<Result<Vec<_>>>()?;

    Ok(ModelState::new(tensors))
}

fn diff_tensor(original: &Tensor, updated: &Tensor) -> Result<Tensor> {
    if original.name != updated.name {
        return Err(Error::StructuralMismatch(format!(
            "tensor name differs: `{}` vs `{}`",
            original.name, updated.name
        )));
    }
    if original.shape != updated.shape {
        return Err(Error::StructuralMismatch(format!(
            "tensor `{}` shape differs: {:?} vs {:?}",
            original.name, original.shape, updated.shape
        )));
    }
    if original.dtype != updated.dtype {
        return Err(Error::StructuralMismatch(format!(
            "tensor `{}` dtype differs: {:?} vs {:?}",
            original.name, original.dtype, updated.dtype
        )));
    }
    original.validate()?;
    updated.validate()?;

    let data = match original.dtype {
        DType::F32 => TensorBuffer::from_f32(&subtract(original.data.to_f32(), &updated.data.to_f32(), |a, b| a - b)),
        DType::F64 => TensorBuffer::from_f64(&subtract(original.data.to_f64(), &updated.data.to_f64(), |a, b| a - b)),
        DType::I32 => TensorBuffer::from_i32(&subtract(original.data.to_i32(), &updated.data.to_i32(), i32::wrapping_sub)),
        DType::I64 => TensorBuffer::from_i64(&subtract(original.data.to_i64(), &updated.data.to_i64(), i64::wrapping_sub)),
    };

    Ok(Tensor::new(
        original.name.clone(),
        original.shape.clone(),
        original.dtype,
        data,
    ))
}

fn subtract<T: Copy>(mut lhs: Vec<T>, rhs: &[T], op: impl Fn(T, T) -> T) -> Vec<T> {
    for (a, b) in lhs.iter_mut().zip(rhs) {
        *a = op(*a, *b);
    }
    lhs
}

/// A computed update, ready to be reported
#[derive(Debug, Clone, PartialEq)]
pub struct DiffReport {
    diff: ModelState,
}

impl DiffReport {
    /// Compute the diff between the downloaded and the trained parameters
    pub fn build(original: &ModelState, updated: &ModelState) -> Result<Self> {
        let diff = diff_state(original, updated)?;
        tracing::debug!(tensors = diff.len(), "diff computed");
        Ok(Self { diff })
    }

    /// Wrap an already computed diff
    pub fn from_state(diff: ModelState) -> Self {
        Self { diff }
    }

    /// The diff parameters
    pub fn state(&self) -> &ModelState {
        &self.diff
    }

    /// Encode with the coordinator's container format
    pub fn encode(&self, codec: &dyn ModelCodec) -> Result<Vec<u8>> {
        codec.encode(&self.diff)
    }

    /// Encode and base64 the container for a JSON report
    pub fn to_base64(&self, codec: &dyn ModelCodec) -> Result<String> {
        Ok(base64::engine::general_purpose::STANDARD.encode(self.encode(codec)?))
    }

    /// Inverse of [`DiffReport::to_base64`]
    pub fn from_base64(codec: &dyn ModelCodec, encoded: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::Decoding(e.to_string()))?;
        Ok(Self {
            diff: codec.decode(&bytes)?,
        })
    }
}
