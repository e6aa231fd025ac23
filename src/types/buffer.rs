//! Typed, shaped block of data exchanged between nodes.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::Precision;

/// Reason a buffer is inconsistent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
  #[error("buffer shape has no dimensions")]
  EmptyShape,
  #[error("buffer precision is unspecified")]
  UnspecifiedPrecision,
  #[error("buffer content is {actual} bytes, shape and precision require {expected}")]
  ContentSize { expected: usize, actual: usize },
}

/// Typed, shaped block of data. Content length always equals shape × element size.
///
/// Content is reference counted, so clones and branch slices share memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
  precision: Precision,
  shape: Vec<u64>,
  data: Bytes,
}

/// Byte length required for `shape` of `precision`, or `None` on overflow / unspecified type.
pub(crate) fn expected_content_len(precision: Precision, shape: &[u64]) -> Option<usize> {
  let element = precision.size()?;
  shape
    .iter()
    .try_fold(element, |acc, dim| acc.checked_mul(usize::try_from(*dim).ok()?))
}

impl Buffer {
  /// Creates a buffer, rejecting empty shapes, unspecified precision and content size mismatch.
  pub fn new(
    precision: Precision,
    shape: Vec<u64>,
    data: impl Into<Bytes>,
  ) -> Result<Self, BufferError> {
    let data = data.into();
    if shape.is_empty() {
      return Err(BufferError::EmptyShape);
    }
    if !precision.is_specified() {
      return Err(BufferError::UnspecifiedPrecision);
    }
    let expected = expected_content_len(precision, &shape).ok_or(BufferError::ContentSize {
      expected: usize::MAX,
      actual: data.len(),
    })?;
    if expected != data.len() {
      return Err(BufferError::ContentSize {
        expected,
        actual: data.len(),
      });
    }
    Ok(Self {
      precision,
      shape,
      data,
    })
  }

  /// FP32 buffer from native-endian values.
  pub fn from_f32(shape: Vec<u64>, values: &[f32]) -> Result<Self, BufferError> {
    let mut data = BytesMut::with_capacity(values.len() * 4);
    for v in values {
      data.extend_from_slice(&v.to_ne_bytes());
    }
    Self::new(Precision::Fp32, shape, data.freeze())
  }

  pub fn precision(&self) -> Precision {
    self.precision
  }

  pub fn shape(&self) -> &[u64] {
    &self.shape
  }

  pub fn data(&self) -> &Bytes {
    &self.data
  }

  /// Decodes FP32 content; `None` for other precisions.
  pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
    if self.precision != Precision::Fp32 {
      return None;
    }
    Some(
      self
        .data
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect(),
    )
  }

  /// Splits along the leading dimension into `shape[0]` buffers of shape `shape[1..]`.
  ///
  /// Returns `None` when the buffer has fewer than two dimensions.
  pub(crate) fn split_leading(&self) -> Option<Vec<Buffer>> {
    if self.shape.len() < 2 {
      return None;
    }
    let count = usize::try_from(self.shape[0]).ok()?;
    let inner: Vec<u64> = self.shape[1..].to_vec();
    let chunk = expected_content_len(self.precision, &inner)?;
    Some(
      (0..count)
        .map(|i| Buffer {
          precision: self.precision,
          shape: inner.clone(),
          data: self.data.slice(i * chunk..(i + 1) * chunk),
        })
        .collect(),
    )
  }

  /// Stacks equally shaped buffers under new leading dimensions `leading`.
  ///
  /// `parts` must be ordered by branch index and number `leading.iter().product()`.
  /// Returns `None` when the parts disagree in precision or shape.
  pub(crate) fn stack(parts: &[&Buffer], leading: &[u64]) -> Option<Buffer> {
    let first = parts.first()?;
    if parts
      .iter()
      .any(|p| p.precision != first.precision || p.shape != first.shape)
    {
      return None;
    }
    let mut data = BytesMut::with_capacity(first.data.len() * parts.len());
    for p in parts {
      data.extend_from_slice(&p.data);
    }
    let mut shape = leading.to_vec();
    shape.extend_from_slice(&first.shape);
    Some(Buffer {
      precision: first.precision,
      shape,
      data: data.freeze(),
    })
  }
}
