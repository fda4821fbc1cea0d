//! Narrow interface over the enclosing framework's tensor container. This
//! crate only needs a dtype, a shape, and byte access to do shape
//! validation, batch splitting, padding, and stitching; it never needs
//! the framework's full tensor API.

use crate::error::{Error, Result};

/// Element type stamped on a model's inputs/outputs at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    I32,
    I64,
    U8,
    Bool,
}

impl DType {
    /// Size in bytes of one element.
    pub fn size_of(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::I32 => 4,
            DType::I64 => 8,
            DType::U8 => 1,
            DType::Bool => 1,
        }
    }
}

pub type Shape = Vec<usize>;

/// Read-only view over one tensor's bytes, shape, and dtype, as handed to
/// this crate by the framework's operator-invocation glue at the
/// compute-graph boundary.
pub trait TensorView {
    fn shape(&self) -> &[usize];
    fn dtype(&self) -> DType;
    fn bytes(&self) -> &[u8];

    /// Number of bytes occupied by one "row" along the leading dimension
    /// (the batch axis in every batched input/output).
    fn row_stride(&self) -> usize {
        let per_row: usize = self.shape().iter().skip(1).product();
        per_row * self.dtype().size_of()
    }
}

/// Owned, heap-backed tensor. Stands in for the framework's real tensor
/// container at the crate boundary — used for padding, batch-window
/// slicing, output stitching, and in tests.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub shape: Shape,
    pub dtype: DType,
    pub data: Vec<u8>,
}

impl HostTensor {
    pub fn zeros(shape: Shape, dtype: DType) -> Self {
        let len: usize = shape.iter().product::<usize>() * dtype.size_of();
        Self { shape, dtype, data: vec![0u8; len] }
    }

    pub fn from_bytes(shape: Shape, dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected: usize = shape.iter().product::<usize>() * dtype.size_of();
        if data.len() != expected {
            return Err(Error::OutOfRange(format!(
                "tensor byte length {} does not match shape {:?} dtype {:?} (expected {})",
                data.len(),
                shape,
                dtype,
                expected
            )));
        }
        Ok(Self { shape, dtype, data })
    }

    /// Batch size: the extent of the leading dimension.
    pub fn batch_len(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Copy out rows `[start, end)` along the leading dimension as a new
    /// owned tensor.
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Self> {
        let stride = self.row_stride();
        let byte_start = start * stride;
        let byte_end = end * stride;
        if byte_end > self.data.len() {
            return Err(Error::OutOfRange(format!(
                "row slice [{}, {}) exceeds tensor with {} rows",
                start,
                end,
                self.batch_len()
            )));
        }
        let mut shape = self.shape.clone();
        shape[0] = end - start;
        Ok(Self { shape, dtype: self.dtype, data: self.data[byte_start..byte_end].to_vec() })
    }

    /// Copy `src`'s rows into `self` starting at row `start`, leaving any
    /// trailing rows untouched (they are expected to already be
    /// zero-filled by [`HostTensor::zeros`]). Used to build the padded
    /// last micro-batch window.
    pub fn write_rows(&mut self, start: usize, src: &HostTensor) -> Result<()> {
        let stride = self.row_stride();
        let byte_start = start * stride;
        let byte_end = byte_start + src.data.len();
        if byte_end > self.data.len() {
            return Err(Error::OutOfRange(format!(
                "write_rows at {} with {} bytes exceeds tensor of {} bytes",
                start,
                src.data.len(),
                self.data.len()
            )));
        }
        self.data[byte_start..byte_end].copy_from_slice(&src.data);
        Ok(())
    }

    /// Concatenate several tensors along the leading dimension, truncating
    /// the last one to `last_rows` rows.
    pub fn stitch(parts: &[HostTensor], last_rows: usize) -> Result<Self> {
        let first = parts.first().ok_or_else(|| {
            Error::InvalidArgument("stitch called with no micro-batch outputs".into())
        })?;
        let stride = first.row_stride();
        let mut total_rows = 0usize;
        let mut data = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            let rows = if i + 1 == parts.len() { last_rows } else { part.batch_len() };
            let bytes = rows * stride;
            data.extend_from_slice(&part.data[..bytes]);
            total_rows += rows;
        }
        let mut shape = first.shape.clone();
        shape[0] = total_rows;
        Ok(Self { shape, dtype: first.dtype, data })
    }
}

impl TensorView for HostTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_stride_matches_trailing_dims() {
        let t = HostTensor::zeros(vec![4, 2, 8], DType::F32);
        assert_eq!(t.row_stride(), 2 * 8 * 4);
    }

    #[test]
    fn slice_rows_extracts_window() {
        let data: Vec<u8> = (0..16u8).collect();
        let t = HostTensor::from_bytes(vec![4, 4], DType::U8, data).unwrap();
        let window = t.slice_rows(1, 3).unwrap();
        assert_eq!(window.shape, vec![2, 4]);
        assert_eq!(window.data, vec![4, 5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn write_rows_then_stitch_roundtrips() {
        let mut padded = HostTensor::zeros(vec![2, 4], DType::U8);
        let residual = HostTensor::from_bytes(vec![1, 4], DType::U8, vec![9, 9, 9, 9]).unwrap();
        padded.write_rows(0, &residual).unwrap();
        assert_eq!(padded.data, vec![9, 9, 9, 9, 0, 0, 0, 0]);

        let other = HostTensor::zeros(vec![2, 4], DType::U8);
        let stitched = HostTensor::stitch(&[other, padded], 1).unwrap();
        assert_eq!(stitched.shape, vec![3, 4]);
        assert_eq!(stitched.data.len(), 3 * 4);
    }
}
