//! Dense N-dimensional tensor
//!
//! A contiguous row-major buffer plus its dimensions. Strides are derived
//! from the dimensions and never stored independently of them.
//!
//! Arithmetic comes in two flavours: `multiply` mutates in place,
//! `to_multiply` leaves `self` untouched and returns a new tensor.

use std::ops::Range;

use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::error::{CoreError, CoreResult};

/// Dense tensor with row-major layout
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    buffer: Vec<T>,
    dimensions: Vec<usize>,
    strides: Vec<usize>,
}

/// Row-major strides for the given dimensions
pub fn row_major_strides(dimensions: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dimensions.len()];
    for i in (0..dimensions.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dimensions[i + 1];
    }
    strides
}

impl<T: Clone> Tensor<T> {
    /// Create tensor from an existing buffer
    pub fn new(dimensions: &[usize], buffer: Vec<T>) -> CoreResult<Self> {
        let expected: usize = dimensions.iter().product();
        if buffer.len() != expected {
            return Err(CoreError::BufferLength {
                dimensions: dimensions.to_vec(),
                expected,
                got: buffer.len(),
            });
        }

        Ok(Self {
            buffer,
            dimensions: dimensions.to_vec(),
            strides: row_major_strides(dimensions),
        })
    }

    /// Create tensor with every element set to `value`
    pub fn filled(dimensions: &[usize], value: T) -> Self {
        let len = dimensions.iter().product();
        Self {
            buffer: vec![value; len],
            dimensions: dimensions.to_vec(),
            strides: row_major_strides(dimensions),
        }
    }

    /// Copy an ndarray array (any memory layout) into a row-major tensor
    pub fn from_array(array: &ArrayD<T>) -> Self {
        let dimensions = array.shape().to_vec();
        Self {
            buffer: array.iter().cloned().collect(),
            strides: row_major_strides(&dimensions),
            dimensions,
        }
    }

    /// Convert to an owned ndarray array
    pub fn to_array(&self) -> CoreResult<ArrayD<T>> {
        ArrayD::from_shape_vec(IxDyn(&self.dimensions), self.buffer.clone())
            .map_err(|e| CoreError::InvalidDimensions(e.to_string()))
    }

    /// Borrow as an ndarray view
    pub fn view(&self) -> CoreResult<ArrayViewD<'_, T>> {
        ArrayViewD::from_shape(IxDyn(&self.dimensions), &self.buffer)
            .map_err(|e| CoreError::InvalidDimensions(e.to_string()))
    }

    pub fn dimensions(&self) -> &[usize] {
        &self.dimensions
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.buffer
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.buffer
    }

    pub fn into_vec(self) -> Vec<T> {
        self.buffer
    }

    /// Flat buffer offset of a multi-dimensional index
    pub fn offset(&self, index: &[usize]) -> CoreResult<usize> {
        if index.len() != self.dimensions.len()
            || index.iter().zip(&self.dimensions).any(|(&i, &d)| i >= d)
        {
            return Err(CoreError::IndexOutOfBounds {
                index: index.to_vec(),
                dimensions: self.dimensions.clone(),
            });
        }

        Ok(index.iter().zip(&self.strides).map(|(i, s)| i * s).sum())
    }

    pub fn get(&self, index: &[usize]) -> CoreResult<&T> {
        let offset = self.offset(index)?;
        Ok(&self.buffer[offset])
    }

    pub fn get_mut(&mut self, index: &[usize]) -> CoreResult<&mut T> {
        let offset = self.offset(index)?;
        Ok(&mut self.buffer[offset])
    }

    pub fn set(&mut self, index: &[usize], value: T) -> CoreResult<()> {
        *self.get_mut(index)? = value;
        Ok(())
    }

    /// Contiguous innermost row addressed by every index but the last
    ///
    /// For logits shaped `[batch, seq, vocab]`, `row(&[0, seq - 1])` is the
    /// vocabulary row of the final position.
    pub fn row(&self, index: &[usize]) -> CoreResult<&[T]> {
        let rank = self.dimensions.len();
        if rank == 0
            || index.len() != rank - 1
            || index.iter().zip(&self.dimensions).any(|(&i, &d)| i >= d)
        {
            return Err(CoreError::IndexOutOfBounds {
                index: index.to_vec(),
                dimensions: self.dimensions.clone(),
            });
        }

        let start: usize = index.iter().zip(&self.strides).map(|(i, s)| i * s).sum();
        Ok(&self.buffer[start..start + self.dimensions[rank - 1]])
    }

    /// Change dimensions in place, keeping the buffer
    pub fn reshape(&mut self, dimensions: &[usize]) -> CoreResult<()> {
        let expected: usize = dimensions.iter().product();
        if expected != self.buffer.len() {
            return Err(CoreError::BufferLength {
                dimensions: dimensions.to_vec(),
                expected,
                got: self.buffer.len(),
            });
        }
        self.dimensions = dimensions.to_vec();
        self.strides = row_major_strides(dimensions);
        Ok(())
    }

    pub fn to_reshape(&self, dimensions: &[usize]) -> CoreResult<Self> {
        let mut result = self.clone();
        result.reshape(dimensions)?;
        Ok(result)
    }

    /// Elements of the outermost dimension within `range`
    pub fn slice_batch(&self, range: Range<usize>) -> CoreResult<Self> {
        let batch = self.batch_size()?;
        if range.start > range.end || range.end > batch {
            return Err(CoreError::IndexOutOfBounds {
                index: vec![range.start, range.end],
                dimensions: self.dimensions.clone(),
            });
        }

        let stride = self.strides[0];
        let mut dimensions = self.dimensions.clone();
        dimensions[0] = range.len();
        Self::new(
            &dimensions,
            self.buffer[range.start * stride..range.end * stride].to_vec(),
        )
    }

    /// Split the outermost dimension into `parts` equal tensors
    pub fn split_batch(&self, parts: usize) -> CoreResult<Vec<Self>> {
        let batch = self.batch_size()?;
        if parts == 0 || batch % parts != 0 {
            return Err(CoreError::InvalidDimensions(format!(
                "cannot split batch of {} into {} parts",
                batch, parts
            )));
        }

        let chunk = batch / parts;
        (0..parts)
            .map(|i| self.slice_batch(i * chunk..(i + 1) * chunk))
            .collect()
    }

    /// Concatenate tensors along the outermost dimension
    pub fn concat_batch(tensors: &[&Self]) -> CoreResult<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| CoreError::InvalidDimensions("nothing to concatenate".into()))?;
        first.batch_size()?;

        let inner = &first.dimensions[1..];
        let mut batch = 0;
        let mut buffer = Vec::with_capacity(tensors.iter().map(|t| t.len()).sum());
        for tensor in tensors {
            if tensor.rank() != first.rank() || &tensor.dimensions[1..] != inner {
                return Err(CoreError::ShapeMismatch {
                    expected: first.dimensions.clone(),
                    got: tensor.dimensions.clone(),
                });
            }
            batch += tensor.dimensions[0];
            buffer.extend_from_slice(&tensor.buffer);
        }

        let mut dimensions = first.dimensions.clone();
        dimensions[0] = batch;
        Self::new(&dimensions, buffer)
    }

    /// Repeat the whole tensor `count` times along the outermost dimension
    pub fn repeat_batch(&self, count: usize) -> CoreResult<Self> {
        let tensors: Vec<&Self> = std::iter::repeat_n(self, count).collect();
        Self::concat_batch(&tensors)
    }

    fn batch_size(&self) -> CoreResult<usize> {
        self.dimensions.first().copied().ok_or_else(|| {
            CoreError::InvalidDimensions("scalar tensor has no batch dimension".into())
        })
    }
}

impl Tensor<f32> {
    pub fn zeros(dimensions: &[usize]) -> Self {
        Self::filled(dimensions, 0.0)
    }

    pub fn ones(dimensions: &[usize]) -> Self {
        Self::filled(dimensions, 1.0)
    }

    fn check_same_shape(&self, other: &Self) -> CoreResult<()> {
        if self.dimensions != other.dimensions {
            return Err(CoreError::ShapeMismatch {
                expected: self.dimensions.clone(),
                got: other.dimensions.clone(),
            });
        }
        Ok(())
    }

    fn zip_inplace(&mut self, other: &Self, f: impl Fn(f32, f32) -> f32) -> CoreResult<()> {
        self.check_same_shape(other)?;
        for (a, &b) in self.buffer.iter_mut().zip(&other.buffer) {
            *a = f(*a, b);
        }
        Ok(())
    }

    pub fn add(&mut self, other: &Self) -> CoreResult<()> {
        self.zip_inplace(other, |a, b| a + b)
    }

    pub fn to_add(&self, other: &Self) -> CoreResult<Self> {
        let mut result = self.clone();
        result.add(other)?;
        Ok(result)
    }

    pub fn subtract(&mut self, other: &Self) -> CoreResult<()> {
        self.zip_inplace(other, |a, b| a - b)
    }

    pub fn to_subtract(&self, other: &Self) -> CoreResult<Self> {
        let mut result = self.clone();
        result.subtract(other)?;
        Ok(result)
    }

    pub fn multiply(&mut self, other: &Self) -> CoreResult<()> {
        self.zip_inplace(other, |a, b| a * b)
    }

    pub fn to_multiply(&self, other: &Self) -> CoreResult<Self> {
        let mut result = self.clone();
        result.multiply(other)?;
        Ok(result)
    }

    pub fn divide(&mut self, other: &Self) -> CoreResult<()> {
        self.zip_inplace(other, |a, b| a / b)
    }

    pub fn to_divide(&self, other: &Self) -> CoreResult<Self> {
        let mut result = self.clone();
        result.divide(other)?;
        Ok(result)
    }

    pub fn add_scalar(&mut self, value: f32) {
        self.map_inplace(|x| x + value);
    }

    pub fn to_add_scalar(&self, value: f32) -> Self {
        self.to_map(|x| x + value)
    }

    pub fn multiply_scalar(&mut self, value: f32) {
        self.map_inplace(|x| x * value);
    }

    pub fn to_multiply_scalar(&self, value: f32) -> Self {
        self.to_map(|x| x * value)
    }

    pub fn divide_scalar(&mut self, value: f32) {
        self.map_inplace(|x| x / value);
    }

    pub fn to_divide_scalar(&self, value: f32) -> Self {
        self.to_map(|x| x / value)
    }

    /// `self += other * scale`
    pub fn add_scaled(&mut self, other: &Self, scale: f32) -> CoreResult<()> {
        self.zip_inplace(other, |a, b| a + b * scale)
    }

    /// `self * a + other * b` as a new tensor
    pub fn to_linear_combination(&self, a: f32, other: &Self, b: f32) -> CoreResult<Self> {
        self.check_same_shape(other)?;
        let buffer = self
            .buffer
            .iter()
            .zip(&other.buffer)
            .map(|(&x, &y)| x * a + y * b)
            .collect();
        Self::new(&self.dimensions, buffer)
    }

    pub fn clamp(&mut self, min: f32, max: f32) {
        self.map_inplace(|x| x.clamp(min, max));
    }

    pub fn to_clamp(&self, min: f32, max: f32) -> Self {
        self.to_map(|x| x.clamp(min, max))
    }

    pub fn map_inplace(&mut self, f: impl Fn(f32) -> f32) {
        for x in &mut self.buffer {
            *x = f(*x);
        }
    }

    pub fn to_map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            buffer: self.buffer.iter().map(|&x| f(x)).collect(),
            dimensions: self.dimensions.clone(),
            strides: self.strides.clone(),
        }
    }

    pub fn sum(&self) -> f32 {
        self.buffer.iter().sum()
    }

    pub fn mean(&self) -> f32 {
        if self.buffer.is_empty() {
            0.0
        } else {
            self.sum() / self.buffer.len() as f32
        }
    }

    /// Flat index of the largest element (first one on ties)
    pub fn argmax(&self) -> Option<usize> {
        argmax(&self.buffer)
    }

    pub fn all_finite(&self) -> bool {
        self.buffer.iter().all(|x| x.is_finite())
    }
}

/// Index of the largest value, first one on ties; `None` for an empty slice
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Numerically stable log-softmax over a slice
pub fn log_softmax(values: &[f32]) -> Vec<f32> {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![f32::NEG_INFINITY; values.len()];
    }
    let log_sum = values.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
    values.iter().map(|&v| v - max - log_sum).collect()
}

/// Numerically stable softmax over a slice
pub fn softmax(values: &[f32]) -> Vec<f32> {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = values.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
