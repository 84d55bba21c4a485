//! Named tensors exchanged with a model session

use serde::{Deserialize, Serialize};
use tract_onnx::prelude::{DatumType, Tensor as TractTensor};
use ts_core::Tensor;

use crate::error::{RuntimeError, RuntimeResult, tract_error};

/// Element types a session accepts and returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Float,
    Long,
    Bool,
    /// Anything else the graph declares (f16, strings ...)
    Other,
}

impl From<DatumType> for DataType {
    fn from(datum: DatumType) -> Self {
        match datum {
            DatumType::F32 => DataType::Float,
            DatumType::I64 => DataType::Long,
            DatumType::Bool => DataType::Bool,
            _ => DataType::Other,
        }
    }
}

/// One input or output tensor
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    Float(Tensor<f32>),
    Long(Tensor<i64>),
    /// Flags such as the merged decoder's `use_cache_branch`
    Bool(Tensor<bool>),
}

impl TensorValue {
    pub fn dimensions(&self) -> &[usize] {
        match self {
            TensorValue::Float(t) => t.dimensions(),
            TensorValue::Long(t) => t.dimensions(),
            TensorValue::Bool(t) => t.dimensions(),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            TensorValue::Float(_) => DataType::Float,
            TensorValue::Long(_) => DataType::Long,
            TensorValue::Bool(_) => DataType::Bool,
        }
    }

    pub fn as_float(&self) -> Option<&Tensor<f32>> {
        match self {
            TensorValue::Float(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_float(self) -> Option<Tensor<f32>> {
        match self {
            TensorValue::Float(t) => Some(t),
            _ => None,
        }
    }

    pub(crate) fn to_tract(&self) -> RuntimeResult<TractTensor> {
        match self {
            TensorValue::Float(t) => {
                TractTensor::from_shape(t.dimensions(), t.as_slice()).map_err(tract_error)
            }
            TensorValue::Long(t) => {
                TractTensor::from_shape(t.dimensions(), t.as_slice()).map_err(tract_error)
            }
            TensorValue::Bool(t) => {
                TractTensor::from_shape(t.dimensions(), t.as_slice()).map_err(tract_error)
            }
        }
    }

    pub(crate) fn from_tract(name: &str, tensor: &TractTensor) -> RuntimeResult<Self> {
        match tensor.datum_type() {
            DatumType::F32 => {
                let data = tensor.as_slice::<f32>().map_err(tract_error)?.to_vec();
                Ok(TensorValue::Float(Tensor::new(tensor.shape(), data)?))
            }
            DatumType::I64 => {
                let data = tensor.as_slice::<i64>().map_err(tract_error)?.to_vec();
                Ok(TensorValue::Long(Tensor::new(tensor.shape(), data)?))
            }
            DatumType::Bool => {
                let data = tensor.as_slice::<bool>().map_err(tract_error)?.to_vec();
                Ok(TensorValue::Bool(Tensor::new(tensor.shape(), data)?))
            }
            other => Err(RuntimeError::UnsupportedDataType {
                name: name.to_string(),
                data_type: format!("{other:?}"),
            }),
        }
    }
}

impl From<Tensor<f32>> for TensorValue {
    fn from(tensor: Tensor<f32>) -> Self {
        TensorValue::Float(tensor)
    }
}

impl From<Tensor<i64>> for TensorValue {
    fn from(tensor: Tensor<i64>) -> Self {
        TensorValue::Long(tensor)
    }
}

impl From<Tensor<bool>> for TensorValue {
    fn from(tensor: Tensor<bool>) -> Self {
        TensorValue::Bool(tensor)
    }
}

/// Ordered name/tensor pairs
///
/// Order is significant for outputs: decoder caches are laid out
/// positionally and read back in the order the graph declares them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamedTensors {
    entries: Vec<(String, TensorValue)>,
}

impl NamedTensors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `name`, keeping its original position on replace
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<TensorValue>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<TensorValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&TensorValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Float tensor by name
    pub fn float(&self, name: &str) -> RuntimeResult<&Tensor<f32>> {
        let value = self
            .get(name)
            .ok_or_else(|| RuntimeError::MissingInput(name.to_string()))?;
        value
            .as_float()
            .ok_or_else(|| RuntimeError::UnsupportedDataType {
                name: name.to_string(),
                data_type: format!("{:?}", value.data_type()),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every float tensor in order, failing on the first non-float entry
    pub fn into_float_vec(self) -> RuntimeResult<Vec<Tensor<f32>>> {
        self.entries
            .into_iter()
            .map(|(name, value)| match value {
                TensorValue::Float(t) => Ok(t),
                other => Err(RuntimeError::UnsupportedDataType {
                    name,
                    data_type: format!("{:?}", other.data_type()),
                }),
            })
            .collect()
    }
}

impl FromIterator<(String, TensorValue)> for NamedTensors {
    fn from_iter<I: IntoIterator<Item = (String, TensorValue)>>(iter: I) -> Self {
        let mut tensors = NamedTensors::new();
        for (name, value) in iter {
            tensors.insert(name, value);
        }
        tensors
    }
}

/// Declared input or output of a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub data_type: DataType,
    /// `None` for symbolic dimensions
    pub shape: Vec<Option<usize>>,
}

/// Inputs and outputs reported by a loaded model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
}

impl ModelMetadata {
    pub fn input(&self, name: &str) -> Option<&TensorInfo> {
        self.inputs.iter().find(|info| info.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&TensorInfo> {
        self.outputs.iter().find(|info| info.name == name)
    }
}
