use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Tensors keyed by the graph's input or output name.
pub type NamedTensors = HashMap<String, Tensor>;

/// Element type of a tensor.
///
/// Every type name parses, but only `F32` tensors can be built: the LaMa graph
/// consumes and produces `float32` exclusively.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U8,
    U16,
    U32,
    S8,
    S16,
    S32,
    F16,
    #[default]
    F32,
    F64,
}

impl FromStr for DataType {
    type Err = std::convert::Infallible;

    fn from_str(dt: &str) -> Result<Self, Self::Err> {
        match dt.to_lowercase().as_str() {
            "u8" => Ok(DataType::U8),
            "u16" => Ok(DataType::U16),
            "u32" => Ok(DataType::U32),
            "s8" | "i8" => Ok(DataType::S8),
            "s16" | "i16" => Ok(DataType::S16),
            "s32" | "i32" => Ok(DataType::S32),
            "f16" => Ok(DataType::F16),
            "f32" | "float32" => Ok(DataType::F32),
            "f64" => Ok(DataType::F64),
            _ => {
                log::warn!(
                    "invalid or missing data type detected: '{}' - defaults to 'f32'",
                    dt,
                );

                Ok(DataType::F32)
            }
        }
    }
}

/// Raised whenever `product(shape)` and the buffer length disagree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("shape {shape:?} describes {expected} elements but the buffer holds {actual}")]
pub struct ShapeMismatchError {
    pub shape: Vec<usize>,
    pub expected: usize,
    pub actual: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TensorError {
    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatchError),

    #[error("unsupported tensor data type {0:?}, only f32 tensors are supported")]
    UnsupportedDataType(DataType),
}

/// A shaped, flat `f32` buffer.
///
/// The fields are private so the `product(shape) == data.len()` invariant
/// holds for every value of this type, including deserialized ones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    dtype: DataType,
    shape: Vec<usize>,
    data: Vec<f32>,
}

#[derive(Deserialize)]
struct RawTensor {
    #[serde(default)]
    dtype: DataType,
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = TensorError;

    fn try_from(raw: RawTensor) -> Result<Self, Self::Error> {
        Tensor::with_dtype(raw.dtype, raw.shape, raw.data)
    }
}

impl Tensor {
    /// Build an `f32` tensor.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, ShapeMismatchError> {
        let expected = element_count(&shape);

        if expected != data.len() {
            return Err(ShapeMismatchError {
                shape,
                expected,
                actual: data.len(),
            });
        }

        Ok(Tensor {
            dtype: DataType::F32,
            shape,
            data,
        })
    }

    pub fn with_dtype(
        dtype: DataType,
        shape: Vec<usize>,
        data: Vec<f32>,
    ) -> Result<Self, TensorError> {
        if dtype != DataType::F32 {
            return Err(TensorError::UnsupportedDataType(dtype));
        }

        Ok(Self::new(shape, data)?)
    }

    /// Tensor of the given shape filled with zeros.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let data = vec![0.0; element_count(&shape)];
        Tensor {
            dtype: DataType::F32,
            shape,
            data,
        }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_parts(self) -> (Vec<usize>, Vec<f32>) {
        (self.shape, self.data)
    }

    /// Same buffer under a new shape with the same element count.
    pub fn reshape(self, shape: Vec<usize>) -> Result<Self, ShapeMismatchError> {
        Self::new(shape, self.data)
    }
}

fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}
