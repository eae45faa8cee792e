use serde::{Deserialize, Serialize};

pub mod container;
pub mod error;
pub mod manifest;
pub mod metrics;
pub mod pack;
pub mod publish;
pub mod quantize;
pub mod record;
pub mod shard;
pub mod source;

pub use container::{
    read_container, CodecConfig, ContainerHeader, ContainerReader, ContainerWriter,
    CHECKSUM_LEN, FORMAT_VERSION, HEADER_LEN, MAGIC,
};
pub use error::{FormatError, InputError, ScxError, ScxResult};
pub use manifest::{Architecture, Manifest};
pub use metrics::ErrorStats;
pub use pack::{pack_int4, unpack_int4};
pub use quantize::{
    quantize, Granularity, QuantizedBlock, QuantizedTensor, DEFAULT_BLOCK_SIZE, SCALE_EPSILON,
};
pub use record::Record;
pub use shard::{partition_by_layer, ShardIndex, ShardKey, ShardSet, ShardSetReader, ShardSetWriter};
pub use source::{collect_sorted, JsonTensorMap, TensorSource};

/// A named, shaped float32 tensor in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

fn expected_len(name: &str, shape: &[usize]) -> Result<usize, InputError> {
    shape.iter().try_fold(1usize, |acc, &d| {
        acc.checked_mul(d).ok_or_else(|| InputError::ShapeOverflow {
            name: name.to_string(),
            shape: shape.to_vec(),
        })
    })
}

impl Tensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Self {
        Tensor {
            name: name.into(),
            shape,
            data,
        }
    }

    /// Flat tensor of shape `[data.len()]`.
    pub fn flat(name: impl Into<String>, data: Vec<f32>) -> Self {
        let shape = vec![data.len()];
        Tensor::new(name, shape, data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reject anything the codec cannot represent faithfully.
    pub fn validate(&self) -> Result<(), InputError> {
        if self.name.is_empty() {
            return Err(InputError::EmptyName);
        }
        if self.name.len() > u32::MAX as usize {
            return Err(InputError::FieldTooLarge {
                name: self.name.chars().take(64).collect(),
                field: "name",
                len: self.name.len(),
            });
        }

        let expected = expected_len(&self.name, &self.shape)?;
        if expected != self.data.len() {
            return Err(InputError::ShapeMismatch {
                name: self.name.clone(),
                shape: self.shape.clone(),
                expected,
                actual: self.data.len(),
            });
        }

        if let Some(index) = self.data.iter().position(|v| !v.is_finite()) {
            return Err(InputError::NonFinite {
                name: self.name.clone(),
                index,
            });
        }

        let max_abs = quantize::max_abs(&self.data);
        if max_abs > quantize::MAX_ABS_REPRESENTABLE {
            return Err(InputError::ScaleOverflow {
                name: self.name.clone(),
                max_abs,
            });
        }
        Ok(())
    }

    /// Replace the shape; its product must equal the element count.
    pub fn reshape(&mut self, shape: Vec<usize>) -> Result<(), InputError> {
        let expected = expected_len(&self.name, &shape)?;
        if expected != self.data.len() {
            return Err(InputError::ShapeMismatch {
                name: self.name.clone(),
                shape,
                expected,
                actual: self.data.len(),
            });
        }
        self.shape = shape;
        Ok(())
    }
}
