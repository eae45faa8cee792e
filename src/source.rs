//! Where tensors come from. The codec only needs names, shapes and flat values.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::error::{InputError, ScxResult};
use crate::Tensor;

/// Anything that can hand over materialized float tensors.
pub trait TensorSource {
    fn tensors(&self) -> ScxResult<Vec<Tensor>>;
}

impl TensorSource for Vec<Tensor> {
    fn tensors(&self) -> ScxResult<Vec<Tensor>> {
        Ok(self.clone())
    }
}

impl TensorSource for [Tensor] {
    fn tensors(&self) -> ScxResult<Vec<Tensor>> {
        Ok(self.to_vec())
    }
}

impl TensorSource for BTreeMap<String, Tensor> {
    fn tensors(&self) -> ScxResult<Vec<Tensor>> {
        Ok(self.values().cloned().collect())
    }
}

/// Validate every tensor and key them by name in lexicographic order.
///
/// Runs before any quantization so a bad tensor aborts the whole conversion.
pub fn collect_sorted<S: TensorSource + ?Sized>(source: &S) -> ScxResult<BTreeMap<String, Tensor>> {
    let mut out = BTreeMap::new();
    for t in source.tensors()? {
        t.validate()?;
        if out.contains_key(&t.name) {
            return Err(InputError::DuplicateName(t.name).into());
        }
        out.insert(t.name.clone(), t);
    }
    Ok(out)
}

/// A JSON object of `name -> nested numeric array` or `name -> {shape, data}`.
#[derive(Debug, Clone)]
pub struct JsonTensorMap {
    root: serde_json::Map<String, Value>,
}

impl JsonTensorMap {
    pub fn parse(json: &str) -> ScxResult<Self> {
        match serde_json::from_str::<Value>(json)? {
            Value::Object(root) => Ok(JsonTensorMap { root }),
            _ => Err(InputError::Malformed {
                name: String::from("<root>"),
                reason: "expected a JSON object of tensors".to_string(),
            }
            .into()),
        }
    }

    pub fn from_path(path: &Path) -> ScxResult<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn len(&self) -> usize {
        self.root.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

fn malformed(name: &str, reason: impl Into<String>) -> InputError {
    InputError::Malformed {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn leaf(name: &str, v: &Value) -> Result<f32, InputError> {
    v.as_f64()
        .map(|x| x as f32)
        .ok_or_else(|| malformed(name, format!("non-numeric value {}", v)))
}

/// Shape of a rectangular nested array; scalars have an empty shape.
fn infer_shape(name: &str, v: &Value) -> Result<Vec<usize>, InputError> {
    match v {
        Value::Array(items) => {
            let mut shape = vec![items.len()];
            if let Some(first) = items.first() {
                let inner = infer_shape(name, first)?;
                for item in &items[1..] {
                    if infer_shape(name, item)? != inner {
                        return Err(malformed(name, "ragged nested array"));
                    }
                }
                shape.extend(inner);
            }
            Ok(shape)
        }
        other => {
            leaf(name, other)?;
            Ok(Vec::new())
        }
    }
}

fn flatten_into(name: &str, v: &Value, out: &mut Vec<f32>) -> Result<(), InputError> {
    match v {
        Value::Array(items) => items.iter().try_for_each(|item| flatten_into(name, item, out)),
        other => {
            out.push(leaf(name, other)?);
            Ok(())
        }
    }
}

fn explicit_tensor(name: &str, obj: &serde_json::Map<String, Value>) -> Result<Tensor, InputError> {
    let shape = obj
        .get("shape")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed(name, "missing 'shape' array"))?
        .iter()
        .map(|d| {
            d.as_u64()
                .map(|d| d as usize)
                .ok_or_else(|| malformed(name, format!("invalid dimension {}", d)))
        })
        .collect::<Result<Vec<usize>, InputError>>()?;

    let mut data = Vec::new();
    match obj.get("data") {
        Some(Value::Array(items)) => {
            for item in items {
                data.push(leaf(name, item)?);
            }
        }
        _ => return Err(malformed(name, "missing 'data' array")),
    }

    Ok(Tensor {
        name: name.to_string(),
        shape,
        data,
    })
}

impl TensorSource for JsonTensorMap {
    fn tensors(&self) -> ScxResult<Vec<Tensor>> {
        let mut out = Vec::with_capacity(self.root.len());
        for (name, value) in &self.root {
            let tensor = match value {
                Value::Object(obj) => explicit_tensor(name, obj)?,
                other => {
                    let shape = infer_shape(name, other)?;
                    let mut data = Vec::new();
                    flatten_into(name, other, &mut data)?;
                    Tensor {
                        name: name.clone(),
                        shape,
                        data,
                    }
                }
            };
            out.push(tensor);
        }
        Ok(out)
    }
}
