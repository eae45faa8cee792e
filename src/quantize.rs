//! Symmetric INT4 quantization.
//!
//! Scale = max(max_abs / 7, 1e-8), rounded up to the next f16 so the stored
//! scale is exactly the one values were quantized against. Values map to
//! `clamp(round(x / scale), -8, 7)` with ties rounded away from zero.

use std::borrow::Cow;

use half::f16;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{FormatError, InputError, ScxResult};

/// Floor applied to the f32 scale so all-zero and empty inputs never divide by zero.
pub const SCALE_EPSILON: f32 = 1e-8;

pub const QMIN: i8 = -8;
pub const QMAX: i8 = 7;

/// Largest magnitude whose scale still fits in an f16.
pub const MAX_ABS_REPRESENTABLE: f32 = 7.0 * 65504.0;

/// Block size used by shard sets unless configured otherwise.
pub const DEFAULT_BLOCK_SIZE: usize = 128;

/// Tensors at least this long quantize their blocks on the rayon pool.
pub const PARALLEL_THRESHOLD: usize = 1 << 16;

/// Quantization unit: one scale per tensor, or one per fixed-size block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    PerTensor,
    Block(usize),
}

impl Granularity {
    pub fn block(size: usize) -> ScxResult<Self> {
        let g = Granularity::Block(size);
        g.validate()?;
        Ok(g)
    }

    pub fn validate(&self) -> ScxResult<()> {
        match *self {
            Granularity::PerTensor => Ok(()),
            Granularity::Block(size) if size == 0 || size > u32::MAX as usize => {
                Err(InputError::InvalidBlockSize(size).into())
            }
            Granularity::Block(_) => Ok(()),
        }
    }

    /// Length after zero padding to whole blocks.
    pub fn padded_len(&self, len: usize) -> usize {
        match *self {
            Granularity::PerTensor => len,
            Granularity::Block(size) => len + padding_len(len, size),
        }
    }

    /// Number of scales a tensor of `len` elements carries.
    pub fn scale_count(&self, len: usize) -> usize {
        match *self {
            Granularity::PerTensor => 1,
            Granularity::Block(size) => len.div_ceil(size),
        }
    }
}

/// Zeros appended so `len` becomes a multiple of `block_size`.
#[inline]
pub fn padding_len(len: usize, block_size: usize) -> usize {
    (block_size - len % block_size) % block_size
}

/// Smallest f16 that is >= max(max_abs / 7, epsilon), saturating at f16::MAX.
pub fn storage_scale(max_abs: f32) -> f16 {
    let scale = (max_abs / 7.0).max(SCALE_EPSILON);
    let h = f16::from_f32(scale);
    if !h.is_finite() {
        return f16::MAX;
    }
    if h.to_f32() >= scale || h == f16::MAX {
        h
    } else {
        f16::from_bits(h.to_bits() + 1)
    }
}

#[inline]
pub fn quantize_value(x: f32, scale: f32) -> i8 {
    (x / scale).round().clamp(QMIN as f32, QMAX as f32) as i8
}

#[inline]
pub fn max_abs(values: &[f32]) -> f32 {
    values.iter().map(|v| v.abs()).fold(0.0_f32, f32::max)
}

/// One scale and its quantized run.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedBlock {
    pub scale: f16,
    pub values: Vec<i8>,
}

pub fn quantize_block(values: &[f32]) -> QuantizedBlock {
    let scale = storage_scale(max_abs(values));
    let s = scale.to_f32();
    QuantizedBlock {
        scale,
        values: values.iter().map(|&x| quantize_value(x, s)).collect(),
    }
}

/// A whole tensor after quantization. `values` covers the padded length.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    pub element_count: usize,
    pub scales: Vec<f16>,
    pub values: Vec<i8>,
}

pub fn quantize(values: &[f32], granularity: Granularity) -> ScxResult<QuantizedTensor> {
    granularity.validate()?;

    let block_size = match granularity {
        Granularity::PerTensor => {
            let block = quantize_block(values);
            return Ok(QuantizedTensor {
                element_count: values.len(),
                scales: vec![block.scale],
                values: block.values,
            });
        }
        Granularity::Block(size) => size,
    };

    let pad = padding_len(values.len(), block_size);
    let padded: Cow<'_, [f32]> = if pad == 0 {
        Cow::Borrowed(values)
    } else {
        let mut v = Vec::with_capacity(values.len() + pad);
        v.extend_from_slice(values);
        v.resize(values.len() + pad, 0.0);
        Cow::Owned(v)
    };

    let blocks: Vec<QuantizedBlock> = if padded.len() >= PARALLEL_THRESHOLD {
        padded.par_chunks(block_size).map(quantize_block).collect()
    } else {
        padded.chunks(block_size).map(quantize_block).collect()
    };

    let mut scales = Vec::with_capacity(blocks.len());
    let mut quantized = Vec::with_capacity(padded.len());
    for block in blocks {
        scales.push(block.scale);
        quantized.extend(block.values);
    }

    Ok(QuantizedTensor {
        element_count: values.len(),
        scales,
        values: quantized,
    })
}

impl QuantizedTensor {
    /// Why the scale and value counts disagree with the element count, if they do.
    pub(crate) fn layout_problem(&self, granularity: Granularity) -> Option<String> {
        let scales = granularity.scale_count(self.element_count);
        if self.scales.len() != scales {
            return Some(format!(
                "{} scales for {} elements, expected {}",
                self.scales.len(),
                self.element_count,
                scales
            ));
        }
        let padded = granularity.padded_len(self.element_count);
        if self.values.len() != padded {
            return Some(format!(
                "{} quantized values, expected {}",
                self.values.len(),
                padded
            ));
        }
        self.scales
            .iter()
            .find(|s| !s.is_finite() || s.is_sign_negative())
            .map(|bad| format!("invalid scale {}", bad))
    }

    /// Check scale and value counts against the element count.
    pub fn check_layout(&self, granularity: Granularity) -> ScxResult<()> {
        granularity.validate()?;
        match self.layout_problem(granularity) {
            Some(reason) => Err(FormatError::Layout(reason).into()),
            None => Ok(()),
        }
    }

    /// Expand back to `element_count` floats; block padding is dropped.
    pub fn dequantize(&self, granularity: Granularity) -> ScxResult<Vec<f32>> {
        self.check_layout(granularity)?;

        let mut out = match granularity {
            Granularity::PerTensor => {
                let s = self.scales[0].to_f32();
                self.values.iter().map(|&q| q as f32 * s).collect::<Vec<f32>>()
            }
            Granularity::Block(size) => {
                let expand = |(q, scale): (&[i8], &f16)| {
                    let s = scale.to_f32();
                    q.iter().map(|&v| v as f32 * s).collect::<Vec<f32>>()
                };
                let parts: Vec<Vec<f32>> = if self.values.len() >= PARALLEL_THRESHOLD {
                    self.values
                        .par_chunks(size)
                        .zip(self.scales.par_iter())
                        .map(expand)
                        .collect()
                } else {
                    self.values
                        .chunks(size)
                        .zip(self.scales.iter())
                        .map(expand)
                        .collect()
                };
                parts.concat()
            }
        };

        out.truncate(self.element_count);
        Ok(out)
    }
}
