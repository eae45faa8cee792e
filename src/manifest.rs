//! Sidecar metadata for shard sets: quantization policy, file list and the
//! shapes a runtime needs to map flat buffers back onto named tensors.

use serde::{Deserialize, Serialize};

use crate::container::FORMAT_VERSION;
use crate::error::{FormatError, ScxResult};
use crate::quantize::Granularity;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const INDEX_FILE: &str = "shard_offsets.json";
pub const SHARDED_FORMAT: &str = "SCXM-sharded";
pub const SCHEME_BLOCKWISE: &str = "int4-blockwise-symmetric";
pub const SCALE_DTYPE: &str = "f16";
pub const ROUNDING: &str = "half-away-from-zero";

/// Model dimensions a downstream runtime uses to rebuild its layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub intermediate_dim: usize,
    pub vocab_size: usize,
}

impl Architecture {
    /// `head_dim = hidden / heads`; `num_kv_heads` defaults to `num_heads`.
    pub fn new(
        hidden_dim: usize,
        num_layers: usize,
        num_heads: usize,
        num_kv_heads: Option<usize>,
        intermediate_dim: usize,
        vocab_size: usize,
    ) -> Self {
        Architecture {
            hidden_dim,
            num_layers,
            num_heads,
            num_kv_heads: num_kv_heads.unwrap_or(num_heads),
            head_dim: if num_heads == 0 { 0 } else { hidden_dim / num_heads },
            intermediate_dim,
            vocab_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationInfo {
    pub scheme: String,
    pub block_size: usize,
    pub scale_dtype: String,
    pub rounding: String,
}

impl QuantizationInfo {
    pub fn blockwise(block_size: usize) -> Self {
        QuantizationInfo {
            scheme: SCHEME_BLOCKWISE.to_string(),
            block_size,
            scale_dtype: SCALE_DTYPE.to_string(),
            rounding: ROUNDING.to_string(),
        }
    }

    pub fn granularity(&self) -> ScxResult<Granularity> {
        if self.scheme != SCHEME_BLOCKWISE {
            return Err(bad(format!("unsupported quantization scheme '{}'", self.scheme)));
        }
        if self.scale_dtype != SCALE_DTYPE {
            return Err(bad(format!("unsupported scale dtype '{}'", self.scale_dtype)));
        }
        if self.rounding != ROUNDING {
            return Err(bad(format!("unsupported rounding '{}'", self.rounding)));
        }
        Granularity::block(self.block_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub elements: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub name: String,
    pub file: String,
    pub bytes: u64,
    pub sha256: String,
    pub tensors: Vec<TensorEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format: String,
    pub format_version: u32,
    pub quantization: QuantizationInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<Architecture>,
    pub shards: Vec<ShardEntry>,
    pub index_file: String,
    pub total_bytes: u64,
}

fn bad(reason: String) -> crate::ScxError {
    FormatError::BadManifest(reason).into()
}

fn check_file_name(file: &str) -> ScxResult<()> {
    if file.is_empty() || file.contains('/') || file.contains('\\') || file.starts_with('.') {
        return Err(bad(format!("file '{}' escapes the set directory", file)));
    }
    Ok(())
}

impl Manifest {
    pub fn to_json(&self) -> ScxResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> ScxResult<Self> {
        let manifest: Manifest = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Fails closed on anything this reader does not understand.
    pub fn validate(&self) -> ScxResult<()> {
        if self.format != SHARDED_FORMAT {
            return Err(bad(format!("unknown format '{}'", self.format)));
        }
        if self.format_version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion {
                found: self.format_version,
                expected: FORMAT_VERSION,
            }
            .into());
        }
        self.quantization.granularity()?;
        check_file_name(&self.index_file)?;

        let mut total = 0u64;
        for shard in &self.shards {
            check_file_name(&shard.file)?;
            for t in &shard.tensors {
                let product = t.shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d));
                if product != Some(t.elements) {
                    return Err(bad(format!(
                        "tensor '{}' shape {:?} does not match {} elements",
                        t.name, t.shape, t.elements
                    )));
                }
            }
            total = total
                .checked_add(shard.bytes)
                .ok_or_else(|| bad("total byte count overflows".to_string()))?;
        }
        if total != self.total_bytes {
            return Err(bad(format!(
                "shards sum to {} bytes, manifest says {}",
                total, self.total_bytes
            )));
        }
        Ok(())
    }

    pub fn shard(&self, name: &str) -> Option<(usize, &ShardEntry)> {
        self.shards.iter().enumerate().find(|(_, s)| s.name == name)
    }
}
