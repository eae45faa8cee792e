//! Single-file SCXM container.
//!
//! ```text
//! 0       magic "SCXM"          4 bytes
//! 4       format version        u32 LE
//! 8       record count          u32 LE
//! 12      records               variable
//! end-32  SHA-256 of all preceding bytes
//! ```
//!
//! Records are whole-tensor quantized and sorted by name, so identical input
//! always produces identical bytes.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{FormatError, InputError, ScxResult};
use crate::quantize::Granularity;
use crate::record::{ByteCursor, Record};
use crate::source::{collect_sorted, TensorSource};
use crate::Tensor;

pub const MAGIC: [u8; 4] = *b"SCXM";
pub const FORMAT_VERSION: u32 = 2;
pub const HEADER_LEN: usize = 12;
pub const CHECKSUM_LEN: usize = 32;

/// Granularity of every record in a single-file container.
pub const CONTAINER_GRANULARITY: Granularity = Granularity::PerTensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Quantize independent tensors on the rayon pool.
    pub parallel: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig { parallel: true }
    }
}

pub fn sha256(bytes: &[u8]) -> [u8; CHECKSUM_LEN] {
    Sha256::digest(bytes).into()
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Quantize and encode each tensor into its own buffer, in input order.
pub(crate) fn encode_records(
    tensors: &[&Tensor],
    granularity: Granularity,
    parallel: bool,
) -> ScxResult<Vec<Vec<u8>>> {
    let encode = |t: &&Tensor| -> ScxResult<Vec<u8>> {
        let record = Record::from_tensor(t, granularity)?;
        debug!(
            "record '{}': {} elements, {} packed bytes, {} scales",
            record.name,
            record.element_count,
            record.packed.len(),
            record.scales.len()
        );
        record.to_bytes()
    };

    if parallel {
        tensors.par_iter().map(encode).collect()
    } else {
        tensors.iter().map(encode).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContainerWriter {
    config: CodecConfig,
}

impl ContainerWriter {
    pub fn new(config: CodecConfig) -> Self {
        ContainerWriter { config }
    }

    pub fn write<S: TensorSource + ?Sized>(&self, source: &S) -> ScxResult<Vec<u8>> {
        let tensors = collect_sorted(source)?;
        let count =
            u32::try_from(tensors.len()).map_err(|_| InputError::TooManyTensors(tensors.len()))?;

        let ordered: Vec<&Tensor> = tensors.values().collect();
        let records = encode_records(&ordered, CONTAINER_GRANULARITY, self.config.parallel)?;

        let body: usize = records.iter().map(Vec::len).sum();
        let mut buf = Vec::with_capacity(HEADER_LEN + body + CHECKSUM_LEN);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&count.to_le_bytes());
        for r in &records {
            buf.extend_from_slice(r);
        }

        let digest = sha256(&buf);
        buf.extend_from_slice(&digest);

        info!(
            "container: {} records, {} bytes, sha256 {}",
            count,
            buf.len(),
            to_hex(&digest)
        );
        Ok(buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerHeader {
    pub version: u32,
    pub record_count: u32,
    pub total_bytes: usize,
    pub checksum: String,
}

/// A container whose checksum and header have been verified.
#[derive(Debug)]
pub struct ContainerReader<'a> {
    body: &'a [u8],
    header: ContainerHeader,
}

impl<'a> ContainerReader<'a> {
    /// Checksum is verified before any other field is trusted.
    pub fn new(bytes: &'a [u8]) -> ScxResult<Self> {
        if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(FormatError::Truncated {
                offset: 0,
                needed: HEADER_LEN + CHECKSUM_LEN,
                available: bytes.len(),
            }
            .into());
        }

        let (body, stored) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        let computed = sha256(body);
        if computed.as_slice() != stored {
            return Err(FormatError::ChecksumMismatch {
                stored: to_hex(stored),
                computed: to_hex(&computed),
            }
            .into());
        }

        let mut cursor = ByteCursor::new(body);
        let magic: [u8; 4] = cursor.read_array()?;
        if magic != MAGIC {
            return Err(FormatError::BadMagic(magic).into());
        }
        let version = cursor.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion {
                found: version,
                expected: FORMAT_VERSION,
            }
            .into());
        }
        let record_count = cursor.read_u32()?;

        Ok(ContainerReader {
            body,
            header: ContainerHeader {
                version,
                record_count,
                total_bytes: bytes.len(),
                checksum: to_hex(stored),
            },
        })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// All records, in stored order. Fails on trailing bytes or repeated names.
    pub fn records(&self) -> ScxResult<Vec<Record>> {
        let mut cursor = ByteCursor::new(&self.body[HEADER_LEN..]);
        let mut seen = BTreeSet::new();
        // A record is at least 20 bytes of length prefixes and counts.
        let mut records =
            Vec::with_capacity((self.header.record_count as usize).min(cursor.remaining() / 20));

        for _ in 0..self.header.record_count {
            let record = Record::decode(&mut cursor)?;
            if !seen.insert(record.name.clone()) {
                return Err(FormatError::DuplicateRecord(record.name).into());
            }
            records.push(record);
        }
        if !cursor.is_empty() {
            return Err(FormatError::TrailingBytes(cursor.remaining()).into());
        }
        Ok(records)
    }

    /// Dequantized tensors with flat `[element_count]` shapes.
    pub fn read(&self) -> ScxResult<BTreeMap<String, Tensor>> {
        let records = self.records()?;
        let decoded: Vec<Tensor> = records
            .par_iter()
            .map(|r| {
                let data = r.dequantize(CONTAINER_GRANULARITY)?;
                Ok(Tensor {
                    name: r.name.clone(),
                    shape: vec![data.len()],
                    data,
                })
            })
            .collect::<ScxResult<Vec<Tensor>>>()?;

        Ok(decoded.into_iter().map(|t| (t.name.clone(), t)).collect())
    }

    /// Like [`read`](Self::read), restoring shapes for the named tensors.
    pub fn read_with_shapes(
        &self,
        shapes: &BTreeMap<String, Vec<usize>>,
    ) -> ScxResult<BTreeMap<String, Tensor>> {
        let mut tensors = self.read()?;
        for (name, shape) in shapes {
            let Some(t) = tensors.get_mut(name) else {
                continue;
            };
            t.reshape(shape.clone())?;
        }
        Ok(tensors)
    }
}

/// Convenience: verify and decode a whole container.
pub fn read_container(bytes: &[u8]) -> ScxResult<BTreeMap<String, Tensor>> {
    ContainerReader::new(bytes)?.read()
}
