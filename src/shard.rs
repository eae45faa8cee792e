//! Sharded layout for large models.
//!
//! Each shard is its own blob of block-quantized records (no container header).
//! `shard_offsets.json` lists where each shard starts in the concatenation of
//! all blobs, and `manifest.json` carries block size, digests and shapes.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::container::{encode_records, sha256, to_hex, CodecConfig, FORMAT_VERSION};
use crate::error::{FormatError, InputError, ScxResult};
use crate::manifest::{
    Architecture, Manifest, QuantizationInfo, ShardEntry, TensorEntry, INDEX_FILE, MANIFEST_FILE,
    SHARDED_FORMAT,
};
use crate::publish::publish_dir;
use crate::quantize::Granularity;
use crate::record::{ByteCursor, Record};
use crate::source::{collect_sorted, TensorSource};
use crate::Tensor;

/// Shard identity. Named shards sort before layers; layers sort numerically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShardKey {
    Named(String),
    Layer(usize),
}

impl ShardKey {
    /// `model.layers.3.q_proj` goes to layer 3; `lm_head.weight` to `lm_head`.
    pub fn for_tensor(name: &str) -> Self {
        let parts: Vec<&str> = name.split('.').collect();
        for pair in parts.windows(2) {
            if pair[0] == "layers" {
                if let Ok(i) = pair[1].parse::<usize>() {
                    return ShardKey::Layer(i);
                }
            }
        }

        let head: String = parts[0]
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        if head.is_empty() {
            return ShardKey::Named("tensor".to_string());
        }
        // `layer_0.bias` lands in the same shard as `layers.0.*`.
        if let Some(i) = head
            .strip_prefix("layer_")
            .and_then(|n| n.parse::<usize>().ok().filter(|i| i.to_string() == n))
        {
            return ShardKey::Layer(i);
        }
        ShardKey::Named(head)
    }

    /// Distinct keys from [`ShardKey::for_tensor`] always have distinct names.
    pub fn name(&self) -> String {
        match self {
            ShardKey::Named(n) => n.clone(),
            ShardKey::Layer(i) => format!("layer_{}", i),
        }
    }
}

/// Group tensors into shards, validating all of them first.
pub fn partition_by_layer<S: TensorSource + ?Sized>(
    source: &S,
) -> ScxResult<BTreeMap<ShardKey, Vec<Tensor>>> {
    let mut shards: BTreeMap<ShardKey, Vec<Tensor>> = BTreeMap::new();
    for (name, tensor) in collect_sorted(source)? {
        shards.entry(ShardKey::for_tensor(&name)).or_default().push(tensor);
    }
    Ok(shards)
}

/// Start offset of every shard within the concatenated shard blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardIndex {
    pub offsets: Vec<u64>,
}

impl ShardIndex {
    /// Returns the index and the total byte count.
    pub fn from_sizes(sizes: &[u64]) -> (Self, u64) {
        let mut total = 0u64;
        let offsets = sizes
            .iter()
            .map(|&len| {
                let start = total;
                total += len;
                start
            })
            .collect();
        (ShardIndex { offsets }, total)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Byte range of shard `i` given the total length of all shards.
    pub fn range(&self, i: usize, total_bytes: u64) -> Option<Range<u64>> {
        let start = *self.offsets.get(i)?;
        let end = self.offsets.get(i + 1).copied().unwrap_or(total_bytes);
        Some(start..end)
    }

    /// Offsets must be non-decreasing, start at 0, and agree with the manifest sizes.
    pub fn validate(&self, manifest: &Manifest) -> ScxResult<()> {
        let bad = |reason: String| -> crate::ScxError { FormatError::BadIndex(reason).into() };

        if self.offsets.len() != manifest.shards.len() {
            return Err(bad(format!(
                "{} offsets for {} shards",
                self.offsets.len(),
                manifest.shards.len()
            )));
        }
        if let Some(pair) = self.offsets.windows(2).find(|w| w[1] < w[0]) {
            return Err(bad(format!("offset {} follows {}", pair[1], pair[0])));
        }

        let sizes: Vec<u64> = manifest.shards.iter().map(|s| s.bytes).collect();
        let (expected, total) = ShardIndex::from_sizes(&sizes);
        if expected != *self {
            return Err(bad("offsets disagree with shard sizes".to_string()));
        }
        if total != manifest.total_bytes {
            return Err(bad(format!(
                "shards end at {}, manifest total is {}",
                total, manifest.total_bytes
            )));
        }
        Ok(())
    }
}

fn check_shard_name(name: &str) -> Result<(), InputError> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(InputError::Malformed {
            name: name.to_string(),
            reason: "shard names may only use [A-Za-z0-9_-]".to_string(),
        })
    }
}

/// Decode one shard blob against its manifest entry.
fn decode_shard(
    blob: &[u8],
    entry: &ShardEntry,
    granularity: Granularity,
) -> ScxResult<BTreeMap<String, Tensor>> {
    if blob.len() as u64 != entry.bytes {
        return Err(FormatError::Truncated {
            offset: 0,
            needed: entry.bytes as usize,
            available: blob.len(),
        }
        .into());
    }
    let computed = to_hex(&sha256(blob));
    if computed != entry.sha256 {
        return Err(FormatError::ChecksumMismatch {
            stored: entry.sha256.clone(),
            computed,
        }
        .into());
    }

    let mut cursor = ByteCursor::new(blob);
    let mut out = BTreeMap::new();
    for expected in &entry.tensors {
        let record = Record::decode(&mut cursor)?;
        if record.name != expected.name || record.element_count != expected.elements as u64 {
            return Err(FormatError::MalformedRecord {
                name: record.name,
                reason: format!(
                    "expected '{}' with {} elements in shard '{}'",
                    expected.name, expected.elements, entry.name
                ),
            }
            .into());
        }
        let data = record.dequantize(granularity)?;
        out.insert(
            record.name.clone(),
            Tensor {
                name: record.name,
                shape: expected.shape.clone(),
                data,
            },
        );
    }
    if !cursor.is_empty() {
        return Err(FormatError::TrailingBytes(cursor.remaining()).into());
    }
    Ok(out)
}

/// An encoded shard set held in memory.
#[derive(Debug, Clone)]
pub struct ShardSet {
    pub manifest: Manifest,
    pub index: ShardIndex,
    pub blobs: Vec<Vec<u8>>,
}

impl ShardSet {
    /// Every file of the set, shards first.
    pub fn files(&self) -> ScxResult<Vec<(String, Vec<u8>)>> {
        let mut files: Vec<(String, Vec<u8>)> = self
            .manifest
            .shards
            .iter()
            .zip(&self.blobs)
            .map(|(entry, blob)| (entry.file.clone(), blob.clone()))
            .collect();
        files.push((
            self.manifest.index_file.clone(),
            serde_json::to_vec(&self.index)?,
        ));
        files.push((MANIFEST_FILE.to_string(), self.manifest.to_json()?.into_bytes()));
        Ok(files)
    }

    /// Publish into `dir`, which must not exist yet.
    pub fn write_to_dir(&self, dir: &Path) -> ScxResult<()> {
        publish_dir(dir, &self.files()?)?;
        info!(
            "shard set: {} shards, {} bytes -> {}",
            self.blobs.len(),
            self.manifest.total_bytes,
            dir.display()
        );
        Ok(())
    }

    pub fn assembled(&self) -> Vec<u8> {
        self.blobs.concat()
    }

    pub fn read_shard(&self, name: &str) -> ScxResult<BTreeMap<String, Tensor>> {
        let (i, entry) = self
            .manifest
            .shard(name)
            .ok_or_else(|| FormatError::BadManifest(format!("no shard named '{}'", name)))?;
        let blob = self.blobs.get(i).ok_or_else(|| {
            FormatError::BadManifest(format!(
                "shard '{}' is entry {} but only {} blobs are held",
                name,
                i,
                self.blobs.len()
            ))
        })?;
        decode_shard(blob, entry, self.manifest.quantization.granularity()?)
    }
}

#[derive(Debug, Clone)]
pub struct ShardSetWriter {
    block_size: usize,
    granularity: Granularity,
    config: CodecConfig,
}

impl ShardSetWriter {
    pub fn new(block_size: usize, config: CodecConfig) -> ScxResult<Self> {
        Ok(ShardSetWriter {
            block_size,
            granularity: Granularity::block(block_size)?,
            config,
        })
    }

    /// Encode shards in the given emission order.
    pub fn write(
        &self,
        shards: Vec<(String, Vec<Tensor>)>,
        architecture: Option<Architecture>,
    ) -> ScxResult<ShardSet> {
        let mut first_tensor: BTreeMap<String, String> = BTreeMap::new();
        let mut tensor_names = BTreeSet::new();
        let mut sorted = Vec::with_capacity(shards.len());
        for (name, tensors) in shards {
            check_shard_name(&name)?;
            let tensors = collect_sorted(&tensors)?;
            let Some(first) = tensors.keys().next().cloned() else {
                return Err(InputError::EmptyShard(name).into());
            };
            if let Some(earlier) = first_tensor.get(&name) {
                return Err(InputError::DuplicateShard {
                    shard: name,
                    first: earlier.clone(),
                    second: first,
                }
                .into());
            }
            first_tensor.insert(name.clone(), first);
            for t in tensors.keys() {
                if !tensor_names.insert(t.clone()) {
                    return Err(InputError::DuplicateName(t.clone()).into());
                }
            }
            sorted.push((name, tensors));
        }

        let encode = |(name, tensors): &(String, BTreeMap<String, Tensor>)| -> ScxResult<Vec<u8>> {
            let ordered: Vec<&Tensor> = tensors.values().collect();
            let blob = encode_records(&ordered, self.granularity, self.config.parallel)?.concat();
            debug!("shard '{}': {} tensors, {} bytes", name, ordered.len(), blob.len());
            Ok(blob)
        };
        let blobs: Vec<Vec<u8>> = if self.config.parallel {
            sorted.par_iter().map(encode).collect::<ScxResult<_>>()?
        } else {
            sorted.iter().map(encode).collect::<ScxResult<_>>()?
        };

        // Offsets and digests only once every blob is final.
        let sizes: Vec<u64> = blobs.iter().map(|b| b.len() as u64).collect();
        let (index, total_bytes) = ShardIndex::from_sizes(&sizes);

        let entries = sorted
            .iter()
            .zip(&blobs)
            .map(|((name, tensors), blob)| ShardEntry {
                name: name.clone(),
                file: format!("{}.bin", name),
                bytes: blob.len() as u64,
                sha256: to_hex(&sha256(blob)),
                tensors: tensors
                    .values()
                    .map(|t| TensorEntry {
                        name: t.name.clone(),
                        shape: t.shape.clone(),
                        elements: t.data.len(),
                    })
                    .collect(),
            })
            .collect();

        let manifest = Manifest {
            format: SHARDED_FORMAT.to_string(),
            format_version: FORMAT_VERSION,
            quantization: QuantizationInfo::blockwise(self.block_size),
            architecture,
            shards: entries,
            index_file: INDEX_FILE.to_string(),
            total_bytes,
        };

        Ok(ShardSet {
            manifest,
            index,
            blobs,
        })
    }

    /// Partition by layer (see [`partition_by_layer`]) and encode.
    pub fn write_partitioned<S: TensorSource + ?Sized>(
        &self,
        source: &S,
        architecture: Option<Architecture>,
    ) -> ScxResult<ShardSet> {
        let shards = partition_by_layer(source)?
            .into_iter()
            .map(|(key, tensors)| (key.name(), tensors))
            .collect();
        self.write(shards, architecture)
    }
}

/// A published shard set opened for random access.
#[derive(Debug, Clone)]
pub struct ShardSetReader {
    dir: PathBuf,
    manifest: Manifest,
    index: ShardIndex,
    granularity: Granularity,
}

impl ShardSetReader {
    pub fn open(dir: &Path) -> ScxResult<Self> {
        let manifest = Manifest::from_json(&fs::read_to_string(dir.join(MANIFEST_FILE))?)?;
        let index: ShardIndex =
            serde_json::from_slice(&fs::read(dir.join(&manifest.index_file))?)?;
        index.validate(&manifest)?;
        let granularity = manifest.quantization.granularity()?;

        Ok(ShardSetReader {
            dir: dir.to_path_buf(),
            manifest,
            index,
            granularity,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn index(&self) -> &ShardIndex {
        &self.index
    }

    pub fn shard_names(&self) -> Vec<&str> {
        self.manifest.shards.iter().map(|s| s.name.as_str()).collect()
    }

    fn entry(&self, name: &str) -> ScxResult<(usize, &ShardEntry)> {
        self.manifest
            .shard(name)
            .ok_or_else(|| FormatError::BadManifest(format!("no shard named '{}'", name)).into())
    }

    /// Reads only the requested shard's file.
    pub fn read_shard(&self, name: &str) -> ScxResult<BTreeMap<String, Tensor>> {
        let (_, entry) = self.entry(name)?;
        let blob = fs::read(self.dir.join(&entry.file))?;
        decode_shard(&blob, entry, self.granularity)
    }

    pub fn read_all(&self) -> ScxResult<BTreeMap<String, Tensor>> {
        let mut out = BTreeMap::new();
        for entry in &self.manifest.shards {
            out.extend(self.read_shard(&entry.name)?);
        }
        Ok(out)
    }

    /// Concatenate every shard in index order, verifying each digest.
    pub fn assemble(&self) -> ScxResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.manifest.total_bytes as usize);
        for entry in &self.manifest.shards {
            let blob = fs::read(self.dir.join(&entry.file))?;
            let computed = to_hex(&sha256(&blob));
            if computed != entry.sha256 {
                return Err(FormatError::ChecksumMismatch {
                    stored: entry.sha256.clone(),
                    computed,
                }
                .into());
            }
            out.extend_from_slice(&blob);
        }
        if out.len() as u64 != self.manifest.total_bytes {
            return Err(FormatError::BadIndex(format!(
                "assembled {} bytes, expected {}",
                out.len(),
                self.manifest.total_bytes
            ))
            .into());
        }
        Ok(out)
    }

    /// Decode one shard straight out of an assembled blob via the offset index.
    pub fn read_assembled_shard(
        &self,
        assembled: &[u8],
        name: &str,
    ) -> ScxResult<BTreeMap<String, Tensor>> {
        let (i, entry) = self.entry(name)?;
        let range = self
            .index
            .range(i, self.manifest.total_bytes)
            .ok_or_else(|| FormatError::BadIndex(format!("no offset for shard {}", i)))?;
        let (start, end) = (range.start as usize, range.end as usize);
        if end > assembled.len() {
            return Err(FormatError::Truncated {
                offset: start,
                needed: end - start,
                available: assembled.len().saturating_sub(start),
            }
            .into());
        }
        decode_shard(&assembled[start..end], entry, self.granularity)
    }
}
