//! Shard sets published to disk and read back.

use std::fs;

use scxpak::manifest::{INDEX_FILE, MANIFEST_FILE};
use scxpak::{
    Architecture, CodecConfig, FormatError, Manifest, ScxError, ShardIndex, ShardSetReader,
    ShardSetWriter, Tensor,
};

fn model() -> Vec<Tensor> {
    let mut tensors = vec![
        Tensor::new(
            "embed_tokens.weight",
            vec![10, 16],
            (0..160).map(|i| (i as f32 * 0.01).cos()).collect(),
        ),
        Tensor::new(
            "norm.weight",
            vec![16],
            (0..16).map(|i| 1.0 + i as f32 * 0.001).collect(),
        ),
    ];
    for layer in 0..3 {
        tensors.push(Tensor::new(
            format!("model.layers.{}.self_attn.q_proj.weight", layer),
            vec![16, 16],
            (0..256)
                .map(|i| ((i + layer * 7) as f32 * 0.05).sin() * 0.2)
                .collect(),
        ));
        tensors.push(Tensor::new(
            format!("model.layers.{}.mlp.down_proj.weight", layer),
            vec![16, 5],
            (0..80).map(|i| (i as f32 - 40.0) * 0.003).collect(),
        ));
    }
    tensors
}

fn publish(block_size: usize) -> (tempfile::TempDir, std::path::PathBuf) {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("set");
    let arch = Architecture::new(16, 3, 4, Some(2), 80, 10);
    ShardSetWriter::new(block_size, CodecConfig::default())
        .unwrap()
        .write_partitioned(&model(), Some(arch))
        .unwrap()
        .write_to_dir(&dir)
        .unwrap();
    (tmp, dir)
}

#[test]
fn published_set_has_manifest_index_and_shards() {
    let (_tmp, dir) = publish(32);
    let manifest = Manifest::from_json(&fs::read_to_string(dir.join(MANIFEST_FILE)).unwrap()).unwrap();

    let names: Vec<&str> = manifest.shards.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["embed_tokens", "norm", "layer_0", "layer_1", "layer_2"]);
    assert_eq!(manifest.quantization.block_size, 32);
    assert_eq!(manifest.architecture.unwrap().head_dim, 4);

    let index: ShardIndex =
        serde_json::from_slice(&fs::read(dir.join(INDEX_FILE)).unwrap()).unwrap();
    assert_eq!(index.offsets[0], 0);
    for (i, pair) in index.offsets.windows(2).enumerate() {
        assert_eq!(pair[1] - pair[0], manifest.shards[i].bytes);
    }
    for shard in &manifest.shards {
        let len = fs::metadata(dir.join(&shard.file)).unwrap().len();
        assert_eq!(len, shard.bytes);
    }
}

#[test]
fn single_shard_reads_restore_shapes() {
    let (_tmp, dir) = publish(64);
    let reader = ShardSetReader::open(&dir).unwrap();

    let layer1 = reader.read_shard("layer_1").unwrap();
    assert_eq!(layer1.len(), 2);
    let down = &layer1["model.layers.1.mlp.down_proj.weight"];
    assert_eq!(down.shape, vec![16, 5]);

    let all = reader.read_all().unwrap();
    assert_eq!(all.len(), model().len());
    for t in model() {
        let back = &all[&t.name];
        assert_eq!(back.shape, t.shape);
        let max = t.data.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        for (x, y) in t.data.iter().zip(&back.data) {
            // block scale is at most the tensor-wide max / 7 (plus f16 rounding)
            assert!((x - y).abs() <= max / 14.0 * 1.001 + 1e-6);
        }
    }
}

#[test]
fn assembled_blob_is_addressable_by_index() {
    let (_tmp, dir) = publish(32);
    let reader = ShardSetReader::open(&dir).unwrap();
    let blob = reader.assemble().unwrap();
    assert_eq!(blob.len() as u64, reader.manifest().total_bytes);

    let in_memory = ShardSetWriter::new(32, CodecConfig::default())
        .unwrap()
        .write_partitioned(&model(), None)
        .unwrap();
    assert_eq!(in_memory.assembled(), blob);

    for name in reader.shard_names() {
        assert_eq!(
            reader.read_assembled_shard(&blob, name).unwrap(),
            reader.read_shard(name).unwrap()
        );
    }
    assert!(reader.read_assembled_shard(&blob[..blob.len() - 1], "layer_2").is_err());
}

#[test]
fn tampered_shard_is_rejected() {
    let (_tmp, dir) = publish(32);
    let path = dir.join("layer_0.bin");
    let mut bytes = fs::read(&path).unwrap();
    bytes[10] ^= 0x40;
    fs::write(&path, bytes).unwrap();

    let reader = ShardSetReader::open(&dir).unwrap();
    assert!(matches!(
        reader.read_shard("layer_0").unwrap_err(),
        ScxError::Format(FormatError::ChecksumMismatch { .. })
    ));
    assert!(reader.read_shard("layer_1").is_ok());
    assert!(reader.assemble().is_err());
}

#[test]
fn inconsistent_index_fails_open() {
    let (_tmp, dir) = publish(32);
    fs::write(dir.join(INDEX_FILE), b"[0, 1, 2]").unwrap();
    assert!(matches!(
        ShardSetReader::open(&dir).unwrap_err(),
        ScxError::Format(FormatError::BadIndex(_))
    ));
}

#[test]
fn existing_directory_is_not_overwritten() {
    let (_tmp, dir) = publish(32);
    let again = ShardSetWriter::new(32, CodecConfig::default())
        .unwrap()
        .write_partitioned(&model(), None)
        .unwrap()
        .write_to_dir(&dir);
    assert!(again.is_err());
    assert!(ShardSetReader::open(&dir).is_ok());
}

#[test]
fn serial_and_parallel_sets_are_identical() {
    let parallel = ShardSetWriter::new(16, CodecConfig { parallel: true })
        .unwrap()
        .write_partitioned(&model(), None)
        .unwrap();
    let serial = ShardSetWriter::new(16, CodecConfig { parallel: false })
        .unwrap()
        .write_partitioned(&model(), None)
        .unwrap();
    assert_eq!(parallel.blobs, serial.blobs);
    assert_eq!(parallel.manifest, serial.manifest);
}
