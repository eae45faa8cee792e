//! Property-based tests for the INT4 codec and the SCXM container.
//!
//! Run with: cargo test --test proptest_codec

use std::collections::BTreeMap;

use proptest::prelude::*;

use scxpak::{
    pack_int4, read_container, unpack_int4, CodecConfig, ContainerReader, ContainerWriter,
    FormatError, Granularity, Record, ScxError, Tensor,
};

/// Small magnitudes plus the occasional wide tensor.
fn values_strategy(max_len: usize) -> impl Strategy<Value = Vec<f32>> {
    prop_oneof![
        prop::collection::vec(-1.0f32..1.0f32, 0..max_len),
        prop::collection::vec(-1000.0f32..1000.0f32, 1..max_len),
        prop::collection::vec(-1e-6f32..1e-6f32, 1..max_len),
    ]
}

fn block_size_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![Just(1usize), Just(3), Just(16), Just(32), Just(128)]
}

fn tensors_strategy() -> impl Strategy<Value = Vec<Tensor>> {
    prop::collection::btree_map("[a-z]{1,6}(\\.[a-z0-9]{1,4}){0,2}", values_strategy(96), 0..6)
        .prop_map(|m| m.into_iter().map(|(name, data)| Tensor::flat(name, data)).collect())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    /// Property: unpacking packed nibbles returns the same integers.
    #[test]
    fn prop_pack_unpack(values in prop::collection::vec(-8i8..=7, 0..257)) {
        let packed = pack_int4(&values);
        prop_assert_eq!(packed.len(), values.len().div_ceil(2));
        prop_assert_eq!(unpack_int4(&packed, values.len()).unwrap(), values);
    }

    /// Property: every reconstructed value is within half its block's stored scale.
    #[test]
    fn prop_error_within_half_step(
        data in values_strategy(300),
        block_size in block_size_strategy(),
    ) {
        let g = Granularity::block(block_size).unwrap();
        let record = Record::from_tensor(&Tensor::flat("w", data.clone()), g).unwrap();
        let decoded = record.dequantize(g).unwrap();

        prop_assert_eq!(decoded.len(), data.len());
        prop_assert_eq!(record.scales.len(), data.len().div_ceil(block_size));
        for (i, (x, y)) in data.iter().zip(&decoded).enumerate() {
            let scale = record.scales[i / block_size].to_f32();
            prop_assert!(
                (x - y).abs() <= scale * 0.5 * (1.0 + 1e-5) + 1e-12,
                "element {}: {} vs {} (scale {})", i, x, y, scale
            );
        }
    }

    /// Property: a whole-tensor record decodes within half of its single scale.
    #[test]
    fn prop_per_tensor_error_within_half_step(data in values_strategy(300)) {
        let g = Granularity::PerTensor;
        let record = Record::from_tensor(&Tensor::flat("w", data.clone()), g).unwrap();
        let decoded = record.dequantize(g).unwrap();

        prop_assert_eq!(record.scales.len(), 1);
        let half_step = record.scales[0].to_f32() * 0.5 * (1.0 + 1e-5) + 1e-12;
        prop_assert_eq!(decoded.len(), data.len());
        for (i, (x, y)) in data.iter().zip(&decoded).enumerate() {
            prop_assert!(
                (x - y).abs() <= half_step,
                "element {}: {} vs {} (half step {})", i, x, y, half_step
            );
        }
    }

    /// Property: padding never leaks into the decoded tensor.
    #[test]
    fn prop_block_padding(len in 0usize..200, block_size in block_size_strategy()) {
        let data: Vec<f32> = (0..len).map(|i| (i as f32 * 0.37).sin()).collect();
        let g = Granularity::block(block_size).unwrap();
        let record = Record::from_tensor(&Tensor::flat("p", data), g).unwrap();

        let padded = len.div_ceil(block_size) * block_size;
        prop_assert_eq!(record.element_count, len as u64);
        prop_assert_eq!(record.packed.len(), padded.div_ceil(2));
        prop_assert_eq!(record.dequantize(g).unwrap().len(), len);
    }

    /// Property: output bytes depend only on the tensor set, not on order or threading.
    #[test]
    fn prop_deterministic(tensors in tensors_strategy()) {
        let parallel = ContainerWriter::new(CodecConfig { parallel: true }).write(&tensors).unwrap();
        let serial = ContainerWriter::new(CodecConfig { parallel: false }).write(&tensors).unwrap();
        let mut reversed = tensors.clone();
        reversed.reverse();
        let reordered = ContainerWriter::default().write(&reversed).unwrap();

        prop_assert_eq!(&parallel, &serial);
        prop_assert_eq!(&parallel, &reordered);
    }

    /// Property: a container round trip keeps names, counts, and each value within half a step.
    #[test]
    fn prop_container_round_trip(tensors in tensors_strategy()) {
        let bytes = ContainerWriter::default().write(&tensors).unwrap();
        let reader = ContainerReader::new(&bytes).unwrap();
        let scales: BTreeMap<String, f32> = reader
            .records()
            .unwrap()
            .into_iter()
            .map(|r| (r.name, r.scales[0].to_f32()))
            .collect();
        let restored = reader.read().unwrap();

        prop_assert_eq!(restored.len(), tensors.len());
        for t in &tensors {
            let r = &restored[&t.name];
            prop_assert_eq!(r.data.len(), t.data.len());
            let half_step = scales[&t.name] * 0.5 * (1.0 + 1e-5) + 1e-12;
            for (x, y) in t.data.iter().zip(&r.data) {
                prop_assert!((x - y).abs() <= half_step, "{}: {} vs {}", t.name, x, y);
            }
        }
    }

    /// Property: flipping any single bit is caught by the checksum.
    #[test]
    fn prop_single_flip_detected(
        tensors in tensors_strategy(),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let mut bytes = ContainerWriter::default().write(&tensors).unwrap();
        let i = position.index(bytes.len());
        bytes[i] ^= 1 << bit;

        let err = read_container(&bytes).unwrap_err();
        prop_assert!(
            matches!(err, ScxError::Format(FormatError::ChecksumMismatch { .. })),
            "unexpected error {:?}", err
        );
        prop_assert!(err.is_format());
    }
}
