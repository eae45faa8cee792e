//! One tensor's serialized payload.
//!
//! ```text
//! name length (u32 LE) | name bytes (UTF-8)
//! element count (u64 LE)
//! packed length (u32 LE) | packed nibbles
//! scale count (u32 LE) | scales (f16 LE)
//! ```
//!
//! Every variable-length field is length-prefixed, so a record parses from its
//! first byte without outside context.

use half::f16;

use crate::error::{FormatError, InputError, ScxResult};
use crate::pack::{pack_int4, packed_len, unpack_int4};
use crate::quantize::{quantize, Granularity, QuantizedTensor};
use crate::Tensor;

/// Bounds-checked little-endian reader over a byte slice.
pub struct ByteCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteCursor { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> ScxResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(FormatError::Truncated {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            }
            .into());
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> ScxResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u32(&mut self) -> ScxResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> ScxResult<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub name: String,
    pub element_count: u64,
    pub packed: Vec<u8>,
    pub scales: Vec<f16>,
}

fn prefix_len(name: &str, field: &'static str, len: usize) -> ScxResult<u32> {
    u32::try_from(len).map_err(|_| {
        InputError::FieldTooLarge {
            name: name.to_string(),
            field,
            len,
        }
        .into()
    })
}

impl Record {
    /// Quantize and pack a validated tensor.
    pub fn from_tensor(tensor: &Tensor, granularity: Granularity) -> ScxResult<Self> {
        let q = quantize(&tensor.data, granularity)?;
        Self::from_quantized(&tensor.name, &q)
    }

    pub fn from_quantized(name: &str, q: &QuantizedTensor) -> ScxResult<Self> {
        let record = Record {
            name: name.to_string(),
            element_count: q.element_count as u64,
            packed: pack_int4(&q.values),
            scales: q.scales.clone(),
        };
        prefix_len(name, "name", record.name.len())?;
        prefix_len(name, "packed payload", record.packed.len())?;
        prefix_len(name, "scale array", record.scales.len())?;
        Ok(record)
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.name.len() + 8 + 4 + self.packed.len() + 4 + self.scales.len() * 2
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> ScxResult<()> {
        let name_len = prefix_len(&self.name, "name", self.name.len())?;
        let packed_len = prefix_len(&self.name, "packed payload", self.packed.len())?;
        let scale_count = prefix_len(&self.name, "scale array", self.scales.len())?;

        buf.reserve(self.encoded_len());
        buf.extend_from_slice(&name_len.to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(&self.element_count.to_le_bytes());
        buf.extend_from_slice(&packed_len.to_le_bytes());
        buf.extend_from_slice(&self.packed);
        buf.extend_from_slice(&scale_count.to_le_bytes());
        for s in &self.scales {
            buf.extend_from_slice(&s.to_le_bytes());
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> ScxResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(cursor: &mut ByteCursor<'_>) -> ScxResult<Self> {
        let name_len = cursor.read_u32()? as usize;
        let name_bytes = cursor.take(name_len)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|e| FormatError::MalformedRecord {
                name: String::from_utf8_lossy(name_bytes).into_owned(),
                reason: format!("name is not UTF-8: {}", e),
            })?
            .to_string();

        let element_count = cursor.read_u64()?;
        let packed_len = cursor.read_u32()? as usize;
        let packed = cursor.take(packed_len)?.to_vec();

        let scale_count = cursor.read_u32()? as usize;
        let scale_bytes = cursor.take(scale_count.saturating_mul(2))?;
        let scales = scale_bytes
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]))
            .collect();

        Ok(Record {
            name,
            element_count,
            packed,
            scales,
        })
    }

    fn malformed(&self, reason: impl Into<String>) -> FormatError {
        FormatError::MalformedRecord {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Unpack the nibbles, checking the payload against the element count.
    pub fn to_quantized(&self, granularity: Granularity) -> ScxResult<QuantizedTensor> {
        granularity.validate()?;
        let element_count = usize::try_from(self.element_count)
            .map_err(|_| self.malformed("element count exceeds address space"))?;
        if element_count > self.packed.len().saturating_mul(2) {
            return Err(self
                .malformed(format!(
                    "{} elements cannot fit in {} packed bytes",
                    element_count,
                    self.packed.len()
                ))
                .into());
        }

        let padded = granularity.padded_len(element_count);
        if self.packed.len() != packed_len(padded) {
            return Err(self
                .malformed(format!(
                    "{} packed bytes for {} values, expected {}",
                    self.packed.len(),
                    padded,
                    packed_len(padded)
                ))
                .into());
        }

        let q = QuantizedTensor {
            element_count,
            scales: self.scales.clone(),
            values: unpack_int4(&self.packed, padded)?,
        };
        if let Some(reason) = q.layout_problem(granularity) {
            return Err(self.malformed(reason).into());
        }
        Ok(q)
    }

    pub fn dequantize(&self, granularity: Granularity) -> ScxResult<Vec<f32>> {
        self.to_quantized(granularity)?.dequantize(granularity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(name: &str, data: Vec<f32>) -> Tensor {
        Tensor {
            name: name.to_string(),
            shape: vec![data.len()],
            data,
        }
    }

    #[test]
    fn layout_is_length_prefixed_little_endian() {
        let r = Record::from_tensor(&tensor("w", vec![0.1, -0.05, 0.2]), Granularity::PerTensor)
            .unwrap();
        let bytes = r.to_bytes().unwrap();
        assert_eq!(bytes.len(), r.encoded_len());
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(bytes[4], b'w');
        assert_eq!(&bytes[5..13], &3u64.to_le_bytes());
        assert_eq!(&bytes[13..17], &2u32.to_le_bytes());
        assert_eq!(&bytes[19..23], &1u32.to_le_bytes());
        assert_eq!(&bytes[23..25], &r.scales[0].to_le_bytes());
    }

    #[test]
    fn decode_in_isolation() {
        let r = Record::from_tensor(
            &tensor("layers.0.q", (0..37).map(|i| i as f32 - 18.0).collect()),
            Granularity::Block(8),
        )
        .unwrap();
        let mut bytes = r.to_bytes().unwrap();
        bytes.extend_from_slice(b"next record");

        let mut cursor = ByteCursor::new(&bytes);
        let decoded = Record::decode(&mut cursor).unwrap();
        assert_eq!(decoded, r);
        assert_eq!(cursor.remaining(), b"next record".len());
    }

    #[test]
    fn odd_length_survives_decode() {
        let data = vec![0.5, -0.5, 0.25, 0.0, 0.0];
        let r = Record::from_tensor(&tensor("odd", data.clone()), Granularity::PerTensor).unwrap();
        let back = r.to_quantized(Granularity::PerTensor).unwrap();
        assert_eq!(back.values.len(), 5);
        assert_eq!(r.dequantize(Granularity::PerTensor).unwrap().len(), 5);
    }

    #[test]
    fn every_truncation_is_an_error() {
        let r = Record::from_tensor(&tensor("abc", vec![1.0, 2.0, 3.0]), Granularity::PerTensor)
            .unwrap();
        let bytes = r.to_bytes().unwrap();
        for cut in 0..bytes.len() {
            let mut cursor = ByteCursor::new(&bytes[..cut]);
            let err = Record::decode(&mut cursor).unwrap_err();
            assert!(
                matches!(err, crate::ScxError::Format(FormatError::Truncated { .. })),
                "cut at {} gave {:?}",
                cut,
                err
            );
        }
    }

    #[test]
    fn inconsistent_payload_length_is_rejected() {
        let mut r = Record::from_tensor(&tensor("x", vec![1.0; 6]), Granularity::PerTensor)
            .unwrap();
        r.element_count = 9;
        let err = r.to_quantized(Granularity::PerTensor).unwrap_err();
        assert!(matches!(
            err,
            crate::ScxError::Format(FormatError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn wrong_granularity_is_rejected() {
        let r = Record::from_tensor(&tensor("x", vec![1.0; 10]), Granularity::Block(4)).unwrap();
        assert!(r.to_quantized(Granularity::PerTensor).is_err());
        assert!(r.to_quantized(Granularity::Block(8)).is_err());
        assert!(r.to_quantized(Granularity::Block(4)).is_ok());
    }

    #[test]
    fn invalid_utf8_name_is_malformed() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0xff, 0xfe]);
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        let err = Record::decode(&mut ByteCursor::new(&bytes)).unwrap_err();
        assert!(matches!(
            err,
            crate::ScxError::Format(FormatError::MalformedRecord { .. })
        ));
    }
}
