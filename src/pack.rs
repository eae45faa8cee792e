//! Two signed 4-bit values per byte: low nibble holds the earlier element.

use crate::error::{FormatError, ScxResult};

/// Number of bytes needed to hold `count` nibbles.
#[inline]
pub fn packed_len(count: usize) -> usize {
    count.div_ceil(2)
}

/// Pack values in [-8, 7] into bytes. An odd trailing element leaves a zero
/// high nibble; callers must carry the element count to undo it.
pub fn pack_int4(values: &[i8]) -> Vec<u8> {
    let mut packed: Vec<u8> = Vec::with_capacity(packed_len(values.len()));
    let mut iter = values.iter();
    while let Some(&v0) = iter.next() {
        let mut byte: u8 = (v0 as i32 & 0x0f) as u8;

        if let Some(&v1) = iter.next() {
            byte |= ((v1 as i32 & 0x0f) as u8) << 4;
        }

        packed.push(byte);
    }
    packed
}

/// Sign-extend a 4-bit two's complement nibble.
#[inline]
pub fn decode_nibble(n: u8) -> i8 {
    let v = n & 0x0f;
    if v & 0x08 != 0 {
        (v as i8) | !0x0f
    } else {
        v as i8
    }
}

/// Unpack exactly `count` values. A pad nibble past `count` is ignored.
pub fn unpack_int4(bytes: &[u8], count: usize) -> ScxResult<Vec<i8>> {
    let capacity = bytes.len().saturating_mul(2);
    if count > capacity {
        return Err(FormatError::PayloadTooShort {
            capacity,
            requested: count,
        }
        .into());
    }

    let mut values = Vec::with_capacity(count);
    'outer: for &b in bytes {
        if values.len() >= count {
            break 'outer;
        }
        values.push(decode_nibble(b));
        if values.len() >= count {
            break 'outer;
        }
        values.push(decode_nibble(b >> 4));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nibble_order_low_first() {
        assert_eq!(pack_int4(&[3, -2]), vec![0xE3]);
        assert_eq!(pack_int4(&[7, -7]), vec![0x97]);
    }

    #[test]
    fn odd_length_pads_high_nibble_with_zero() {
        let packed = pack_int4(&[-8, 1, 5]);
        assert_eq!(packed, vec![0x18, 0x05]);
        assert_eq!(unpack_int4(&packed, 3).unwrap(), vec![-8, 1, 5]);
    }

    #[test]
    fn trailing_zero_kept_when_count_says_so() {
        let packed = pack_int4(&[5, 0]);
        assert_eq!(packed, pack_int4(&[5]));
        assert_eq!(unpack_int4(&packed, 2).unwrap(), vec![5, 0]);
        assert_eq!(unpack_int4(&packed, 1).unwrap(), vec![5]);
    }

    #[test]
    fn empty_sequence() {
        assert!(pack_int4(&[]).is_empty());
        assert!(unpack_int4(&[], 0).unwrap().is_empty());
    }

    #[test]
    fn every_value_decodes() {
        let all: Vec<i8> = (-8..=7).collect();
        assert_eq!(unpack_int4(&pack_int4(&all), all.len()).unwrap(), all);
    }

    #[test]
    fn count_beyond_payload_is_an_error() {
        let err = unpack_int4(&[0x11], 3).unwrap_err();
        assert!(matches!(
            err,
            crate::ScxError::Format(FormatError::PayloadTooShort {
                capacity: 2,
                requested: 3
            })
        ));
    }
}
