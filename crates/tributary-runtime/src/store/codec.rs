//! Order-preserving byte encoding for composite store keys
//!
//! Keys are compared byte-lexicographically by the key-value engine, so every
//! `i32` is written big-endian with its sign bit flipped. That maps
//! `i32::MIN..=i32::MAX` onto `0x00000000..=0xFFFFFFFF` monotonically.

use super::StoreError;

pub const INT_LEN: usize = 4;
pub const KEY_LEN: usize = 3 * INT_LEN;

const SIGN_BIT: u32 = 0x8000_0000;

pub fn encode_i32(v: i32) -> [u8; INT_LEN] {
    ((v as u32) ^ SIGN_BIT).to_be_bytes()
}

pub fn decode_i32(bytes: [u8; INT_LEN]) -> i32 {
    (u32::from_be_bytes(bytes) ^ SIGN_BIT) as i32
}

/// Reads one encoded int from the front of `bytes`.
pub fn read_i32(bytes: &[u8]) -> Result<i32, StoreError> {
    let head: [u8; INT_LEN] = bytes
        .get(..INT_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StoreError::Serialization(format!("short int key: {} bytes", bytes.len())))?;
    Ok(decode_i32(head))
}

/// `(partition index, time key, sequence number)`
///
/// The derived `Ord` matches the byte order of [`encode`](Self::encode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompositeKey {
    pub partition: i32,
    pub time: i32,
    pub seq: i32,
}

impl CompositeKey {
    pub const fn new(partition: i32, time: i32, seq: i32) -> Self {
        Self {
            partition,
            time,
            seq,
        }
    }

    /// Smallest key of a partition.
    pub const fn first_of(partition: i32) -> Self {
        Self::new(partition, i32::MIN, i32::MIN)
    }

    /// Largest key of a partition.
    pub const fn last_of(partition: i32) -> Self {
        Self::new(partition, i32::MAX, i32::MAX)
    }

    pub fn encode(&self) -> [u8; KEY_LEN] {
        let mut out = [0u8; KEY_LEN];
        out[..4].copy_from_slice(&encode_i32(self.partition));
        out[4..8].copy_from_slice(&encode_i32(self.time));
        out[8..].copy_from_slice(&encode_i32(self.seq));
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() != KEY_LEN {
            return Err(StoreError::Serialization(format!(
                "composite key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        Ok(Self {
            partition: read_i32(&bytes[..4])?,
            time: read_i32(&bytes[4..8])?,
            seq: read_i32(&bytes[8..])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ==========================================================================
    // Boundary Tests
    // ==========================================================================

    #[test]
    fn test_extremes_order() {
        let ordered = [i32::MIN, i32::MIN + 1, -256, -1, 0, 1, 255, 256, i32::MAX - 1, i32::MAX];
        for pair in ordered.windows(2) {
            assert!(
                encode_i32(pair[0]) < encode_i32(pair[1]),
                "{} should encode below {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_min_and_max_bytes() {
        assert_eq!(encode_i32(i32::MIN), [0, 0, 0, 0]);
        assert_eq!(encode_i32(i32::MAX), [0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(encode_i32(0), [0x80, 0, 0, 0]);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert!(CompositeKey::decode(&[0u8; 11]).is_err());
        assert!(read_i32(&[1, 2]).is_err());
    }

    #[test]
    fn test_partition_bounds_enclose_keys() {
        let k = CompositeKey::new(3, -5, 0);
        assert!(CompositeKey::first_of(3).encode() <= k.encode());
        assert!(k.encode() <= CompositeKey::last_of(3).encode());
        assert!(CompositeKey::last_of(2).encode() < CompositeKey::first_of(3).encode());
    }

    // ==========================================================================
    // Property Tests
    // ==========================================================================

    proptest! {
        #[test]
        fn prop_i32_round_trip(v in any::<i32>()) {
            prop_assert_eq!(decode_i32(encode_i32(v)), v);
        }

        #[test]
        fn prop_i32_order_preserved(a in any::<i32>(), b in any::<i32>()) {
            prop_assert_eq!(a.cmp(&b), encode_i32(a).cmp(&encode_i32(b)));
        }

        #[test]
        fn prop_composite_round_trip(p in any::<i32>(), t in any::<i32>(), s in any::<i32>()) {
            let key = CompositeKey::new(p, t, s);
            prop_assert_eq!(CompositeKey::decode(&key.encode()).unwrap(), key);
        }

        #[test]
        fn prop_composite_order_preserved(
            a in (any::<i32>(), any::<i32>(), any::<i32>()),
            b in (any::<i32>(), any::<i32>(), any::<i32>()),
        ) {
            let ka = CompositeKey::new(a.0, a.1, a.2);
            let kb = CompositeKey::new(b.0, b.1, b.2);
            prop_assert_eq!(ka.cmp(&kb), ka.encode().cmp(&kb.encode()));
        }
    }
}
