//! Byte encodings for keys and values stored inside arena pages

use std::hash::{DefaultHasher, Hash, Hasher};

use crate::error::{PageboundError, Result};

/// A type that can be written into, and read back out of, a page chunk.
pub trait PageCodec: Sized {
    /// Bytes `encode` will write.
    fn encoded_len(&self) -> usize;

    /// Write the encoding into the front of `out`, which holds at least
    /// `encoded_len()` bytes.
    fn encode(&self, out: &mut [u8]);

    /// Read one value from the front of `bytes`, returning it with the number
    /// of bytes consumed.
    fn decode(bytes: &[u8]) -> Result<(Self, usize)>;
}

fn take<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N]> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| PageboundError::corrupt(format!("truncated {}", what)))
}

macro_rules! fixed_width_codec {
    ($($ty:ty),*) => {
        $(
            impl PageCodec for $ty {
                fn encoded_len(&self) -> usize {
                    std::mem::size_of::<$ty>()
                }

                fn encode(&self, out: &mut [u8]) {
                    out[..std::mem::size_of::<$ty>()].copy_from_slice(&self.to_le_bytes());
                }

                fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
                    let raw = take::<{ std::mem::size_of::<$ty>() }>(bytes, stringify!($ty))?;
                    Ok((<$ty>::from_le_bytes(raw), std::mem::size_of::<$ty>()))
                }
            }
        )*
    };
}

fixed_width_codec!(u32, i32, u64, i64, f64);

// Length-prefixed byte strings: `[len: u32][bytes]`
fn encode_bytes(bytes: &[u8], out: &mut [u8]) {
    out[..4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
    out[4..4 + bytes.len()].copy_from_slice(bytes);
}

fn decode_bytes<'a>(bytes: &'a [u8], what: &str) -> Result<&'a [u8]> {
    let len = u32::from_le_bytes(take::<4>(bytes, what)?) as usize;
    bytes
        .get(4..4 + len)
        .ok_or_else(|| PageboundError::corrupt(format!("{} of {} bytes overruns its chunk", what, len)))
}

impl PageCodec for Vec<u8> {
    fn encoded_len(&self) -> usize {
        4 + self.len()
    }

    fn encode(&self, out: &mut [u8]) {
        encode_bytes(self, out);
    }

    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let raw = decode_bytes(bytes, "byte string")?;
        Ok((raw.to_vec(), 4 + raw.len()))
    }
}

impl PageCodec for String {
    fn encoded_len(&self) -> usize {
        4 + self.len()
    }

    fn encode(&self, out: &mut [u8]) {
        encode_bytes(self.as_bytes(), out);
    }

    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let raw = decode_bytes(bytes, "string")?;
        let s = std::str::from_utf8(raw)
            .map_err(|e| PageboundError::corrupt(format!("string key is not UTF-8: {}", e)))?;
        Ok((s.to_owned(), 4 + raw.len()))
    }
}

/// Hash stored alongside each map slot.
///
/// Uses a fixed-key hasher, so a page copied out and reopened by the same
/// build probes the same slots. `DefaultHasher`'s algorithm may change between
/// Rust releases, so pages are not a format to persist across builds.
pub fn hash_key<K: Hash + ?Sized>(key: &K) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded<T: PageCodec>(value: &T) -> Vec<u8> {
        let mut out = vec![0u8; value.encoded_len()];
        value.encode(&mut out);
        out
    }

    #[test]
    fn test_fixed_width_layout() {
        assert_eq!(encoded(&1u32), vec![1, 0, 0, 0]);
        assert_eq!(encoded(&-1i64), vec![0xff; 8]);
        let (v, used) = i64::decode(&encoded(&-42i64)).unwrap();
        assert_eq!((v, used), (-42, 8));
    }

    #[test]
    fn test_string_layout() {
        let bytes = encoded(&"ab".to_string());
        assert_eq!(bytes, vec![2, 0, 0, 0, b'a', b'b']);
        let (s, used) = String::decode(&bytes).unwrap();
        assert_eq!(s, "ab");
        assert_eq!(used, 6);
    }

    #[test]
    fn test_decode_ignores_trailing_padding() {
        let mut bytes = encoded(&vec![7u8, 8, 9]);
        bytes.extend_from_slice(&[0, 0, 0]);
        let (v, used) = Vec::<u8>::decode(&bytes).unwrap();
        assert_eq!(v, vec![7, 8, 9]);
        assert_eq!(used, 7);
    }

    #[test]
    fn test_truncated_input_is_corrupt() {
        assert!(matches!(
            u64::decode(&[1, 2, 3]),
            Err(PageboundError::CorruptRecord(_))
        ));
        assert!(matches!(
            String::decode(&[9, 0, 0, 0, b'x']),
            Err(PageboundError::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_is_corrupt() {
        assert!(String::decode(&[1, 0, 0, 0, 0xff]).is_err());
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_key("apple"), hash_key(&"apple".to_string()));
        assert_ne!(hash_key("apple"), hash_key("pear"));
    }
}
