//! Growable vector of object refs laid out inside an arena block
//!
//! Header chunk: `[len][capacity][data offset]`, all `u32`. The data chunk is
//! `capacity` block-relative refs. Partitioned pages are a vector of map refs;
//! materialized results are a vector of pair refs, each pair chunk holding the
//! key encoding followed by the value encoding.

use std::marker::PhantomData;

use crate::arena::Arena;
use crate::codec::PageCodec;
use crate::error::{PageboundError, Result};
use crate::page_map::MapView;
use crate::record::{get_u32, put_u32, read_u32};

pub const VEC_HEADER_LEN: usize = 12;
const MIN_CAPACITY: usize = 4;

const LEN_AT: usize = 0;
const CAP_AT: usize = 4;
const DATA_AT: usize = 8;

/// Handle to a vector of refs living in the arena's active block.
#[derive(Clone, Copy, Debug)]
pub struct PageVec {
    header: usize,
}

impl PageVec {
    pub fn create(arena: &mut Arena, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(MIN_CAPACITY);
        let header = arena.alloc_offset(VEC_HEADER_LEN)?;
        let data = match arena.alloc_offset(capacity * 4) {
            Ok(data) => data,
            Err(e) => {
                arena.free_offset(header);
                return Err(e.into());
            }
        };
        let bytes = arena.active_bytes_mut();
        put_u32(bytes, header + LEN_AT, 0);
        put_u32(bytes, header + CAP_AT, capacity as u32);
        put_u32(bytes, header + DATA_AT, data as u32);
        Ok(Self { header })
    }

    pub fn offset(&self) -> usize {
        self.header
    }

    pub fn len(&self, arena: &Arena) -> usize {
        get_u32(arena.active_bytes(), self.header + LEN_AT) as usize
    }

    pub fn is_empty(&self, arena: &Arena) -> bool {
        self.len(arena) == 0
    }

    pub fn get(&self, arena: &Arena, index: usize) -> Option<usize> {
        let bytes = arena.active_bytes();
        let len = get_u32(bytes, self.header + LEN_AT) as usize;
        let data = get_u32(bytes, self.header + DATA_AT) as usize;
        (index < len).then(|| get_u32(bytes, data + index * 4) as usize)
    }

    /// Append a ref. If the data chunk has to grow and cannot, the vector is
    /// unchanged.
    pub fn push(&self, arena: &mut Arena, item: usize) -> Result<()> {
        let (len, cap, data) = {
            let bytes = arena.active_bytes();
            (
                get_u32(bytes, self.header + LEN_AT) as usize,
                get_u32(bytes, self.header + CAP_AT) as usize,
                get_u32(bytes, self.header + DATA_AT) as usize,
            )
        };
        let data = if len == cap {
            let new_cap = cap * 2;
            let grown = arena.alloc_offset(new_cap * 4)?;
            let bytes = arena.active_bytes_mut();
            bytes.copy_within(data..data + len * 4, grown);
            put_u32(bytes, self.header + CAP_AT, new_cap as u32);
            put_u32(bytes, self.header + DATA_AT, grown as u32);
            arena.free_offset(data);
            grown
        } else {
            data
        };
        let bytes = arena.active_bytes_mut();
        put_u32(bytes, data + len * 4, item as u32);
        put_u32(bytes, self.header + LEN_AT, (len + 1) as u32);
        Ok(())
    }
}

/// Read-only vector of refs over record bytes.
#[derive(Clone, Copy, Debug)]
pub struct VecView<'a> {
    bytes: &'a [u8],
    len: usize,
    data: usize,
}

impl<'a> VecView<'a> {
    pub fn open(bytes: &'a [u8], header: usize) -> Result<Self> {
        let len = read_u32(bytes, header + LEN_AT)? as usize;
        let cap = read_u32(bytes, header + CAP_AT)? as usize;
        let data = read_u32(bytes, header + DATA_AT)? as usize;
        if len > cap || data.saturating_add(len.saturating_mul(4)) > bytes.len() {
            return Err(PageboundError::corrupt(format!(
                "vector at {} holds {} of {} refs outside the record",
                header, len, cap
            )));
        }
        Ok(Self { bytes, len, data })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> Option<usize> {
        (index < self.len).then(|| get_u32(self.bytes, self.data + index * 4) as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).map(|i| get_u32(self.bytes, self.data + i * 4) as usize)
    }
}

/// A page of hash-partitioned maps.
pub struct PartitionedView<'a, K, V> {
    bytes: &'a [u8],
    maps: VecView<'a>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K: PageCodec, V: PageCodec> PartitionedView<'a, K, V> {
    pub fn open(bytes: &'a [u8], header: usize) -> Result<Self> {
        Ok(Self {
            bytes,
            maps: VecView::open(bytes, header)?,
            _marker: PhantomData,
        })
    }

    /// Number of maps on the page.
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn map_at(&self, index: usize) -> Result<MapView<'a, K, V>> {
        let header = self.maps.get(index).ok_or_else(|| {
            PageboundError::corrupt(format!("no map at position {} of {}", index, self.len()))
        })?;
        MapView::open(self.bytes, header)
    }

    /// Header offset of the map stamped with `partition_id`, if present.
    pub fn find(&self, partition_id: u32) -> Result<Option<usize>> {
        for header in self.maps.iter() {
            if MapView::<K, V>::open(self.bytes, header)?.partition_id() == partition_id {
                return Ok(Some(header));
            }
        }
        Ok(None)
    }

    pub fn maps(&self) -> impl Iterator<Item = Result<MapView<'a, K, V>>> + '_ {
        self.maps.iter().map(|header| MapView::open(self.bytes, header))
    }
}

/// A flat sequence of materialized key/value pairs.
pub struct PairsView<'a, K, V> {
    bytes: &'a [u8],
    pairs: VecView<'a>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K: PageCodec, V: PageCodec> PairsView<'a, K, V> {
    pub fn open(bytes: &'a [u8], header: usize) -> Result<Self> {
        Ok(Self {
            bytes,
            pairs: VecView::open(bytes, header)?,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<(K, V)> {
        let at = self.pairs.get(index).ok_or_else(|| {
            PageboundError::corrupt(format!("no pair at position {} of {}", index, self.len()))
        })?;
        decode_pair(self.bytes, at)
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<(K, V)>> + '_ {
        self.pairs.iter().map(|at| decode_pair(self.bytes, at))
    }
}

fn decode_pair<K: PageCodec, V: PageCodec>(bytes: &[u8], at: usize) -> Result<(K, V)> {
    let tail = bytes
        .get(at..)
        .ok_or_else(|| PageboundError::corrupt(format!("pair ref {} is out of bounds", at)))?;
    let (key, used) = K::decode(tail)?;
    let (value, _) = V::decode(&tail[used..])?;
    Ok((key, value))
}

/// Allocate one pair chunk and return its offset.
pub(crate) fn write_pair<K: PageCodec, V: PageCodec>(
    arena: &mut Arena,
    key: &K,
    value: &V,
) -> Result<usize> {
    let key_len = key.encoded_len();
    let at = arena.alloc_offset(key_len + value.encoded_len())?;
    let bytes = arena.active_bytes_mut();
    key.encode(&mut bytes[at..]);
    value.encode(&mut bytes[at + key_len..]);
    Ok(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    fn page(n: usize) -> Box<[u8]> {
        vec![0u8; n].into_boxed_slice()
    }

    #[test]
    fn test_push_grows_past_initial_capacity() {
        let mut arena = Arena::new(1024);
        let v = PageVec::create(&mut arena, 0).unwrap();
        for i in 0..10 {
            v.push(&mut arena, 100 + i).unwrap();
        }
        assert_eq!(v.len(&arena), 10);
        assert_eq!(v.get(&arena, 0), Some(100));
        assert_eq!(v.get(&arena, 9), Some(109));
        assert_eq!(v.get(&arena, 10), None);
    }

    #[test]
    fn test_failed_growth_keeps_contents() {
        let mut arena = Arena::new(1024);
        let prior = arena.temporarily_use_block(page(64));
        let v = PageVec::create(&mut arena, 4).unwrap();
        for i in 0..4 {
            v.push(&mut arena, i).unwrap();
        }
        assert!(v.push(&mut arena, 4).unwrap_err().is_out_of_space());
        assert_eq!(v.len(&arena), 4);
        assert_eq!(v.get(&arena, 3), Some(3));
        drop(arena.restore(prior));
    }

    #[test]
    fn test_pairs_round_trip_through_record() {
        let mut arena = Arena::new(1024);
        let prior = arena.temporarily_use_block(page(256));
        let v = PageVec::create(&mut arena, 4).unwrap();
        for (k, val) in [("a", 4i64), ("b", 2)] {
            let at = write_pair(&mut arena, &k.to_string(), &val).unwrap();
            v.push(&mut arena, at).unwrap();
        }
        arena.stamp_root(arena.active_ptr(v.offset()));
        let record = Record::from_arena_page(arena.restore(prior).unwrap());

        let pairs = record.pairs::<String, i64>().unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs.get(1).unwrap(), ("b".to_string(), 2));
        let all: Vec<(String, i64)> = pairs.iter().collect::<Result<_>>().unwrap();
        assert_eq!(all, vec![("a".to_string(), 4), ("b".to_string(), 2)]);
    }

    #[test]
    fn test_view_rejects_overlong_vector() {
        let mut bytes = vec![0u8; 32];
        put_u32(&mut bytes, 20 + LEN_AT, 5);
        put_u32(&mut bytes, 20 + CAP_AT, 4);
        assert!(VecView::open(&bytes, 20).is_err());
    }
}
