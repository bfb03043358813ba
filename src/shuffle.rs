//! Hash-partitioning of raw tuples into partitioned input pages

use std::hash::Hash;

use log::debug;

use crate::aggregate::Aggregate;
use crate::arena::{Arena, SharedArena};
use crate::codec::{PageCodec, hash_key};
use crate::error::Result;
use crate::operator::{OperatorCore, new_page};
use crate::page_map::PageMap;
use crate::page_vec::PageVec;
use crate::record::Record;

/// Partition that owns `key` among `num_partitions`.
///
/// Takes the high bits of the key hash; map slots are indexed by the low bits,
/// so keys sharing a partition still spread across a map's table.
pub fn partition_of<K: Hash + ?Sized>(key: &K, num_partitions: u32) -> u32 {
    ((u64::from(hash_key(key)) * u64::from(num_partitions)) >> 32) as u32
}

/// Writes tuples into pages holding one map per partition.
pub struct ShuffleSink<K, V> {
    core: OperatorCore,
    num_partitions: u32,
    maps: Vec<PageMap<K, V>>,
}

impl<K, V> ShuffleSink<K, V>
where
    K: PageCodec + Hash + Eq,
    V: Aggregate,
{
    pub fn new(arena: SharedArena, num_partitions: u32) -> Self {
        assert!(num_partitions > 0, "shuffle needs at least one partition");
        Self {
            core: OperatorCore::new(arena, "shuffle"),
            num_partitions,
            maps: Vec::new(),
        }
    }

    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    pub fn load_output_page(&mut self, page: Box<[u8]>) -> Result<()> {
        self.maps.clear();
        let n = self.num_partitions;
        self.maps = self.core.load_output(page, |arena| {
            let vec = PageVec::create(arena, n as usize)?;
            let mut maps = Vec::with_capacity(n as usize);
            for id in 0..n {
                let map = PageMap::create(arena, id)?;
                vec.push(arena, map.offset())?;
                maps.push(map);
            }
            Ok((maps, vec.offset()))
        })?;
        Ok(())
    }

    /// Move tuples from the back of `tuples` into the page.
    ///
    /// Consumed tuples are removed. Returns `true` when the page filled with
    /// tuples left over.
    pub fn write_out(&mut self, tuples: &mut Vec<(K, V)>) -> Result<bool> {
        self.core.require_output()?;
        let arena = self.core.arena();
        while let Some((key, value)) = tuples.last() {
            let map = self.maps[partition_of(key, self.num_partitions) as usize];
            match map.upsert(&mut arena.borrow_mut(), key, value) {
                Ok(()) => {
                    tuples.pop();
                    self.core.entry_written();
                }
                Err(e) if e.is_out_of_space() => return self.core.page_full(),
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    pub fn clear_output_page(&mut self) -> Option<Record> {
        self.maps.clear();
        self.core.release_output()
    }
}

/// Build an input page holding the given maps, tagged with the given ids.
pub fn partitioned_page<K, V>(
    arena: &SharedArena,
    page_size: usize,
    parts: &[(u32, Vec<(K, V)>)],
) -> Result<Record>
where
    K: PageCodec + Hash + Eq,
    V: Aggregate,
{
    let mut arena = arena.borrow_mut();
    let prior = arena.temporarily_use_block(new_page(page_size));
    let built = build_partitioned(&mut arena, parts);
    if let Ok(root) = built {
        let ptr = arena.active_ptr(root);
        arena.stamp_root(ptr);
    }
    let page = arena
        .restore(prior)
        .expect("a caller-owned substitute is always handed back on restore");
    built?;
    debug!("built partitioned page with {} maps", parts.len());
    Ok(Record::from_arena_page(page))
}

fn build_partitioned<K, V>(arena: &mut Arena, parts: &[(u32, Vec<(K, V)>)]) -> Result<usize>
where
    K: PageCodec + Hash + Eq,
    V: Aggregate,
{
    let vec = PageVec::create(arena, parts.len())?;
    for (id, kvs) in parts {
        let map = PageMap::<K, V>::create(arena, *id)?;
        vec.push(arena, map.offset())?;
        for (key, value) in kvs {
            map.upsert(arena, key, value)?;
        }
    }
    Ok(vec.offset())
}
