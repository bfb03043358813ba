//! Open-addressing hash map laid out inside an arena block
//!
//! Header chunk: `[partition id][slot count][used slots][table offset]`, all
//! `u32`. Table chunk: `slot count` slots of `[state][hash][key ref][value ref]`.
//! Refs are block-relative payload offsets, so the image stays valid when the
//! block is copied out as a record.

use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;

use crate::aggregate::Aggregate;
use crate::arena::Arena;
use crate::codec::{PageCodec, hash_key};
use crate::error::{PageboundError, Result};
use crate::record::{get_u32, put_u32, read_u32};

pub const MAP_HEADER_LEN: usize = 16;
pub const SLOT_LEN: usize = 16;
pub const INITIAL_SLOTS: usize = 8;

const PARTITION_AT: usize = 0;
const SLOTS_AT: usize = 4;
const USED_AT: usize = 8;
const TABLE_AT: usize = 12;

const STATE_AT: usize = 0;
const HASH_AT: usize = 4;
const KEY_AT: usize = 8;
const VALUE_AT: usize = 12;

const EMPTY: u32 = 0;
const FULL: u32 = 1;

enum Probe {
    Found(usize),
    Vacant(usize),
}

/// Linear probe for `key` (already encoded) in a power-of-two table.
fn probe(bytes: &[u8], table: usize, num_slots: usize, hash: u32, key: &[u8]) -> Option<Probe> {
    let mask = num_slots - 1;
    let mut i = hash as usize & mask;
    for _ in 0..num_slots {
        let slot = table + i * SLOT_LEN;
        if get_u32(bytes, slot + STATE_AT) == EMPTY {
            return Some(Probe::Vacant(i));
        }
        if get_u32(bytes, slot + HASH_AT) == hash {
            let at = get_u32(bytes, slot + KEY_AT) as usize;
            if bytes.get(at..at + key.len()) == Some(key) {
                return Some(Probe::Found(i));
            }
        }
        i = (i + 1) & mask;
    }
    None
}

fn encode_to_vec<T: PageCodec>(value: &T) -> Vec<u8> {
    let mut out = vec![0u8; value.encoded_len()];
    value.encode(&mut out);
    out
}

/// Handle to a map living in the arena's active block.
pub struct PageMap<K, V> {
    header: usize,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for PageMap<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for PageMap<K, V> {}

impl<K, V> std::fmt::Debug for PageMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageMap").field("header", &self.header).finish()
    }
}

impl<K, V> PageMap<K, V>
where
    K: PageCodec + Hash + Eq,
    V: Aggregate,
{
    /// Allocate an empty map tagged with `partition_id`.
    pub fn create(arena: &mut Arena, partition_id: u32) -> Result<Self> {
        let header = arena.alloc_offset(MAP_HEADER_LEN)?;
        let table = match arena.alloc_offset(INITIAL_SLOTS * SLOT_LEN) {
            Ok(table) => table,
            Err(e) => {
                arena.free_offset(header);
                return Err(e.into());
            }
        };
        let bytes = arena.active_bytes_mut();
        bytes[table..table + INITIAL_SLOTS * SLOT_LEN].fill(0);
        put_u32(bytes, header + PARTITION_AT, partition_id);
        put_u32(bytes, header + SLOTS_AT, INITIAL_SLOTS as u32);
        put_u32(bytes, header + USED_AT, 0);
        put_u32(bytes, header + TABLE_AT, table as u32);
        Ok(Self::at(header))
    }

    /// Reattach to a map whose header chunk sits at `header`.
    pub fn at(header: usize) -> Self {
        Self {
            header,
            _marker: PhantomData,
        }
    }

    pub fn offset(&self) -> usize {
        self.header
    }

    pub fn partition_id(&self, arena: &Arena) -> u32 {
        get_u32(arena.active_bytes(), self.header + PARTITION_AT)
    }

    pub fn len(&self, arena: &Arena) -> usize {
        get_u32(arena.active_bytes(), self.header + USED_AT) as usize
    }

    pub fn is_empty(&self, arena: &Arena) -> bool {
        self.len(arena) == 0
    }

    fn num_slots(&self, bytes: &[u8]) -> usize {
        get_u32(bytes, self.header + SLOTS_AT) as usize
    }

    fn table(&self, bytes: &[u8]) -> usize {
        get_u32(bytes, self.header + TABLE_AT) as usize
    }

    fn slot_at(&self, bytes: &[u8], index: usize) -> usize {
        self.table(bytes) + index * SLOT_LEN
    }

    fn find(&self, bytes: &[u8], hash: u32, key: &[u8]) -> Option<Probe> {
        probe(bytes, self.table(bytes), self.num_slots(bytes), hash, key)
    }

    pub fn get(&self, arena: &Arena, key: &K) -> Result<Option<V>> {
        let bytes = arena.active_bytes();
        match self.find(bytes, hash_key(key), &encode_to_vec(key)) {
            Some(Probe::Found(i)) => {
                let slot = self.slot_at(bytes, i);
                let value = get_u32(bytes, slot + VALUE_AT) as usize;
                Ok(Some(V::decode(&bytes[value..])?.0))
            }
            _ => Ok(None),
        }
    }

    /// Fold `value` into the entry for `key`, inserting the key if absent.
    ///
    /// On `OutOfArenaSpace` the map is left exactly as it was before the call.
    pub fn upsert(&self, arena: &mut Arena, key: &K, value: &V) -> Result<()> {
        let hash = hash_key(key);
        let key_bytes = encode_to_vec(key);
        match self.find(arena.active_bytes(), hash, &key_bytes) {
            Some(Probe::Found(i)) => self.merge(arena, i, value),
            _ => self.insert_fresh(arena, hash, &key_bytes, value),
        }
    }

    fn insert_fresh(&self, arena: &mut Arena, hash: u32, key: &[u8], value: &V) -> Result<()> {
        let (slots, used) = {
            let bytes = arena.active_bytes();
            (self.num_slots(bytes), get_u32(bytes, self.header + USED_AT) as usize)
        };
        if (used + 1) * 4 > slots * 3 {
            self.grow(arena)?;
        }

        let key_ref = arena.alloc_offset(key.len())?;
        arena.active_bytes_mut()[key_ref..key_ref + key.len()].copy_from_slice(key);

        let index = match self.find(arena.active_bytes(), hash, key) {
            Some(Probe::Vacant(i)) => i,
            _ => unreachable!("load factor keeps a vacant slot for every new key"),
        };
        self.claim(arena.active_bytes_mut(), index, hash, key_ref);

        let value_ref = match arena.alloc_offset(value.encoded_len()) {
            Ok(at) => at,
            Err(e) => {
                self.set_unused(arena.active_bytes_mut(), index);
                arena.free_offset(key_ref);
                return Err(e.into());
            }
        };
        let bytes = arena.active_bytes_mut();
        value.encode(&mut bytes[value_ref..]);
        let slot = self.slot_at(bytes, index);
        put_u32(bytes, slot + VALUE_AT, value_ref as u32);
        Ok(())
    }

    fn claim(&self, bytes: &mut [u8], index: usize, hash: u32, key_ref: usize) {
        let slot = self.slot_at(bytes, index);
        put_u32(bytes, slot + STATE_AT, FULL);
        put_u32(bytes, slot + HASH_AT, hash);
        put_u32(bytes, slot + KEY_AT, key_ref as u32);
        put_u32(bytes, slot + VALUE_AT, 0);
        let used = get_u32(bytes, self.header + USED_AT);
        put_u32(bytes, self.header + USED_AT, used + 1);
    }

    /// Return a just-claimed slot to the empty state.
    ///
    /// Only valid for the most recently claimed slot: no later insert can have
    /// probed past it.
    fn set_unused(&self, bytes: &mut [u8], index: usize) {
        let slot = self.slot_at(bytes, index);
        bytes[slot..slot + SLOT_LEN].fill(0);
        let used = get_u32(bytes, self.header + USED_AT);
        put_u32(bytes, self.header + USED_AT, used - 1);
    }

    fn merge(&self, arena: &mut Arena, index: usize, incoming: &V) -> Result<()> {
        let (slot, saved) = {
            let bytes = arena.active_bytes();
            let slot = self.slot_at(bytes, index);
            (slot, get_u32(bytes, slot + VALUE_AT) as usize)
        };
        let old = V::decode(&arena.active_bytes()[saved..])?.0;
        let merged = old.combine(incoming);

        if merged.encoded_len() <= arena.payload_len(saved) {
            merged.encode(&mut arena.active_bytes_mut()[saved..]);
            return Ok(());
        }

        // The saved chunk stays untouched until the replacement is written.
        put_u32(arena.active_bytes_mut(), slot + VALUE_AT, 0);
        let fresh = match arena.alloc_offset(merged.encoded_len()) {
            Ok(at) => at,
            Err(e) => {
                put_u32(arena.active_bytes_mut(), slot + VALUE_AT, saved as u32);
                return Err(e.into());
            }
        };
        let bytes = arena.active_bytes_mut();
        merged.encode(&mut bytes[fresh..]);
        put_u32(bytes, slot + VALUE_AT, fresh as u32);
        arena.free_offset(saved);
        Ok(())
    }

    /// Double the slot table. A failed allocation leaves the old table in place.
    fn grow(&self, arena: &mut Arena) -> Result<()> {
        let (slots, table) = {
            let bytes = arena.active_bytes();
            (self.num_slots(bytes), self.table(bytes))
        };
        let new_slots = slots * 2;
        let new_table = arena.alloc_offset(new_slots * SLOT_LEN)?;

        let bytes = arena.active_bytes_mut();
        bytes[new_table..new_table + new_slots * SLOT_LEN].fill(0);
        let mask = new_slots - 1;
        for i in 0..slots {
            let from = table + i * SLOT_LEN;
            if get_u32(bytes, from + STATE_AT) != FULL {
                continue;
            }
            let mut j = get_u32(bytes, from + HASH_AT) as usize & mask;
            while get_u32(bytes, new_table + j * SLOT_LEN + STATE_AT) != EMPTY {
                j = (j + 1) & mask;
            }
            bytes.copy_within(from..from + SLOT_LEN, new_table + j * SLOT_LEN);
        }
        put_u32(bytes, self.header + SLOTS_AT, new_slots as u32);
        put_u32(bytes, self.header + TABLE_AT, new_table as u32);
        arena.free_offset(table);
        log::trace!("grew page map at {} to {} slots", self.header, new_slots);
        Ok(())
    }

    /// Read-only view over the active block.
    pub fn view<'a>(&self, arena: &'a Arena) -> Result<MapView<'a, K, V>> {
        MapView::open(arena.active_bytes(), self.header)
    }
}

/// Read-only map image over record bytes.
pub struct MapView<'a, K, V> {
    bytes: &'a [u8],
    partition_id: u32,
    num_slots: usize,
    used: usize,
    table: usize,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K: PageCodec, V: PageCodec> MapView<'a, K, V> {
    /// Open the map whose header chunk sits at `header`, validating its layout.
    pub fn open(bytes: &'a [u8], header: usize) -> Result<Self> {
        let partition_id = read_u32(bytes, header + PARTITION_AT)?;
        let num_slots = read_u32(bytes, header + SLOTS_AT)? as usize;
        let used = read_u32(bytes, header + USED_AT)? as usize;
        let table = read_u32(bytes, header + TABLE_AT)? as usize;
        if num_slots == 0 || !num_slots.is_power_of_two() {
            return Err(PageboundError::corrupt(format!(
                "map at {} has {} slots",
                header, num_slots
            )));
        }
        let table_end = num_slots
            .checked_mul(SLOT_LEN)
            .and_then(|len| table.checked_add(len));
        if table_end.is_none_or(|end| end > bytes.len()) || used > num_slots {
            return Err(PageboundError::corrupt(format!(
                "map at {} has a table outside the record",
                header
            )));
        }
        Ok(Self {
            bytes,
            partition_id,
            num_slots,
            used,
            table,
            _marker: PhantomData,
        })
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// First occupied slot at or after `from`.
    pub fn next_occupied(&self, from: usize) -> Option<usize> {
        (from..self.num_slots).find(|&i| get_u32(self.bytes, self.table + i * SLOT_LEN) == FULL)
    }

    /// Decode the entry in an occupied slot.
    pub fn entry_at(&self, index: usize) -> Result<(K, V)> {
        let slot = self.table + index * SLOT_LEN;
        let key_at = read_u32(self.bytes, slot + KEY_AT)? as usize;
        let value_at = read_u32(self.bytes, slot + VALUE_AT)? as usize;
        let key = K::decode(self.tail(key_at)?)?.0;
        let value = V::decode(self.tail(value_at)?)?.0;
        Ok((key, value))
    }

    fn tail(&self, at: usize) -> Result<&'a [u8]> {
        self.bytes
            .get(at..)
            .filter(|_| at != 0)
            .ok_or_else(|| PageboundError::corrupt(format!("object ref {} is out of bounds", at)))
    }

    pub fn iter(&self) -> MapIter<'_, 'a, K, V> {
        MapIter { view: self, next: 0 }
    }

    pub fn get(&self, key: &K) -> Result<Option<V>>
    where
        K: Hash,
    {
        match probe(self.bytes, self.table, self.num_slots, hash_key(key), &encode_to_vec(key)) {
            Some(Probe::Found(i)) => Ok(Some(self.entry_at(i)?.1)),
            _ => Ok(None),
        }
    }

    pub fn to_hash_map(&self) -> Result<HashMap<K, V>>
    where
        K: Hash + Eq,
    {
        self.iter().collect()
    }
}

/// Entries of a [`MapView`] in slot order.
pub struct MapIter<'v, 'a, K, V> {
    view: &'v MapView<'a, K, V>,
    next: usize,
}

impl<K: PageCodec, V: PageCodec> Iterator for MapIter<'_, '_, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.view.next_occupied(self.next)?;
        self.next = i + 1;
        Some(self.view.entry_at(i))
    }
}
