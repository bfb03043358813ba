//! Self-contained result records
//!
//! A record is a block image: the block header followed by the object bytes.
//! The header's root offset names the object the record stands for, so a
//! record copied verbatim can be reopened anywhere without an arena.

use std::fmt;

use crate::arena::BLOCK_HEADER_SIZE;
use crate::codec::PageCodec;
use crate::error::{PageboundError, Result};
use crate::page_map::MapView;
use crate::page_vec::{PairsView, PartitionedView};

const USED_AT: usize = 0;
const ROOT_AT: usize = 8;
const REFS_AT: usize = 16;

/// Read a little-endian `u32`, failing on truncation.
pub(crate) fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    at.checked_add(4)
        .and_then(|end| bytes.get(at..end))
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| PageboundError::corrupt(format!("u32 at offset {} is out of bounds", at)))
}

fn read_u64(bytes: &[u8], at: usize) -> Result<u64> {
    bytes
        .get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| PageboundError::corrupt(format!("u64 at offset {} is out of bounds", at)))
}

/// Trusted accessor for bytes the arena itself laid out.
pub(crate) fn get_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Owned page holding one materialized result object.
#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    page: Box<[u8]>,
}

impl Record {
    /// Adopt a page, checking that its header is consistent.
    pub fn from_page(page: Box<[u8]>) -> Result<Self> {
        if page.len() < BLOCK_HEADER_SIZE {
            return Err(PageboundError::corrupt(format!(
                "record of {} bytes is shorter than its header",
                page.len()
            )));
        }
        let used = read_u64(&page, USED_AT)? as usize;
        if used < BLOCK_HEADER_SIZE || used > page.len() {
            return Err(PageboundError::corrupt(format!(
                "record claims {} used bytes in a {} byte page",
                used,
                page.len()
            )));
        }
        let root = read_u64(&page, ROOT_AT)? as usize;
        if root != 0 && (root < BLOCK_HEADER_SIZE || root >= used) {
            return Err(PageboundError::corrupt(format!(
                "root offset {} lies outside the {} used bytes",
                root, used
            )));
        }
        Ok(Self { page })
    }

    /// Copy raw bytes into a new record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_page(bytes.to_vec().into_boxed_slice())
    }

    /// Wrap a page the arena has just handed back.
    pub(crate) fn from_arena_page(page: Box<[u8]>) -> Self {
        Self { page }
    }

    pub fn capacity(&self) -> usize {
        self.page.len()
    }

    pub fn used_bytes(&self) -> usize {
        get_u64(&self.page, USED_AT) as usize
    }

    /// Offset of the root object, if one was stamped.
    pub fn root_offset(&self) -> Option<usize> {
        match get_u64(&self.page, ROOT_AT) as usize {
            0 => None,
            root => Some(root),
        }
    }

    /// Live chunk count of the block when it was handed back.
    pub fn live_refs(&self) -> u32 {
        get_u32(&self.page, REFS_AT)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.page
    }

    /// Copy of the used prefix only.
    pub fn to_compact(&self) -> Record {
        Record {
            page: self.page[..self.used_bytes()].to_vec().into_boxed_slice(),
        }
    }

    fn root(&self) -> Result<usize> {
        self.root_offset()
            .ok_or_else(|| PageboundError::corrupt("record has no root object"))
    }

    fn object_bytes(&self) -> &[u8] {
        &self.page[..self.used_bytes()]
    }

    /// Read the record as a single map.
    pub fn map<K, V>(&self) -> Result<MapView<'_, K, V>>
    where
        K: PageCodec,
        V: PageCodec,
    {
        MapView::open(self.object_bytes(), self.root()?)
    }

    /// Read the record as a sequence of partitioned maps.
    pub fn partitioned<K, V>(&self) -> Result<PartitionedView<'_, K, V>>
    where
        K: PageCodec,
        V: PageCodec,
    {
        PartitionedView::open(self.object_bytes(), self.root()?)
    }

    /// Read the record as a flat sequence of key/value pairs.
    pub fn pairs<K, V>(&self) -> Result<PairsView<'_, K, V>>
    where
        K: PageCodec,
        V: PageCodec,
    {
        PairsView::open(self.object_bytes(), self.root()?)
    }
}

fn get_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("capacity", &self.capacity())
            .field("used", &self.used_bytes())
            .field("root", &self.root_offset())
            .field("live_refs", &self.live_refs())
            .finish()
    }
}
