//! Block arena with size-classed free lists and reference-counted blocks
//!
//! Exactly one block is active at a time and services every allocation.
//! A block superseded while it still hosts live chunks becomes inactive and is
//! released by the `free` that drops its last reference. Every block is
//! assigned a disjoint span of virtual addresses when installed, so an
//! [`ArenaPtr`] names both its block and its offset inside it.

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::Rc;

use log::{debug, error, trace, warn};

use crate::error::ArenaError;

/// Block header: `[bytes used: u64][offset to root: u64][live refs: u32]`
pub const BLOCK_HEADER_SIZE: usize = 8 + 8 + 4;
/// Every chunk is prefixed with its own header-inclusive size.
pub const CHUNK_HEADER_SIZE: usize = 4;
pub const NUM_SIZE_CLASSES: usize = 32;
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

const USED_AT: usize = 0;
const ROOT_AT: usize = 8;
const REFS_AT: usize = 16;

// Keeps address zero out of every span.
const FIRST_BASE: u64 = 1 << 12;

/// Address of a chunk payload in the arena's virtual address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaPtr(u64);

impl ArenaPtr {
    pub fn from_addr(addr: u64) -> Self {
        ArenaPtr(addr)
    }

    pub fn addr(self) -> u64 {
        self.0
    }
}

/// How the active block reacts when it cannot satisfy a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exhaustion {
    /// Return [`ArenaError::OutOfArenaSpace`].
    Fail,
    /// Return `Ok(None)`.
    ReturnNull,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AllocatorPolicy {
    /// Search the free lists before bumping the cursor.
    #[default]
    Reuse,
    /// Always bump; freed chunks are still tracked and unreferenced.
    NoReuse,
    /// Frees are ignored entirely.
    NoRefCount,
}

/// Snapshot of one block, for ownership queries and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub base: u64,
    pub capacity: usize,
    pub used: usize,
    pub live_refs: u32,
    pub root_offset: usize,
    pub active: bool,
}

/// Header-inclusive chunk size for a payload of `size` bytes, rounded up to 4.
///
/// Every chunk carries at least one payload byte, so a payload never starts
/// at the bump cursor.
pub fn chunk_bytes_for(size: usize) -> usize {
    size.max(1).saturating_add(CHUNK_HEADER_SIZE).saturating_add(3) & !3
}

/// Free-list index for a chunk: position of the highest set bit of its size.
pub fn size_class(chunk_bytes: u32) -> usize {
    debug_assert!(chunk_bytes > 0);
    31 - chunk_bytes.leading_zeros() as usize
}

struct Block {
    memory: Box<[u8]>,
    base: u64,
    cursor: usize,
    live_refs: u32,
    root_offset: usize,
}

impl Block {
    fn new(memory: Box<[u8]>, base: u64) -> Self {
        assert!(
            memory.len() >= BLOCK_HEADER_SIZE,
            "allocation block of {} bytes is smaller than the {} byte block header",
            memory.len(),
            BLOCK_HEADER_SIZE
        );
        assert!(
            memory.len() <= u32::MAX as usize,
            "allocation block of {} bytes exceeds the 32-bit offset range",
            memory.len()
        );
        let mut block = Block {
            memory,
            base,
            cursor: BLOCK_HEADER_SIZE,
            live_refs: 0,
            root_offset: 0,
        };
        block.sync_header();
        block
    }

    fn capacity(&self) -> usize {
        self.memory.len()
    }

    fn end(&self) -> u64 {
        self.base + self.memory.len() as u64
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    fn ptr_at(&self, offset: usize) -> ArenaPtr {
        ArenaPtr(self.base + offset as u64)
    }

    /// Chunk header offset for a payload pointer, if it lies in the bumped region.
    fn chunk_of(&self, ptr: ArenaPtr) -> Option<usize> {
        let offset = (ptr.0 - self.base) as usize;
        if offset < BLOCK_HEADER_SIZE + CHUNK_HEADER_SIZE || offset >= self.cursor {
            return None;
        }
        Some(offset - CHUNK_HEADER_SIZE)
    }

    fn chunk_size(&self, chunk: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.memory[chunk..chunk + 4]);
        u32::from_le_bytes(raw)
    }

    fn set_chunk_size(&mut self, chunk: usize, size: u32) {
        self.memory[chunk..chunk + 4].copy_from_slice(&size.to_le_bytes());
    }

    fn release_ref(&mut self) {
        match self.live_refs.checked_sub(1) {
            Some(n) => self.live_refs = n,
            None => panic!(
                "live reference count underflow in allocation block at {:#x}",
                self.base
            ),
        }
    }

    fn sync_header(&mut self) {
        let used = self.cursor as u64;
        let root = self.root_offset as u64;
        self.memory[USED_AT..USED_AT + 8].copy_from_slice(&used.to_le_bytes());
        self.memory[ROOT_AT..ROOT_AT + 8].copy_from_slice(&root.to_le_bytes());
        self.memory[REFS_AT..REFS_AT + 4].copy_from_slice(&self.live_refs.to_le_bytes());
    }

    fn info(&self, active: bool) -> BlockInfo {
        BlockInfo {
            base: self.base,
            capacity: self.capacity(),
            used: self.cursor,
            live_refs: self.live_refs,
            root_offset: self.root_offset,
            active,
        }
    }
}

/// Per-size-class stacks of freed chunk offsets, scoped to one block.
#[derive(Debug)]
struct FreeLists {
    classes: [Vec<u32>; NUM_SIZE_CLASSES],
}

impl Default for FreeLists {
    fn default() -> Self {
        Self {
            classes: std::array::from_fn(|_| Vec::new()),
        }
    }
}

impl FreeLists {
    fn push(&mut self, chunk: usize, size: u32) {
        self.classes[size_class(size)].push(chunk as u32);
    }

    /// Smallest qualifying class first, most recently freed first within a class.
    fn take_fitting(&mut self, block: &Block, needed: u32) -> Option<usize> {
        for class in size_class(needed)..NUM_SIZE_CLASSES {
            let list = &mut self.classes[class];
            if let Some(j) = list
                .iter()
                .rposition(|&chunk| block.chunk_size(chunk as usize) >= needed)
            {
                return Some(list.remove(j) as usize);
            }
        }
        None
    }

    fn total_bytes(&self, block: &Block) -> usize {
        self.classes
            .iter()
            .flatten()
            .map(|&chunk| block.chunk_size(chunk as usize) as usize)
            .sum()
    }

    fn clear(&mut self) {
        for list in &mut self.classes {
            list.clear();
        }
    }
}

struct ActiveState {
    block: Block,
    exhaustion: Exhaustion,
    user_supplied: bool,
    free_lists: FreeLists,
}

/// Allocation state saved by [`Arena::temporarily_use_block`].
///
/// The substituted block carries a phantom reference until this state is
/// handed back to [`Arena::restore`].
#[must_use = "the substituted block stays pinned until the prior state is restored"]
pub struct PriorState {
    base: u64,
    exhaustion: Exhaustion,
    user_supplied: bool,
    free_lists: FreeLists,
}

/// Single-owner block allocator.
pub struct Arena {
    active: ActiveState,
    // Sorted by end address.
    inactive: Vec<Block>,
    policy: AllocatorPolicy,
    next_base: u64,
}

impl Arena {
    /// Create an arena whose first active block is `capacity` arena-owned bytes.
    pub fn new(capacity: usize) -> Self {
        let block = Block::new(vec![0u8; capacity].into_boxed_slice(), FIRST_BASE);
        Self {
            next_base: FIRST_BASE + capacity as u64,
            active: ActiveState {
                block,
                exhaustion: Exhaustion::Fail,
                user_supplied: false,
                free_lists: FreeLists::default(),
            },
            inactive: Vec::new(),
            policy: AllocatorPolicy::default(),
        }
    }

    pub fn policy(&self) -> AllocatorPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: AllocatorPolicy) {
        self.policy = policy;
    }

    /// Install `memory` as the arena-owned active block.
    ///
    /// The superseded block is released if it has no live chunks and kept as
    /// inactive otherwise. A superseded caller-owned block is handed back.
    pub fn set_active_block(
        &mut self,
        memory: Box<[u8]>,
        exhaustion: Exhaustion,
    ) -> Option<Box<[u8]>> {
        self.install(memory, exhaustion, false)
    }

    /// Install caller-owned `memory`; it is never retired, only handed back.
    pub fn set_user_supplied_block(
        &mut self,
        memory: Box<[u8]>,
        exhaustion: Exhaustion,
    ) -> Option<Box<[u8]>> {
        self.install(memory, exhaustion, true)
    }

    /// Allocate `size` payload bytes from the active block.
    ///
    /// Returns `Ok(None)` only when the block was installed with
    /// [`Exhaustion::ReturnNull`].
    pub fn allocate(&mut self, size: usize) -> Result<Option<ArenaPtr>, ArenaError> {
        let needed = chunk_bytes_for(size);
        let state = &mut self.active;

        if self.policy != AllocatorPolicy::NoReuse {
            if let Ok(needed32) = u32::try_from(needed) {
                if let Some(chunk) = state.free_lists.take_fitting(&state.block, needed32) {
                    state.block.live_refs += 1;
                    trace!("reused chunk at offset {} for {} bytes", chunk, needed);
                    return Ok(Some(state.block.ptr_at(chunk + CHUNK_HEADER_SIZE)));
                }
            }
        }

        let block = &mut state.block;
        let available = block.capacity() - block.cursor;
        if needed > available {
            return match state.exhaustion {
                Exhaustion::Fail => Err(ArenaError::OutOfArenaSpace { needed, available }),
                Exhaustion::ReturnNull => Ok(None),
            };
        }

        let chunk = block.cursor;
        block.cursor += needed;
        block.set_chunk_size(chunk, needed as u32);
        block.live_refs += 1;
        trace!("bumped chunk at offset {} for {} bytes", chunk, needed);
        Ok(Some(block.ptr_at(chunk + CHUNK_HEADER_SIZE)))
    }

    /// Allocate, treating a null result as exhaustion.
    pub fn alloc(&mut self, size: usize) -> Result<ArenaPtr, ArenaError> {
        match self.allocate(size)? {
            Some(ptr) => Ok(ptr),
            None => Err(ArenaError::OutOfArenaSpace {
                needed: chunk_bytes_for(size),
                available: self.active.block.capacity() - self.active.block.cursor,
            }),
        }
    }

    /// Release one chunk.
    ///
    /// Chunks of the active block go onto its free lists. Chunks of inactive
    /// blocks drop a reference, and the block is released at zero. Pointers
    /// owned by no block are ignored.
    pub fn free(&mut self, ptr: ArenaPtr) {
        if self.policy == AllocatorPolicy::NoRefCount {
            return;
        }

        let state = &mut self.active;
        if state.block.contains(ptr.0) {
            let Some(chunk) = state.block.chunk_of(ptr) else {
                warn!("ignoring free of {:#x}: not a chunk of the active block", ptr.0);
                return;
            };
            let size = state.block.chunk_size(chunk);
            state.free_lists.push(chunk, size);
            state.block.release_ref();
            return;
        }

        match self.inactive_index(ptr.0) {
            Some(i) => {
                let block = &mut self.inactive[i];
                block.release_ref();
                if block.live_refs == 0 {
                    let block = self.inactive.remove(i);
                    debug!(
                        "released inactive block at {:#x} ({} bytes)",
                        block.base,
                        block.capacity()
                    );
                }
            }
            None => trace!("ignoring free of unmanaged pointer {:#x}", ptr.0),
        }
    }

    pub fn is_owned(&self, ptr: ArenaPtr) -> bool {
        self.active.block.contains(ptr.0) || self.inactive_index(ptr.0).is_some()
    }

    /// Describe the block holding `ptr`, if any.
    pub fn owner_block_of(&self, ptr: ArenaPtr) -> Option<BlockInfo> {
        if self.active.block.contains(ptr.0) {
            return Some(self.active.block.info(true));
        }
        self.inactive_index(ptr.0)
            .map(|i| self.inactive[i].info(false))
    }

    /// Record `ptr` as the root object of its block, so the block can be read
    /// back as a self-contained record.
    pub fn stamp_root(&mut self, ptr: ArenaPtr) -> Option<BlockInfo> {
        let (block, active) = if self.active.block.contains(ptr.0) {
            (&mut self.active.block, true)
        } else {
            let i = self.inactive_index(ptr.0)?;
            (&mut self.inactive[i], false)
        };
        block.root_offset = (ptr.0 - block.base) as usize;
        block.sync_header();
        Some(block.info(active))
    }

    /// Live references of the block holding `ptr`; zero if unowned.
    pub fn live_refs_of(&self, ptr: ArenaPtr) -> u32 {
        self.owner_block_of(ptr).map_or(0, |info| info.live_refs)
    }

    pub fn active_live_refs(&self) -> u32 {
        self.active.block.live_refs
    }

    pub fn active_block(&self) -> BlockInfo {
        self.active.block.info(true)
    }

    pub fn inactive_block_count(&self) -> usize {
        self.inactive.len()
    }

    /// Cursor of the active block, header included.
    pub fn bytes_used(&self) -> usize {
        self.active.block.cursor
    }

    /// Unbumped tail plus every free-listed chunk of the active block.
    pub fn bytes_available(&self) -> usize {
        let block = &self.active.block;
        block.capacity() - block.cursor + self.active.free_lists.total_bytes(block)
    }

    /// Substitute caller-owned `memory` as the active block until [`Arena::restore`].
    pub fn temporarily_use_block(&mut self, memory: Box<[u8]>) -> PriorState {
        self.substitute(memory, true)
    }

    /// Substitute a fresh arena-owned block of `capacity` bytes.
    pub fn temporarily_use_owned_block(&mut self, capacity: usize) -> PriorState {
        self.substitute(vec![0u8; capacity].into_boxed_slice(), false)
    }

    /// Return to the block active before the matching substitution.
    ///
    /// A caller-owned substitute is handed back with its header synced.
    pub fn restore(&mut self, prior: PriorState) -> Option<Box<[u8]>> {
        let Some(i) = self.inactive.iter().position(|b| b.base == prior.base) else {
            panic!(
                "restoring allocation block at {:#x} that is no longer registered",
                prior.base
            );
        };
        let mut block = self.inactive.remove(i);
        block.release_ref();
        let current = mem::replace(
            &mut self.active,
            ActiveState {
                block,
                exhaustion: prior.exhaustion,
                user_supplied: prior.user_supplied,
                free_lists: prior.free_lists,
            },
        );
        self.retire(current)
    }

    /// Forget everything in the block holding `ptr`.
    ///
    /// The active block loses its free lists and reference count; an inactive
    /// block is dropped outright.
    pub fn empty_out_block(&mut self, ptr: ArenaPtr) -> bool {
        if self.active.block.contains(ptr.0) {
            self.active.free_lists.clear();
            self.active.block.live_refs = 0;
            debug!("emptied the active block");
            return true;
        }
        match self.inactive_index(ptr.0) {
            Some(i) => {
                self.inactive.remove(i);
                debug!("emptied an inactive block");
                true
            }
            None => {
                warn!("asked to empty out a block that holds {:#x}, none found", ptr.0);
                false
            }
        }
    }

    /// Release every inactive block regardless of references.
    pub fn clean_inactive_blocks(&mut self) -> usize {
        let n = self.inactive.len();
        self.inactive.clear();
        n
    }

    pub(crate) fn active_bytes(&self) -> &[u8] {
        &self.active.block.memory
    }

    pub(crate) fn active_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.active.block.memory
    }

    pub fn active_ptr(&self, offset: usize) -> ArenaPtr {
        self.active.block.ptr_at(offset)
    }


    /// Allocate and return the payload offset within the active block.
    pub(crate) fn alloc_offset(&mut self, size: usize) -> Result<usize, ArenaError> {
        let ptr = self.alloc(size)?;
        Ok((ptr.0 - self.active.block.base) as usize)
    }

    pub(crate) fn free_offset(&mut self, offset: usize) {
        let ptr = self.active_ptr(offset);
        self.free(ptr);
    }

    /// Payload bytes of the active-block chunk whose payload starts at `offset`.
    pub(crate) fn payload_len(&self, offset: usize) -> usize {
        self.active.block.chunk_size(offset - CHUNK_HEADER_SIZE) as usize - CHUNK_HEADER_SIZE
    }

    fn install(
        &mut self,
        memory: Box<[u8]>,
        exhaustion: Exhaustion,
        user_supplied: bool,
    ) -> Option<Box<[u8]>> {
        let block = self.new_block(memory);
        let previous = mem::replace(
            &mut self.active,
            ActiveState {
                block,
                exhaustion,
                user_supplied,
                free_lists: FreeLists::default(),
            },
        );
        self.retire(previous)
    }

    fn substitute(&mut self, memory: Box<[u8]>, user_supplied: bool) -> PriorState {
        let block = self.new_block(memory);
        self.active.block.live_refs += 1;
        let previous = mem::replace(
            &mut self.active,
            ActiveState {
                block,
                exhaustion: Exhaustion::Fail,
                user_supplied,
                free_lists: FreeLists::default(),
            },
        );
        let mut pinned = previous.block;
        pinned.sync_header();
        let prior = PriorState {
            base: pinned.base,
            exhaustion: previous.exhaustion,
            user_supplied: previous.user_supplied,
            free_lists: previous.free_lists,
        };
        self.insert_inactive(pinned);
        prior
    }

    fn new_block(&mut self, memory: Box<[u8]>) -> Block {
        let len = memory.len() as u64;
        let block = Block::new(memory, self.next_base);
        self.next_base += len;
        block
    }

    fn retire(&mut self, state: ActiveState) -> Option<Box<[u8]>> {
        let mut block = state.block;
        block.sync_header();
        if state.user_supplied {
            debug!("handing back caller-owned block at {:#x}", block.base);
            return Some(block.memory);
        }
        if block.live_refs > 0 {
            debug!(
                "retiring block at {:#x} with {} live references",
                block.base, block.live_refs
            );
            self.insert_inactive(block);
        } else {
            debug!("releasing unreferenced block at {:#x}", block.base);
        }
        None
    }

    fn insert_inactive(&mut self, block: Block) {
        let at = self.inactive.partition_point(|b| b.end() <= block.end());
        self.inactive.insert(at, block);
    }

    fn inactive_index(&self, addr: u64) -> Option<usize> {
        let i = self.inactive.partition_point(|b| b.end() <= addr);
        (i < self.inactive.len() && self.inactive[i].contains(addr)).then_some(i)
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inactive: Vec<BlockInfo> = self.inactive.iter().map(|b| b.info(false)).collect();
        f.debug_struct("Arena")
            .field("policy", &self.policy)
            .field("active", &self.active.block.info(true))
            .field("user_supplied", &self.active.user_supplied)
            .field("inactive", &inactive)
            .finish()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if !self.active.user_supplied && self.active.block.live_refs != 0 {
            warn!(
                "active allocation block dropped with {} live references",
                self.active.block.live_refs
            );
        }
        if self.inactive.is_empty() {
            return;
        }
        if self.policy == AllocatorPolicy::NoRefCount {
            warn!(
                "releasing {} inactive blocks without reference counts",
                self.inactive.len()
            );
            return;
        }
        for block in &self.inactive {
            error!(
                "inactive allocation block at {:#x} ({} bytes) still has {} live references",
                block.base,
                block.capacity(),
                block.live_refs
            );
        }
        if !std::thread::panicking() {
            panic!(
                "arena dropped with {} referenced inactive blocks",
                self.inactive.len()
            );
        }
    }
}

/// Arena handle shared by the operators of one worker thread.
pub type SharedArena = Rc<RefCell<Arena>>;

pub fn shared(arena: Arena) -> SharedArena {
    Rc::new(RefCell::new(arena))
}

thread_local! {
    static THREAD_ARENA: SharedArena = shared(Arena::default());
}

/// The calling thread's arena.
pub fn thread_arena() -> SharedArena {
    THREAD_ARENA.with(Rc::clone)
}
