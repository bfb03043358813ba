//! Page-bounded streaming operator contract
//!
//! Operators build their result inside a caller-supplied output page that is
//! substituted as the arena's active block. When the page fills, the partial
//! result is left in place as a record and `fill_next_output_page` returns
//! `true`; the caller collects the page and supplies a fresh one, and the
//! operator resumes from its cursor.
//!
//! Output pages are stacked on the arena, so operators sharing an arena must
//! release their pages in reverse load order, and only the operator whose page
//! is on top may fill. Filling a buried page is an `OutputPageNotActive` error;
//! releasing one out of order is a fatal defect.

use std::rc::Rc;

use log::{debug, error, warn};

use crate::arena::{Arena, PriorState, SharedArena};
use crate::error::{PageboundError, Result};
use crate::record::Record;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorState {
    Idle,
    Ready { has_input: bool },
    /// The last fill stopped on a full output page.
    Filling,
    /// The current input page is fully drained.
    Draining,
    Done,
}

/// Lifecycle shared by every page-bounded operator.
pub trait BoundedOperator {
    fn initialize(&mut self);

    /// Attach the next input page and reset the per-input cursor.
    fn load_input_page(&mut self, page: Record) -> Result<()>;

    /// Whether the loaded input page holds anything for this operator.
    fn needs_process_input(&self) -> bool;

    /// Install `page` as the output block and create an empty result in it.
    fn load_output_page(&mut self, page: Box<[u8]>) -> Result<()>;

    /// Returns `true` when the output page filled before the input drained.
    fn fill_next_output_page(&mut self) -> Result<bool>;

    fn finalize(&mut self);

    /// Hand back the output page as a record.
    fn clear_output_page(&mut self) -> Option<Record>;

    fn clear_input_page(&mut self) -> Option<Record>;

    fn state(&self) -> OperatorState;
}

struct OutputPage {
    prior: PriorState,
    // Arena address of the substituted page.
    base: u64,
    capacity: usize,
    written: usize,
}

/// Output-page bookkeeping shared by the operators.
pub struct OperatorCore {
    arena: SharedArena,
    state: OperatorState,
    finalized: bool,
    output: Option<OutputPage>,
    name: &'static str,
}

impl OperatorCore {
    pub fn new(arena: SharedArena, name: &'static str) -> Self {
        Self {
            arena,
            state: OperatorState::Idle,
            finalized: false,
            output: None,
            name,
        }
    }

    /// Separate handle, so callers can borrow the arena alongside `self`.
    pub fn arena(&self) -> SharedArena {
        Rc::clone(&self.arena)
    }

    pub fn state(&self) -> OperatorState {
        self.state
    }

    pub fn initialize(&mut self) {
        self.finalized = false;
        self.state = OperatorState::Ready { has_input: false };
    }

    pub fn input_loaded(&mut self, has_input: bool) {
        self.state = OperatorState::Ready { has_input };
    }

    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// Substitute `page` as the active block and build the empty result with
    /// `build`. A page too small for the empty result is handed back to the
    /// arena's owner and reported as `OutputPageTooSmall`.
    pub fn load_output<T>(
        &mut self,
        page: Box<[u8]>,
        build: impl FnOnce(&mut Arena) -> Result<(T, usize)>,
    ) -> Result<T> {
        if self.output.is_some() {
            warn!("{}: discarding an output page that was never collected", self.name);
            drop(self.release_output());
        }

        let capacity = page.len();
        let arena = self.arena();
        let (prior, base) = {
            let mut arena = arena.borrow_mut();
            let prior = arena.temporarily_use_block(page);
            (prior, arena.active_block().base)
        };
        self.output = Some(OutputPage {
            prior,
            base,
            capacity,
            written: 0,
        });

        let built = build(&mut *arena.borrow_mut());
        match built {
            Ok((container, root)) => {
                let mut arena = arena.borrow_mut();
                let ptr = arena.active_ptr(root);
                arena.stamp_root(ptr);
                debug!("{}: loaded output page of {} bytes", self.name, capacity);
                Ok(container)
            }
            Err(e) => {
                drop(self.release_output());
                if e.is_out_of_space() {
                    Err(PageboundError::OutputPageTooSmall { capacity })
                } else {
                    Err(e)
                }
            }
        }
    }

    /// The output page is loaded and is the arena's active block, so map and
    /// vector handles write into it.
    pub fn require_output(&self) -> Result<()> {
        let output = self.output.as_ref().ok_or(PageboundError::NoOutputPage)?;
        if self.arena.borrow().active_block().base != output.base {
            return Err(PageboundError::OutputPageNotActive {
                operator: self.name,
            });
        }
        Ok(())
    }

    /// Count one entry written to the current output page.
    pub fn entry_written(&mut self) {
        if let Some(output) = &mut self.output {
            output.written += 1;
        }
    }

    /// The output page filled; the result built so far stays as the record.
    ///
    /// Callers hold the arena borrowed here, so the active-page check is left
    /// to `require_output` at the start of the fill.
    pub fn page_full(&mut self) -> Result<bool> {
        let output = self.output.as_ref().ok_or(PageboundError::NoOutputPage)?;
        if output.written == 0 {
            return Err(PageboundError::EntryExceedsPage {
                capacity: output.capacity,
            });
        }
        debug!(
            "{}: output page full after {} entries",
            self.name, output.written
        );
        self.state = OperatorState::Filling;
        Ok(true)
    }

    /// The current input contributed everything it had.
    pub fn drained(&mut self) -> Result<bool> {
        self.require_output()?;
        self.state = if self.finalized {
            OperatorState::Done
        } else {
            OperatorState::Draining
        };
        Ok(false)
    }

    /// Restore the arena's previous block and hand back the output page.
    ///
    /// Panics if another page was stacked on top of this one and is still
    /// loaded.
    pub fn release_output(&mut self) -> Option<Record> {
        let output = self.output.take()?;
        let mut arena = self.arena.borrow_mut();
        let active = arena.active_block().base;
        if active != output.base {
            if std::thread::panicking() {
                error!(
                    "{}: output page at {:#x} left pinned under the page at {:#x}",
                    self.name, output.base, active
                );
                return None;
            }
            panic!(
                "{}: output page at {:#x} released while the page at {:#x} is still loaded; \
                 output pages must be released in reverse load order",
                self.name, output.base, active
            );
        }
        let page = arena.restore(output.prior)?;
        Some(Record::from_arena_page(page))
    }
}

impl Drop for OperatorCore {
    fn drop(&mut self) {
        if self.output.is_some() {
            debug!("{}: releasing uncollected output page", self.name);
            drop(self.release_output());
        }
    }
}

/// Run `op` over `inputs`, collecting every output page it produces.
///
/// Output pages persist across input pages and are only collected when they
/// fill, and once more after `finalize`.
pub fn drive<O: BoundedOperator>(
    op: &mut O,
    inputs: impl IntoIterator<Item = Record>,
    page_size: usize,
) -> Result<Vec<Record>> {
    fn collect<O: BoundedOperator>(op: &mut O, produced: &mut Vec<Record>) {
        if let Some(record) = op.clear_output_page() {
            produced.push(record.to_compact());
        }
    }

    let mut produced = Vec::new();
    op.initialize();
    op.load_output_page(new_page(page_size))?;
    for input in inputs {
        op.load_input_page(input)?;
        if op.needs_process_input() {
            while op.fill_next_output_page()? {
                collect(op, &mut produced);
                op.load_output_page(new_page(page_size))?;
            }
        }
        op.clear_input_page();
    }

    op.finalize();
    while op.fill_next_output_page()? {
        collect(op, &mut produced);
        op.load_output_page(new_page(page_size))?;
    }
    collect(op, &mut produced);
    Ok(produced)
}

pub fn new_page(page_size: usize) -> Box<[u8]> {
    vec![0u8; page_size].into_boxed_slice()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Arena, shared};
    use crate::page_vec::PageVec;

    #[test]
    fn test_load_output_stamps_root_and_restores() {
        let arena = shared(Arena::new(256));
        let mut core = OperatorCore::new(Rc::clone(&arena), "test");
        core.initialize();
        let v = core
            .load_output(new_page(128), |a| {
                let v = PageVec::create(a, 4)?;
                Ok((v, v.offset()))
            })
            .unwrap();
        assert_eq!(arena.borrow().inactive_block_count(), 1);

        let record = core.release_output().unwrap();
        assert_eq!(record.root_offset(), Some(v.offset()));
        assert_eq!(record.pairs::<u32, u32>().unwrap().len(), 0);
        assert_eq!(arena.borrow().inactive_block_count(), 0);
    }

    #[test]
    fn test_too_small_output_page() {
        let arena = shared(Arena::new(256));
        let mut core = OperatorCore::new(Rc::clone(&arena), "test");
        let err = core
            .load_output(new_page(32), |a| {
                let v = PageVec::create(a, 4)?;
                Ok((v, v.offset()))
            })
            .unwrap_err();
        assert!(matches!(err, PageboundError::OutputPageTooSmall { capacity: 32 }));
        assert!(!core.has_output());
        assert_eq!(arena.borrow().inactive_block_count(), 0);
    }

    #[test]
    fn test_page_full_without_progress_is_an_error() {
        let arena = shared(Arena::new(256));
        let mut core = OperatorCore::new(arena, "test");
        core.load_output(new_page(128), |a| {
            let v = PageVec::create(a, 4)?;
            Ok(((), v.offset()))
        })
        .unwrap();
        assert!(matches!(
            core.page_full(),
            Err(PageboundError::EntryExceedsPage { capacity: 128 })
        ));
        core.entry_written();
        assert!(core.page_full().unwrap());
        assert_eq!(core.state(), OperatorState::Filling);
    }

    #[test]
    fn test_drained_state_follows_finalize() {
        let arena = shared(Arena::new(256));
        let mut core = OperatorCore::new(arena, "test");
        assert!(matches!(core.drained(), Err(PageboundError::NoOutputPage)));
        core.load_output(new_page(128), |a| {
            let v = PageVec::create(a, 4)?;
            Ok(((), v.offset()))
        })
        .unwrap();
        assert!(!core.drained().unwrap());
        assert_eq!(core.state(), OperatorState::Draining);
        core.finalize();
        assert!(!core.drained().unwrap());
        assert_eq!(core.state(), OperatorState::Done);
    }
}
