//! Flattening of a finished aggregate map into key/value pairs

use std::marker::PhantomData;

use log::debug;

use crate::arena::SharedArena;
use crate::codec::PageCodec;
use crate::error::{PageboundError, Result};
use crate::operator::{BoundedOperator, OperatorCore, OperatorState};
use crate::page_vec::{PageVec, write_pair};
use crate::record::Record;

const INITIAL_PAIRS: usize = 16;

pub struct ResultMaterializer<K, V> {
    core: OperatorCore,
    input: Option<Record>,
    pending: bool,
    cursor: usize,
    emitted: usize,
    output: Option<PageVec>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: PageCodec, V: PageCodec> ResultMaterializer<K, V> {
    pub fn new(arena: SharedArena) -> Self {
        Self {
            core: OperatorCore::new(arena, "materializer"),
            input: None,
            pending: false,
            cursor: 0,
            emitted: 0,
            output: None,
            _marker: PhantomData,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

impl<K: PageCodec, V: PageCodec> BoundedOperator for ResultMaterializer<K, V> {
    fn initialize(&mut self) {
        self.core.initialize();
    }

    fn load_input_page(&mut self, page: Record) -> Result<()> {
        let has_input = !page.map::<K, V>()?.is_empty();
        self.input = Some(page);
        self.pending = has_input;
        self.cursor = 0;
        self.emitted = 0;
        self.core.input_loaded(has_input);
        Ok(())
    }

    fn needs_process_input(&self) -> bool {
        self.pending
    }

    fn load_output_page(&mut self, page: Box<[u8]>) -> Result<()> {
        self.output = None;
        let vec = self.core.load_output(page, |arena| {
            let vec = PageVec::create(arena, INITIAL_PAIRS)?;
            Ok((vec, vec.offset()))
        })?;
        self.output = Some(vec);
        Ok(())
    }

    fn fill_next_output_page(&mut self) -> Result<bool> {
        self.core.require_output()?;
        let pairs = self.output.ok_or(PageboundError::NoOutputPage)?;

        if let (Some(record), true) = (&self.input, self.pending) {
            let view = record.map::<K, V>()?;
            let arena = self.core.arena();
            while let Some(slot) = view.next_occupied(self.cursor) {
                let (key, value) = view.entry_at(slot)?;
                let pushed = {
                    let mut arena = arena.borrow_mut();
                    write_pair(&mut arena, &key, &value).and_then(|at| {
                        let pushed = pairs.push(&mut arena, at);
                        if pushed.is_err() {
                            arena.free_offset(at);
                        }
                        pushed
                    })
                };
                match pushed {
                    Ok(()) => {
                        self.cursor = slot + 1;
                        self.emitted += 1;
                        self.core.entry_written();
                    }
                    Err(e) if e.is_out_of_space() => return self.core.page_full(),
                    Err(e) => return Err(e),
                }
            }
            debug!("materializer: flattened {} pairs", self.emitted);
            self.pending = false;
            self.cursor = 0;
            self.emitted = 0;
        }

        self.core.drained()
    }

    fn finalize(&mut self) {
        self.core.finalize();
    }

    fn clear_output_page(&mut self) -> Option<Record> {
        self.output = None;
        self.core.release_output()
    }

    fn clear_input_page(&mut self) -> Option<Record> {
        self.pending = false;
        self.cursor = 0;
        self.emitted = 0;
        self.input.take()
    }

    fn state(&self) -> OperatorState {
        self.core.state()
    }
}
