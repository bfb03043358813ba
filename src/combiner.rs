//! Cross-partition combining on one node
//!
//! Each input page carries maps for cluster-level partitions. The combiner
//! merges the maps of the partitions hosted on this node into one output map
//! per node-local partition, where local id `i` stands for the `i`th configured
//! cluster partition.

use std::hash::Hash;

use log::debug;

use crate::aggregate::Aggregate;
use crate::arena::SharedArena;
use crate::codec::PageCodec;
use crate::error::Result;
use crate::operator::{BoundedOperator, OperatorCore, OperatorState};
use crate::page_map::{MapView, PageMap};
use crate::page_vec::PageVec;
use crate::record::Record;

pub struct CrossPartitionCombiner<K, V> {
    core: OperatorCore,
    node_partitions: Vec<u32>,
    input: Option<Record>,
    input_maps: Vec<Option<usize>>,
    part_pos: usize,
    cursor: usize,
    emitted: usize,
    outputs: Vec<PageMap<K, V>>,
}

impl<K, V> CrossPartitionCombiner<K, V>
where
    K: PageCodec + Hash + Eq,
    V: Aggregate,
{
    pub fn new(arena: SharedArena, node_partitions: Vec<u32>) -> Self {
        Self {
            core: OperatorCore::new(arena, "combiner"),
            node_partitions,
            input: None,
            input_maps: Vec::new(),
            part_pos: 0,
            cursor: 0,
            emitted: 0,
            outputs: Vec::new(),
        }
    }

    pub fn node_partitions(&self) -> &[u32] {
        &self.node_partitions
    }

    /// Position in `node_partitions` currently being merged.
    pub fn part_pos(&self) -> usize {
        self.part_pos
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

impl<K, V> BoundedOperator for CrossPartitionCombiner<K, V>
where
    K: PageCodec + Hash + Eq,
    V: Aggregate,
{
    fn initialize(&mut self) {
        self.core.initialize();
    }

    fn load_input_page(&mut self, page: Record) -> Result<()> {
        let view = page.partitioned::<K, V>()?;
        let mut input_maps = Vec::with_capacity(self.node_partitions.len());
        for &id in &self.node_partitions {
            let found = view.find(id)?;
            if found.is_none() {
                debug!("combiner: partition {} absent from input page", id);
            }
            input_maps.push(found);
        }
        let has_input = input_maps.iter().any(Option::is_some);
        self.input_maps = input_maps;
        self.input = Some(page);
        self.part_pos = 0;
        self.cursor = 0;
        self.emitted = 0;
        self.core.input_loaded(has_input);
        Ok(())
    }

    fn needs_process_input(&self) -> bool {
        self.input_maps[self.part_pos.min(self.input_maps.len())..]
            .iter()
            .any(Option::is_some)
    }

    fn load_output_page(&mut self, page: Box<[u8]>) -> Result<()> {
        self.outputs.clear();
        let n = self.node_partitions.len();
        self.outputs = self.core.load_output(page, |arena| {
            let vec = PageVec::create(arena, n)?;
            let mut maps = Vec::with_capacity(n);
            for local in 0..n {
                let map = PageMap::create(arena, local as u32)?;
                vec.push(arena, map.offset())?;
                maps.push(map);
            }
            Ok((maps, vec.offset()))
        })?;
        debug!("combiner: output page loaded at partition position {}", self.part_pos);
        Ok(())
    }

    fn fill_next_output_page(&mut self) -> Result<bool> {
        self.core.require_output()?;

        if let Some(record) = &self.input {
            let arena = self.core.arena();
            while self.part_pos < self.input_maps.len() {
                let Some(header) = self.input_maps[self.part_pos] else {
                    self.part_pos += 1;
                    continue;
                };
                let view = MapView::<K, V>::open(record.as_bytes(), header)?;
                let out = self.outputs[self.part_pos];
                while let Some(slot) = view.next_occupied(self.cursor) {
                    let (key, value) = view.entry_at(slot)?;
                    match out.upsert(&mut arena.borrow_mut(), &key, &value) {
                        Ok(()) => {
                            self.cursor = slot + 1;
                            self.emitted += 1;
                            self.core.entry_written();
                        }
                        Err(e) if e.is_out_of_space() => return self.core.page_full(),
                        Err(e) => return Err(e),
                    }
                }
                debug!(
                    "combiner: partition {} merged ({} entries)",
                    self.node_partitions[self.part_pos], self.emitted
                );
                self.part_pos += 1;
                self.cursor = 0;
                self.emitted = 0;
            }
        }

        self.core.drained()
    }

    fn finalize(&mut self) {
        self.core.finalize();
    }

    fn clear_output_page(&mut self) -> Option<Record> {
        self.outputs.clear();
        self.core.release_output()
    }

    fn clear_input_page(&mut self) -> Option<Record> {
        self.input_maps.clear();
        self.part_pos = 0;
        self.cursor = 0;
        self.emitted = 0;
        self.input.take()
    }

    fn state(&self) -> OperatorState {
        self.core.state()
    }
}
