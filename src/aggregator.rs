//! Partition-local aggregation
//!
//! Merges the map of one hash partition from every input page into a single
//! output map, spilling to a fresh output page whenever the current one fills.

use std::hash::Hash;

use log::{debug, warn};

use crate::aggregate::Aggregate;
use crate::arena::SharedArena;
use crate::codec::PageCodec;
use crate::error::{PageboundError, Result};
use crate::operator::{BoundedOperator, OperatorCore, OperatorState};
use crate::page_map::{MapView, PageMap};
use crate::record::Record;

pub struct PartitionAggregator<K, V> {
    core: OperatorCore,
    partition_id: u32,
    input: Option<Record>,
    // Header of this partition's map on the input page.
    input_map: Option<usize>,
    cursor: usize,
    emitted: usize,
    seen_partition: bool,
    output: Option<PageMap<K, V>>,
}

impl<K, V> PartitionAggregator<K, V>
where
    K: PageCodec + Hash + Eq,
    V: Aggregate,
{
    pub fn new(arena: SharedArena, partition_id: u32) -> Self {
        Self {
            core: OperatorCore::new(arena, "aggregator"),
            partition_id,
            input: None,
            input_map: None,
            cursor: 0,
            emitted: 0,
            seen_partition: false,
            output: None,
        }
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// Next input slot to merge.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Entries merged from the current input page so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

impl<K, V> BoundedOperator for PartitionAggregator<K, V>
where
    K: PageCodec + Hash + Eq,
    V: Aggregate,
{
    fn initialize(&mut self) {
        self.core.initialize();
        self.seen_partition = false;
    }

    fn load_input_page(&mut self, page: Record) -> Result<()> {
        let found = page.partitioned::<K, V>()?.find(self.partition_id)?;
        match found {
            Some(_) => debug!("aggregator {}: loaded input page", self.partition_id),
            None => debug!(
                "aggregator {}: partition absent from input page",
                self.partition_id
            ),
        }
        self.seen_partition |= found.is_some();
        self.input = Some(page);
        self.input_map = found;
        self.cursor = 0;
        self.emitted = 0;
        self.core.input_loaded(found.is_some());
        Ok(())
    }

    fn needs_process_input(&self) -> bool {
        self.input_map.is_some()
    }

    fn load_output_page(&mut self, page: Box<[u8]>) -> Result<()> {
        self.output = None;
        let id = self.partition_id;
        let map = self.core.load_output(page, |arena| {
            let map = PageMap::<K, V>::create(arena, id)?;
            Ok((map, map.offset()))
        })?;
        self.output = Some(map);
        Ok(())
    }

    fn fill_next_output_page(&mut self) -> Result<bool> {
        self.core.require_output()?;
        let map = self.output.ok_or(PageboundError::NoOutputPage)?;

        if let (Some(record), Some(header)) = (&self.input, self.input_map) {
            let view = MapView::<K, V>::open(record.as_bytes(), header)?;
            let arena = self.core.arena();
            while let Some(slot) = view.next_occupied(self.cursor) {
                let (key, value) = view.entry_at(slot)?;
                match map.upsert(&mut arena.borrow_mut(), &key, &value) {
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
                "aggregator {}: input page drained after {} entries",
                self.partition_id, self.emitted
            );
            self.input_map = None;
            self.cursor = 0;
            self.emitted = 0;
        }

        self.core.drained()
    }

    fn finalize(&mut self) {
        if !self.seen_partition {
            warn!(
                "aggregator {}: partition never appeared on any input page",
                self.partition_id
            );
        }
        self.core.finalize();
    }

    fn clear_output_page(&mut self) -> Option<Record> {
        self.output = None;
        self.core.release_output()
    }

    fn clear_input_page(&mut self) -> Option<Record> {
        self.input_map = None;
        self.cursor = 0;
        self.emitted = 0;
        self.input.take()
    }

    fn state(&self) -> OperatorState {
        self.core.state()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::rc::Rc;

    use super::*;
    use crate::arena::{Arena, shared};
    use crate::operator::new_page;
    use crate::shuffle::partitioned_page;

    fn input(parts: &[(u32, &[(&str, i64)])]) -> Record {
        let arena = shared(Arena::new(1024));
        let parts: Vec<(u32, Vec<(String, i64)>)> = parts
            .iter()
            .map(|(id, kvs)| (*id, kvs.iter().map(|(k, v)| (k.to_string(), *v)).collect()))
            .collect();
        partitioned_page(&arena, 4096, &parts).unwrap()
    }

    fn contents(record: &Record) -> HashMap<String, i64> {
        record.map::<String, i64>().unwrap().to_hash_map().unwrap()
    }

    /// Concatenating aggregate whose merged value outgrows its chunk.
    #[derive(Clone, Debug, PartialEq)]
    struct Tags(Vec<u8>);

    impl PageCodec for Tags {
        fn encoded_len(&self) -> usize {
            self.0.encoded_len()
        }

        fn encode(&self, out: &mut [u8]) {
            self.0.encode(out)
        }

        fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
            Vec::<u8>::decode(bytes).map(|(v, n)| (Tags(v), n))
        }
    }

    impl Aggregate for Tags {
        fn combine(&self, other: &Self) -> Self {
            Tags([self.0.as_slice(), other.0.as_slice()].concat())
        }
    }

    fn tags_input(tags: Vec<u8>) -> Record {
        let arena = shared(Arena::new(1024));
        partitioned_page(&arena, 4096, &[(0, vec![("k".to_string(), Tags(tags))])]).unwrap()
    }

    fn tags_of(record: &Record) -> HashMap<String, Tags> {
        record.map::<String, Tags>().unwrap().to_hash_map().unwrap()
    }

    #[test]
    fn test_merges_one_partition_in_one_page() {
        let arena = shared(Arena::new(1024));
        let mut agg = PartitionAggregator::<String, i64>::new(arena, 1);
        agg.initialize();
        agg.load_input_page(input(&[(0, &[("z", 9)]), (1, &[("a", 4), ("b", 2)])]))
            .unwrap();
        assert!(agg.needs_process_input());
        assert_eq!(agg.state(), OperatorState::Ready { has_input: true });

        agg.load_output_page(new_page(1024)).unwrap();
        assert!(!agg.fill_next_output_page().unwrap());
        assert_eq!(agg.state(), OperatorState::Draining);

        let out = agg.clear_output_page().unwrap();
        assert_eq!(out.map::<String, i64>().unwrap().partition_id(), 1);
        assert_eq!(contents(&out), HashMap::from([("a".into(), 4), ("b".into(), 2)]));
    }

    #[test]
    fn test_missing_partition_means_no_work() {
        let arena = shared(Arena::new(1024));
        let mut agg = PartitionAggregator::<String, i64>::new(arena, 5);
        agg.initialize();
        agg.load_input_page(input(&[(0, &[("a", 1)])])).unwrap();
        assert!(!agg.needs_process_input());
        assert_eq!(agg.state(), OperatorState::Ready { has_input: false });

        agg.load_output_page(new_page(512)).unwrap();
        agg.finalize();
        assert!(!agg.fill_next_output_page().unwrap());
        assert_eq!(agg.state(), OperatorState::Done);
        let out = agg.clear_output_page().unwrap();
        assert!(contents(&out).is_empty());
    }

    #[test]
    fn test_accumulates_across_input_pages() {
        let arena = shared(Arena::new(1024));
        let mut agg = PartitionAggregator::<String, i64>::new(arena, 0);
        agg.initialize();
        agg.load_output_page(new_page(2048)).unwrap();
        for page in [
            input(&[(0, &[("a", 1), ("b", 1)])]),
            input(&[(0, &[("a", 10)])]),
        ] {
            agg.load_input_page(page).unwrap();
            assert!(!agg.fill_next_output_page().unwrap());
            agg.clear_input_page();
        }
        agg.finalize();
        assert!(!agg.fill_next_output_page().unwrap());
        let out = agg.clear_output_page().unwrap();
        assert_eq!(contents(&out), HashMap::from([("a".into(), 11), ("b".into(), 1)]));
    }

    #[test]
    fn test_resumes_on_fresh_output_page() {
        let arena = shared(Arena::new(1024));
        let mut agg = PartitionAggregator::<String, i64>::new(arena, 0);
        let kvs: Vec<(String, i64)> = (0..40).map(|i| (format!("key{}", i), i)).collect();
        let page = partitioned_page(&shared(Arena::new(1024)), 8192, &[(0, kvs.clone())]).unwrap();

        agg.initialize();
        agg.load_input_page(page).unwrap();
        agg.load_output_page(new_page(512)).unwrap();
        let mut merged = HashMap::new();
        let mut pages = 0;
        while agg.fill_next_output_page().unwrap() {
            assert_eq!(agg.state(), OperatorState::Filling);
            assert!(agg.cursor() > 0);
            let out = agg.clear_output_page().unwrap();
            for (k, v) in contents(&out) {
                assert!(merged.insert(k, v).is_none());
            }
            pages += 1;
            agg.load_output_page(new_page(512)).unwrap();
        }
        let out = agg.clear_output_page().unwrap();
        for (k, v) in contents(&out) {
            assert!(merged.insert(k, v).is_none());
        }
        assert!(pages > 0);
        assert_eq!(merged, kvs.into_iter().collect::<HashMap<_, _>>());
    }

    #[test]
    fn test_entry_larger_than_page_is_reported() {
        let arena = shared(Arena::new(1024));
        let mut agg = PartitionAggregator::<String, i64>::new(arena, 0);
        let big = "x".repeat(400);
        agg.initialize();
        agg.load_input_page(input(&[(0, &[(big.as_str(), 1)])])).unwrap();
        agg.load_output_page(new_page(256)).unwrap();
        assert!(matches!(
            agg.fill_next_output_page(),
            Err(PageboundError::EntryExceedsPage { capacity: 256 })
        ));
    }

    #[test]
    fn test_fill_without_output_page() {
        let arena = shared(Arena::new(1024));
        let mut agg = PartitionAggregator::<String, i64>::new(arena, 0);
        agg.initialize();
        assert!(matches!(
            agg.fill_next_output_page(),
            Err(PageboundError::NoOutputPage)
        ));
    }

    #[test]
    fn test_failed_merge_keeps_previous_value_on_the_page() {
        // Room for the empty map and one short entry, but not a grown value.
        let mut scratch = Arena::new(4096);
        let sizing = PageMap::<String, Tags>::create(&mut scratch, 0).unwrap();
        sizing.upsert(&mut scratch, &"k".to_string(), &Tags(vec![1])).unwrap();
        let page_size = scratch.bytes_used() + 4;

        let arena = shared(Arena::new(1024));
        let mut agg = PartitionAggregator::<String, Tags>::new(Rc::clone(&arena), 0);
        agg.initialize();
        agg.load_output_page(new_page(page_size)).unwrap();

        agg.load_input_page(tags_input(vec![1])).unwrap();
        assert!(!agg.fill_next_output_page().unwrap());
        agg.clear_input_page();

        // Merging into the existing key needs a larger chunk than is left.
        agg.load_input_page(tags_input(vec![2; 20])).unwrap();
        assert!(agg.fill_next_output_page().unwrap());
        let first = agg.clear_output_page().unwrap();
        assert_eq!(tags_of(&first), HashMap::from([("k".to_string(), Tags(vec![1]))]));

        agg.load_output_page(new_page(1024)).unwrap();
        assert!(!agg.fill_next_output_page().unwrap());
        let second = agg.clear_output_page().unwrap();

        let folded = tags_of(&first)["k"].combine(&tags_of(&second)["k"]);
        assert_eq!(folded, Tags(vec![1]).combine(&Tags(vec![2; 20])));
        assert_eq!(arena.borrow().inactive_block_count(), 0);
    }

    #[test]
    fn test_buried_output_page_is_not_written() {
        let arena = shared(Arena::new(1024));
        let page = || input(&[(0, &[("a", 1)]), (1, &[("b", 2)])]);
        let mut first = PartitionAggregator::<String, i64>::new(Rc::clone(&arena), 0);
        let mut second = PartitionAggregator::<String, i64>::new(Rc::clone(&arena), 1);
        first.initialize();
        second.initialize();
        first.load_input_page(page()).unwrap();
        second.load_input_page(page()).unwrap();

        first.load_output_page(new_page(1024)).unwrap();
        second.load_output_page(new_page(2048)).unwrap();
        assert!(matches!(
            first.fill_next_output_page(),
            Err(PageboundError::OutputPageNotActive { operator: "aggregator" })
        ));

        assert!(!second.fill_next_output_page().unwrap());
        let out = second.clear_output_page().unwrap();
        assert_eq!(out.capacity(), 2048);
        assert_eq!(out.map::<String, i64>().unwrap().partition_id(), 1);
        assert_eq!(contents(&out), HashMap::from([("b".into(), 2)]));

        // Back on top, the first page fills normally.
        assert!(!first.fill_next_output_page().unwrap());
        let out = first.clear_output_page().unwrap();
        assert_eq!(out.capacity(), 1024);
        assert_eq!(contents(&out), HashMap::from([("a".into(), 1)]));
        assert_eq!(arena.borrow().inactive_block_count(), 0);
    }

    #[test]
    #[should_panic(expected = "reverse load order")]
    fn test_releasing_a_buried_output_page_is_fatal() {
        let arena = shared(Arena::new(1024));
        let mut first = PartitionAggregator::<String, i64>::new(Rc::clone(&arena), 0);
        let mut second = PartitionAggregator::<String, i64>::new(Rc::clone(&arena), 1);
        first.initialize();
        second.initialize();
        first.load_output_page(new_page(1024)).unwrap();
        second.load_output_page(new_page(1024)).unwrap();
        first.clear_output_page();
    }
}
