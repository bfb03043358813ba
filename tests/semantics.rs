//! Tests for the arena and page-bounded operator contracts
//!
//! These exercise the library through its public API only: block lifetime
//! and reference counting, chunk reuse, resumable fills across output pages,
//! and end-to-end aggregation against a plain in-memory fold.

use std::collections::HashMap;

use pagebound::aggregator::PartitionAggregator;
use pagebound::arena::{AllocatorPolicy, Arena, Exhaustion, shared};
use pagebound::combiner::CrossPartitionCombiner;
use pagebound::operator::{BoundedOperator, OperatorState, drive, new_page};
use pagebound::page_map::PageMap;
use pagebound::pipeline::{JobPlan, run_job};
use pagebound::record::Record;
use pagebound::shuffle::partitioned_page;
use pagebound::{Avg, PageboundError};
use proptest::prelude::*;

fn page(n: usize) -> Box<[u8]> {
    vec![0u8; n].into_boxed_slice()
}

fn tuples(raw: &[(&str, i64)]) -> Vec<(String, i64)> {
    raw.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn reference(tuples: &[(String, i64)]) -> HashMap<String, i64> {
    let mut all = HashMap::new();
    for (k, v) in tuples {
        let acc = all.entry(k.clone()).or_insert(0i64);
        *acc = acc.wrapping_add(*v);
    }
    all
}

fn map_contents(record: &Record) -> HashMap<String, i64> {
    record.map::<String, i64>().unwrap().to_hash_map().unwrap()
}

// ============================================================
// Block Lifetime
// ============================================================

#[test]
fn test_temporary_block_keeps_prior_block_alive() {
    let mut arena = Arena::new(256);
    let p = arena.alloc(16).unwrap();

    let prior = arena.temporarily_use_block(page(128));
    assert_eq!(arena.inactive_block_count(), 1);
    // One live chunk plus the phantom reference
    assert_eq!(arena.live_refs_of(p), 2);

    let q = arena.alloc(8).unwrap();
    assert_eq!(arena.active_block().capacity, 128);

    // Freeing into the inactive block must not release it
    arena.free(p);
    assert_eq!(arena.live_refs_of(p), 1);
    assert!(arena.is_owned(p));

    let returned = arena.restore(prior).unwrap();
    assert_eq!(returned.len(), 128);
    assert_eq!(arena.active_block().capacity, 256);
    assert_eq!(arena.active_live_refs(), 0);
    assert_eq!(arena.inactive_block_count(), 0);
    assert!(!arena.is_owned(q));
}

#[test]
fn test_inactive_block_released_at_zero_refs() {
    let mut arena = Arena::new(128);
    let a = arena.alloc(8).unwrap();
    let b = arena.alloc(8).unwrap();
    assert!(arena.set_active_block(page(128), Exhaustion::Fail).is_none());
    assert_eq!(arena.inactive_block_count(), 1);

    arena.free(a);
    assert_eq!(arena.inactive_block_count(), 1);
    arena.free(b);
    assert_eq!(arena.inactive_block_count(), 0);
    assert!(!arena.is_owned(a));
}

#[test]
fn test_unreferenced_block_is_not_kept() {
    let mut arena = Arena::new(128);
    let a = arena.alloc(8).unwrap();
    arena.free(a);
    let _ = arena.set_active_block(page(128), Exhaustion::Fail);
    assert_eq!(arena.inactive_block_count(), 0);
}

#[test]
#[should_panic(expected = "referenced inactive blocks")]
fn test_dropping_referenced_inactive_block_panics() {
    let mut arena = Arena::new(64);
    let _live = arena.alloc(8).unwrap();
    let _ = arena.set_active_block(page(64), Exhaustion::Fail);
    drop(arena);
}

#[test]
fn test_no_ref_count_policy_tolerates_leaks() {
    let mut arena = Arena::new(64);
    arena.set_policy(AllocatorPolicy::NoRefCount);
    let a = arena.alloc(8).unwrap();
    arena.free(a);
    assert_eq!(arena.live_refs_of(a), 1);
    let _ = arena.set_active_block(page(64), Exhaustion::Fail);
    drop(arena);
}

// ============================================================
// Chunk Allocation
// ============================================================

#[test]
fn test_freed_chunk_is_reused() {
    let mut arena = Arena::new(256);
    let a = arena.alloc(16).unwrap();
    let _b = arena.alloc(16).unwrap();
    let used = arena.bytes_used();
    arena.free(a);
    let c = arena.alloc(16).unwrap();
    assert_eq!(c, a);
    assert_eq!(arena.bytes_used(), used);
}

#[test]
fn test_no_reuse_policy_always_bumps() {
    let mut arena = Arena::new(256);
    arena.set_policy(AllocatorPolicy::NoReuse);
    let a = arena.alloc(16).unwrap();
    arena.free(a);
    let c = arena.alloc(16).unwrap();
    assert_ne!(c, a);
}

#[test]
fn test_exhaustion_modes() {
    let mut arena = Arena::new(64);
    assert!(arena.alloc(100).unwrap_err().to_string().contains("out of arena space"));

    let _ = arena.set_active_block(page(64), Exhaustion::ReturnNull);
    assert_eq!(arena.allocate(100).unwrap(), None);
}

// ============================================================
// Resumable Fill
// ============================================================

/// Bytes an output page needs to hold a map with exactly one short entry.
fn one_entry_page_size() -> usize {
    let mut arena = Arena::new(4096);
    let map = PageMap::<String, i64>::create(&mut arena, 0).unwrap();
    map.upsert(&mut arena, &"a".to_string(), &4).unwrap();
    let one = arena.bytes_used();
    map.upsert(&mut arena, &"b".to_string(), &2).unwrap();
    assert!(arena.bytes_used() > one + 4);
    one
}

fn scenario_input() -> Record {
    let arena = shared(Arena::new(1024));
    partitioned_page(&arena, 4096, &[(0, tuples(&[("a", 1), ("b", 2), ("a", 3)]))]).unwrap()
}

#[test]
fn test_large_output_page_takes_one_fill() {
    let arena = shared(Arena::new(1024));
    let mut agg = PartitionAggregator::<String, i64>::new(arena, 0);
    agg.initialize();
    agg.load_input_page(scenario_input()).unwrap();
    agg.load_output_page(new_page(4096)).unwrap();

    assert!(!agg.fill_next_output_page().unwrap());
    let out = agg.clear_output_page().unwrap();
    assert_eq!(map_contents(&out), reference(&tuples(&[("a", 4), ("b", 2)])));
}

#[test]
fn test_one_entry_output_page_takes_two_fills() {
    let page_size = one_entry_page_size() + 4;
    let arena = shared(Arena::new(1024));
    let mut agg = PartitionAggregator::<String, i64>::new(arena, 0);
    agg.initialize();
    agg.load_input_page(scenario_input()).unwrap();
    agg.load_output_page(new_page(page_size)).unwrap();

    assert!(agg.fill_next_output_page().unwrap());
    assert_eq!(agg.state(), OperatorState::Filling);
    let first = map_contents(&agg.clear_output_page().unwrap());
    assert_eq!(first.len(), 1);

    agg.load_output_page(new_page(page_size)).unwrap();
    assert!(!agg.fill_next_output_page().unwrap());
    let second = map_contents(&agg.clear_output_page().unwrap());
    assert_eq!(second.len(), 1);

    let mut union = first;
    for (k, v) in second {
        assert!(union.insert(k, v).is_none());
    }
    assert_eq!(union, reference(&tuples(&[("a", 4), ("b", 2)])));
}

#[test]
fn test_output_page_too_small_for_empty_map() {
    let arena = shared(Arena::new(1024));
    let mut agg = PartitionAggregator::<String, i64>::new(arena, 0);
    agg.initialize();
    assert!(matches!(
        agg.load_output_page(new_page(64)),
        Err(PageboundError::OutputPageTooSmall { capacity: 64 })
    ));
}

#[test]
fn test_combiner_resumes_across_pages_and_inputs() {
    let arena = shared(Arena::new(1024));
    let inputs: Vec<Record> = (0..3)
        .map(|round| {
            let parts: Vec<(u32, Vec<(String, i64)>)> = (0..3u32)
                .map(|id| (id, (0..20).map(|i| (format!("p{}k{}", id, i), round + 1)).collect()))
                .collect();
            partitioned_page(&arena, 16384, &parts).unwrap()
        })
        .collect();

    let mut combiner = CrossPartitionCombiner::<String, i64>::new(arena.clone(), vec![2, 0]);
    let records = drive(&mut combiner, inputs, 1024).unwrap();
    assert!(records.len() > 1);
    assert_eq!(combiner.state(), OperatorState::Done);

    let mut local: Vec<HashMap<String, i64>> = vec![HashMap::new(), HashMap::new()];
    for record in &records {
        for (i, map) in record.partitioned::<String, i64>().unwrap().maps().enumerate() {
            for entry in map.unwrap().iter() {
                let (k, v) = entry.unwrap();
                *local[i].entry(k).or_insert(0) += v;
            }
        }
    }
    let expected = |id: u32| -> HashMap<String, i64> {
        (0..20).map(|i| (format!("p{}k{}", id, i), 6)).collect()
    };
    assert_eq!(local[0], expected(2));
    assert_eq!(local[1], expected(0));
    assert_eq!(arena.borrow().inactive_block_count(), 0);
}

// ============================================================
// End-to-End Aggregation
// ============================================================

#[test]
fn test_job_with_average_aggregate() {
    let arena = shared(Arena::new(1024));
    let input: Vec<(String, Avg)> = (0..90)
        .map(|i| (format!("g{}", i % 3), Avg::of((i % 3) as f64 * 10.0)))
        .collect();
    let out = run_job(&arena, &JobPlan::single_node(1024, 2), input).unwrap();
    assert_eq!(out.results.len(), 3);
    for (key, avg) in &out.results {
        assert_eq!(avg.count, 30);
        let group: f64 = key[1..].parse().unwrap();
        assert_eq!(avg.mean(), Some(group * 10.0));
    }
}

#[test]
fn test_empty_job() {
    let arena = shared(Arena::new(1024));
    let out = run_job::<String, i64>(&arena, &JobPlan::single_node(1024, 2), Vec::new()).unwrap();
    assert!(out.results.is_empty());
    assert_eq!(out.stats.input_tuples, 0);
}

fn tuple_strategy() -> impl Strategy<Value = Vec<(String, i64)>> {
    prop::collection::vec(("[a-h]{1,3}", -1000i64..1000), 0..200)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_no_loss_no_duplication(
        input in tuple_strategy(),
        page_size in 1024usize..4096,
        partitions in 1u32..=4,
    ) {
        let arena = shared(Arena::new(1024));
        let plan = JobPlan::single_node(page_size, partitions);
        let out = run_job(&arena, &plan, input.clone()).unwrap();
        prop_assert_eq!(out.results, reference(&input));
        prop_assert_eq!(arena.borrow().inactive_block_count(), 0);
    }
}
