//! Single-node aggregation job
//!
//! Runs raw tuples through every stage with fixed-size pages:
//! shuffle sink, cross-partition combiner, one aggregator per node-local
//! partition, then the materializer. Keys that spilled across output pages
//! are folded back together with `combine` at the end.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use log::{debug, info};

use crate::aggregate::Aggregate;
use crate::aggregator::PartitionAggregator;
use crate::arena::SharedArena;
use crate::codec::PageCodec;
use crate::combiner::CrossPartitionCombiner;
use crate::error::Result;
use crate::materializer::ResultMaterializer;
use crate::operator::{drive, new_page};
use crate::record::Record;
use crate::shuffle::{ShuffleSink, partition_of};

/// Shape of one job: page size and partition layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobPlan {
    pub page_size: usize,
    pub num_partitions: u32,
    /// Cluster partitions hosted on this node, in local-id order.
    pub node_partitions: Vec<u32>,
}

impl JobPlan {
    /// A plan whose node hosts every partition.
    pub fn single_node(page_size: usize, num_partitions: u32) -> Self {
        Self {
            page_size,
            num_partitions,
            node_partitions: (0..num_partitions).collect(),
        }
    }
}

/// Pages and bytes produced by one stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageStats {
    pub pages: usize,
    pub bytes: usize,
}

impl StageStats {
    fn of(records: &[Record]) -> Self {
        Self {
            pages: records.len(),
            bytes: records.iter().map(Record::used_bytes).sum(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobStats {
    pub input_tuples: usize,
    /// Tuples routed to partitions this node does not host.
    pub foreign_tuples: usize,
    pub shuffle: StageStats,
    pub combine: StageStats,
    pub aggregate: StageStats,
    pub materialize: StageStats,
    pub distinct_keys: usize,
}

impl fmt::Display for JobStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "tuples: {} ({} foreign), distinct keys: {}",
            self.input_tuples, self.foreign_tuples, self.distinct_keys
        )?;
        writeln!(f, "{:<12} {:>6} {:>10}", "stage", "pages", "bytes")?;
        for (name, stage) in [
            ("shuffle", self.shuffle),
            ("combine", self.combine),
            ("aggregate", self.aggregate),
            ("materialize", self.materialize),
        ] {
            writeln!(f, "{:<12} {:>6} {:>10}", name, stage.pages, stage.bytes)?;
        }
        Ok(())
    }
}

pub struct JobOutput<K, V> {
    pub results: HashMap<K, V>,
    pub stats: JobStats,
}

/// Hash-partition `tuples` into pages of `plan.num_partitions` maps.
pub fn shuffle<K, V>(arena: &SharedArena, plan: &JobPlan, mut tuples: Vec<(K, V)>) -> Result<Vec<Record>>
where
    K: PageCodec + Hash + Eq,
    V: Aggregate,
{
    let mut sink = ShuffleSink::new(Rc::clone(arena), plan.num_partitions);
    let mut pages = Vec::new();
    sink.load_output_page(new_page(plan.page_size))?;
    while sink.write_out(&mut tuples)? {
        pages.extend(sink.clear_output_page().map(|r| r.to_compact()));
        sink.load_output_page(new_page(plan.page_size))?;
    }
    pages.extend(sink.clear_output_page().map(|r| r.to_compact()));
    Ok(pages)
}

/// Run the whole job over `tuples` using `arena` for every stage.
pub fn run_job<K, V>(arena: &SharedArena, plan: &JobPlan, tuples: Vec<(K, V)>) -> Result<JobOutput<K, V>>
where
    K: PageCodec + Hash + Eq,
    V: Aggregate,
{
    let mut stats = JobStats {
        input_tuples: tuples.len(),
        ..JobStats::default()
    };
    let hosted: HashSet<u32> = plan.node_partitions.iter().copied().collect();
    stats.foreign_tuples = tuples
        .iter()
        .filter(|(k, _)| !hosted.contains(&partition_of(k, plan.num_partitions)))
        .count();

    let shuffled = shuffle(arena, plan, tuples)?;
    stats.shuffle = StageStats::of(&shuffled);
    debug!("shuffle produced {} pages", shuffled.len());

    let mut combiner = CrossPartitionCombiner::<K, V>::new(Rc::clone(arena), plan.node_partitions.clone());
    let combined = drive(&mut combiner, shuffled, plan.page_size)?;
    stats.combine = StageStats::of(&combined);
    debug!("combiner produced {} pages", combined.len());

    let mut aggregated = Vec::new();
    for local in 0..plan.node_partitions.len() as u32 {
        let mut aggregator = PartitionAggregator::<K, V>::new(Rc::clone(arena), local);
        aggregated.extend(drive(&mut aggregator, combined.iter().cloned(), plan.page_size)?);
    }
    stats.aggregate = StageStats::of(&aggregated);
    debug!("aggregators produced {} pages", aggregated.len());

    let mut materializer = ResultMaterializer::<K, V>::new(Rc::clone(arena));
    let flattened = drive(&mut materializer, aggregated, plan.page_size)?;
    stats.materialize = StageStats::of(&flattened);

    let mut results: HashMap<K, V> = HashMap::new();
    for page in &flattened {
        for pair in page.pairs::<K, V>()?.iter() {
            let (key, value) = pair?;
            match results.get_mut(&key) {
                Some(acc) => *acc = acc.combine(&value),
                None => {
                    results.insert(key, value);
                }
            }
        }
    }
    stats.distinct_keys = results.len();
    info!(
        "job finished: {} tuples, {} distinct keys, {} result pages",
        stats.input_tuples, stats.distinct_keys, stats.materialize.pages
    );
    Ok(JobOutput { results, stats })
}
