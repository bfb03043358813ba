//! Page-bounded aggregation over a reference-counted arena
//!
//! Operators consume and produce fixed-size pages. Every page is an arena
//! block holding a root object (a map, a vector of maps, or a vector of
//! key/value pairs) addressed by block-relative offsets, so a finished page
//! can be copied out and reopened anywhere.

pub mod aggregate;
pub mod aggregator;
pub mod arena;
pub mod cli;
pub mod codec;
pub mod combiner;
pub mod config;
pub mod debug;
pub mod error;
pub mod input;
pub mod materializer;
pub mod operator;
pub mod output;
pub mod page_map;
pub mod page_vec;
pub mod pipeline;
pub mod record;
pub mod shuffle;

pub use aggregate::{Aggregate, Avg};
pub use aggregator::PartitionAggregator;
pub use arena::{AllocatorPolicy, Arena, ArenaPtr, Exhaustion, SharedArena};
pub use codec::PageCodec;
pub use combiner::CrossPartitionCombiner;
pub use error::{ArenaError, PageboundError, Result};
pub use materializer::ResultMaterializer;
pub use operator::{BoundedOperator, OperatorState, drive};
pub use pipeline::{JobOutput, JobPlan, JobStats, run_job};
pub use record::Record;
pub use shuffle::{ShuffleSink, partition_of};
