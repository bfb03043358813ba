use std::collections::HashSet;

use crate::arena::{AllocatorPolicy, BLOCK_HEADER_SIZE};
use crate::cli::Args;
use crate::error::{PageboundError, Result};
use crate::pipeline::JobPlan;

/// Runtime configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct JobConfig {
    pub page_size: usize,
    pub num_partitions: u32,
    pub node_partitions: Vec<u32>,
    pub policy: AllocatorPolicy,
    pub block_size: usize,
    pub debug: bool,
    pub record_delimiter: u8,
    pub field_separator: Option<u8>,
    pub output_file: Option<String>,
    pub input_files: Vec<String>,
}

impl JobConfig {
    /// Build configuration from parsed CLI arguments
    pub fn from_args(args: &Args) -> Result<Self> {
        if args.page_size < BLOCK_HEADER_SIZE {
            return Err(invalid(format!(
                "page size {} is smaller than the {} byte block header",
                args.page_size, BLOCK_HEADER_SIZE
            )));
        }
        if args.block_size < BLOCK_HEADER_SIZE {
            return Err(invalid(format!(
                "block size {} is smaller than the {} byte block header",
                args.block_size, BLOCK_HEADER_SIZE
            )));
        }
        if args.partitions == 0 {
            return Err(invalid("at least one partition is required".into()));
        }

        let node_partitions = if args.node_partitions.is_empty() {
            (0..args.partitions).collect()
        } else {
            args.node_partitions.clone()
        };
        let mut seen = HashSet::new();
        for &id in &node_partitions {
            if id >= args.partitions {
                return Err(invalid(format!(
                    "node partition {} is out of range for {} partitions",
                    id, args.partitions
                )));
            }
            if !seen.insert(id) {
                return Err(invalid(format!("node partition {} is listed twice", id)));
            }
        }

        Ok(JobConfig {
            page_size: args.page_size,
            num_partitions: args.partitions,
            node_partitions,
            policy: args.policy.into(),
            block_size: args.block_size,
            debug: args.debug,
            record_delimiter: args.record_delimiter(),
            field_separator: args.field_separator()?,
            output_file: args.output.clone(),
            input_files: args.files.clone(),
        })
    }

    /// Page and partition layout handed to the pipeline
    pub fn plan(&self) -> JobPlan {
        JobPlan {
            page_size: self.page_size,
            num_partitions: self.num_partitions,
            node_partitions: self.node_partitions.clone(),
        }
    }
}

fn invalid(reason: String) -> PageboundError {
    PageboundError::InvalidConfig(reason)
}
