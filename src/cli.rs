use clap::{Parser, ValueEnum};

use crate::arena::AllocatorPolicy;
use crate::error::{PageboundError, Result};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "pagebound",
    about = "Sum integer values per key using fixed-size memory pages"
)]
pub struct Args {
    /// Size of every output page in bytes
    #[arg(short = 'p', long = "page-size", value_name = "BYTES", default_value_t = 4096)]
    pub page_size: usize,

    /// Number of hash partitions tuples are shuffled into
    #[arg(short = 'n', long = "partitions", value_name = "N", default_value_t = 4)]
    pub partitions: u32,

    /// Partitions hosted on this node (default: all of them)
    #[arg(long = "node-partitions", value_name = "IDS", value_delimiter = ',')]
    pub node_partitions: Vec<u32>,

    /// Size of the arena's initial block in bytes
    #[arg(long = "block-size", value_name = "BYTES", default_value_t = 1024)]
    pub block_size: usize,

    /// Chunk reuse policy of the arena
    #[arg(long, value_enum, default_value_t = PolicyArg::Reuse)]
    pub policy: PolicyArg,

    /// Use SEP between key and value instead of trailing whitespace
    #[arg(short = 't', long = "field-separator", value_name = "SEP")]
    pub delimiter: Option<String>,

    /// Use NUL as line delimiter
    #[arg(short = 'z', long = "zero-terminated")]
    pub zero_terminated: bool,

    /// Write result to FILE instead of stdout
    #[arg(short = 'o', long, value_name = "FILE")]
    pub output: Option<String>,

    /// Print page and arena summaries to stderr
    #[arg(long)]
    pub debug: bool,

    /// Input files
    #[arg(value_name = "FILE")]
    pub files: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    Reuse,
    NoReuse,
    NoRefCount,
}

impl From<PolicyArg> for AllocatorPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Reuse => AllocatorPolicy::Reuse,
            PolicyArg::NoReuse => AllocatorPolicy::NoReuse,
            PolicyArg::NoRefCount => AllocatorPolicy::NoRefCount,
        }
    }
}

impl Args {
    /// Parse -t argument, handling backslash escapes
    pub fn field_separator(&self) -> Result<Option<u8>> {
        let Some(s) = &self.delimiter else {
            return Ok(None);
        };
        if s == "\\0" || s == "\0" {
            Ok(Some(0u8))
        } else if s.len() == 1 {
            Ok(Some(s.as_bytes()[0]))
        } else if s.starts_with('\\') && s.len() == 2 {
            match s.chars().nth(1) {
                Some('t') => Ok(Some(b'\t')),
                Some('n') => Ok(Some(b'\n')),
                Some('\\') => Ok(Some(b'\\')),
                _ => Err(invalid_separator(s)),
            }
        } else {
            Err(invalid_separator(s))
        }
    }

    /// Get the record delimiter (newline or NUL)
    pub fn record_delimiter(&self) -> u8 {
        if self.zero_terminated { 0u8 } else { b'\n' }
    }
}

fn invalid_separator(s: &str) -> PageboundError {
    PageboundError::InvalidConfig(format!("field separator must be a single byte, got {:?}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("pagebound").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.page_size, 4096);
        assert_eq!(args.partitions, 4);
        assert!(args.node_partitions.is_empty());
        assert_eq!(args.policy, PolicyArg::Reuse);
        assert_eq!(args.field_separator().unwrap(), None);
        assert_eq!(args.record_delimiter(), b'\n');
    }

    #[test]
    fn test_node_partitions_list() {
        let args = parse(&["-n", "8", "--node-partitions", "1,5,7"]);
        assert_eq!(args.node_partitions, vec![1, 5, 7]);
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(parse(&["--policy", "no-reuse"]).policy, PolicyArg::NoReuse);
        assert_eq!(
            AllocatorPolicy::from(parse(&["--policy", "no-ref-count"]).policy),
            AllocatorPolicy::NoRefCount
        );
    }

    #[test]
    fn test_field_separator_escapes() {
        assert_eq!(parse(&["-t", "\\t"]).field_separator().unwrap(), Some(b'\t'));
        assert_eq!(parse(&["-t", ","]).field_separator().unwrap(), Some(b','));
        assert!(parse(&["-t", "ab"]).field_separator().is_err());
    }
}
