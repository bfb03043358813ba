use std::io::{self, Write};

use crate::arena::{Arena, BlockInfo};
use crate::pipeline::JobStats;

fn write_block<W: Write>(writer: &mut W, label: &str, info: &BlockInfo) -> io::Result<()> {
    writeln!(
        writer,
        "{:<9} base={:#x} used={}/{} refs={} root={}",
        label, info.base, info.used, info.capacity, info.live_refs, info.root_offset
    )
}

/// Summarize a finished job: per-stage pages and the arena's block state.
pub fn debug_job<W: Write>(writer: &mut W, stats: &JobStats, arena: &Arena) -> io::Result<()> {
    write!(writer, "{}", stats)?;
    writeln!(writer, "arena policy: {:?}", arena.policy())?;
    write_block(writer, "active", &arena.active_block())?;
    writeln!(
        writer,
        "inactive blocks: {}, bytes used: {}, bytes available: {}",
        arena.inactive_block_count(),
        arena.bytes_used(),
        arena.bytes_available()
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_job_lists_stages_and_arena() {
        let arena = Arena::new(256);
        let stats = JobStats {
            input_tuples: 5,
            distinct_keys: 2,
            ..JobStats::default()
        };
        let mut output = Vec::new();
        debug_job(&mut output, &stats, &arena).unwrap();
        let output_str = String::from_utf8(output).unwrap();
        assert!(output_str.contains("tuples: 5"));
        assert!(output_str.contains("shuffle"));
        assert!(output_str.contains("used=20/256"));
        assert!(output_str.contains("inactive blocks: 0"));
    }
}
