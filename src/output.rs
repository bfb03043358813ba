use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};

use crate::config::JobConfig;

/// Order results by key bytes
pub fn sorted_results(results: HashMap<String, i64>) -> Vec<(String, i64)> {
    let mut sorted: Vec<(String, i64)> = results.into_iter().collect();
    sorted.sort_unstable_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    sorted
}

/// Write `key\tvalue` records
pub fn write_results<W: Write>(
    writer: W,
    results: &[(String, i64)],
    config: &JobConfig,
) -> io::Result<()> {
    let mut writer = BufWriter::new(writer);
    for (key, value) in results {
        write!(writer, "{}\t{}", key, value)?;
        writer.write_all(&[config.record_delimiter])?;
    }
    writer.flush()
}

/// Open output file or return stdout
pub fn open_output(config: &JobConfig) -> io::Result<Box<dyn Write>> {
    match &config.output_file {
        Some(path) => {
            let file = File::create(path)?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(io::stdout())),
    }
}
