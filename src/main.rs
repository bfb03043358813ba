use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};

use clap::Parser;
use log::debug;

use pagebound::arena::{Exhaustion, thread_arena};
use pagebound::cli::Args;
use pagebound::config::JobConfig;
use pagebound::error::Result;
use pagebound::{input, output, pipeline};

/// Set up SIGPIPE handling for Unix systems
/// This prevents "broken pipe" errors when output is piped to commands like `head`
#[cfg(unix)]
fn setup_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

#[cfg(not(unix))]
fn setup_sigpipe() {
    // Windows doesn't have SIGPIPE
}

fn main() {
    setup_sigpipe();
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("pagebound: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config = JobConfig::from_args(&args)?;

    // Read tuples from files or stdin
    let tuples = if config.input_files.is_empty() {
        let reader = BufReader::new(io::stdin().lock());
        input::read_tuples(reader, config.record_delimiter, config.field_separator)?
    } else {
        let mut all_tuples = Vec::new();
        for path in &config.input_files {
            let reader: Box<dyn BufRead> = if path == "-" {
                Box::new(BufReader::new(io::stdin().lock()))
            } else {
                Box::new(BufReader::new(File::open(path)?))
            };
            let mut file_tuples =
                input::read_tuples(reader, config.record_delimiter, config.field_separator)?;
            debug!("read {} tuples from {}", file_tuples.len(), path);
            all_tuples.append(&mut file_tuples);
        }
        all_tuples
    };

    let arena = thread_arena();
    {
        let mut arena = arena.borrow_mut();
        arena.set_policy(config.policy);
        let _ = arena.set_active_block(vec![0u8; config.block_size].into_boxed_slice(), Exhaustion::Fail);
    }

    let job = pipeline::run_job(&arena, &config.plan(), tuples)?;

    // Debug output: stage and arena summary
    if config.debug {
        let stderr = io::stderr();
        let mut stderr = stderr.lock();
        pagebound::debug::debug_job(&mut stderr, &job.stats, &arena.borrow())?;
        stderr.flush()?;
    }

    let results = output::sorted_results(job.results);
    let mut out = output::open_output(&config)?;
    output::write_results(&mut out, &results, &config)?;

    Ok(())
}
