use ferret_core::config::FerretConfig;
use ferret_core::corpus::load_seed_files;
use ferret_core::fuzzer::Fuzzer;
use ferret_core::manager::{DiskManager, InMemoryManager, Manager};
use ferret_core::sim::{SimChoiceTable, SimEnv, SimModel};
use ferret_core::sink::OutputMode;
use ferret_core::stats::Stat;
use ferret_core::worker::Worker;

use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Number of parallel workers.
    #[clap(short, long)]
    procs: Option<usize>,
    /// Iterations per worker. Runs until a fatal error when unset.
    #[clap(short, long)]
    iterations: Option<u64>,
    /// Where executed programs are mirrored: none, stdout, dmesg or file.
    #[clap(short, long)]
    output: Option<OutputMode>,
    /// Identity reported to the manager.
    #[clap(short, long)]
    name: Option<String>,
    /// Store reported inputs in this directory instead of memory.
    #[clap(long)]
    report_dir: Option<PathBuf>,
    /// Seed program file or directory; may be repeated.
    #[clap(long = "seed")]
    seeds: Vec<PathBuf>,
    /// Log verbosity: -v for debug, -vv for trace.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn load_config(cli: &Cli) -> Result<FerretConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            FerretConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                info!("No config file specified via CLI, loading default: {default_config_path:?}");
                FerretConfig::load_from_file(&default_config_path)?
            } else {
                info!(
                    "No config file specified and default 'config.toml' not found, using built-in defaults."
                );
                FerretConfig::default()
            }
        }
    };

    if let Some(procs) = cli.procs {
        config.fuzzer.procs = procs;
    }
    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_iterations = Some(iterations);
    }
    if let Some(output) = cli.output {
        config.fuzzer.output = output;
    }
    if let Some(name) = &cli.name {
        config.fuzzer.name = name.clone();
    }
    if let Some(dir) = &cli.report_dir {
        config.corpus.report_dir = Some(dir.clone());
    }
    config.corpus.seed_paths.extend(cli.seeds.iter().cloned());
    if config.fuzzer.procs == 0 {
        anyhow::bail!("procs must be at least 1");
    }
    Ok(config)
}

fn report_stats(fuzzer: &Fuzzer<SimModel>, start: Instant) {
    let stats = fuzzer.stats().snapshot();
    let elapsed = start.elapsed().as_secs_f64();
    let exec_per_sec = if elapsed > 0.0 {
        stats.total() as f64 / elapsed
    } else {
        0.0
    };
    let fresh = fuzzer.signal().take_new();
    info!(
        "corpus: {}, signal: {}/{}, new since last report: {}, execs: {} ({:.1}/sec), queue: {}",
        fuzzer.corpus().len(),
        fuzzer.signal().corpus_len(),
        fuzzer.signal().max_len(),
        fresh.len(),
        stats.total(),
        exec_per_sec,
        fuzzer.work_queue().len()
    );
    info!("{stats}");
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = load_config(&cli)?;
    info!("Effective configuration: {config:#?}");

    let manager: Arc<dyn Manager> = match &config.corpus.report_dir {
        Some(dir) => {
            info!("Storing reported inputs in {dir:?}");
            Arc::new(DiskManager::new(dir.clone())?)
        }
        None => Arc::new(InMemoryManager::new()),
    };

    let fuzzer = Arc::new(Fuzzer::from_config(
        SimModel::new(),
        SimChoiceTable::uniform(),
        manager,
        &config,
    ));

    if !config.corpus.seed_paths.is_empty() {
        let seeds = load_seed_files(&config.corpus.seed_paths)?;
        let total = seeds.len();
        let queued = fuzzer.enqueue_seeds(seeds, false);
        info!("Queued {queued} of {total} seed programs as candidates");
    }

    info!(
        "Starting {} workers ({})",
        config.fuzzer.procs,
        config
            .fuzzer
            .max_iterations
            .map_or("unbounded".to_string(), |n| format!("{n} iterations each"))
    );
    let start = Instant::now();
    let stats_interval = Duration::from_secs(config.fuzzer.stats_interval_secs.max(1));
    let backoff = Duration::from_millis(config.executor.retry_backoff_ms);

    std::thread::scope(|s| {
        let (done_tx, done_rx) = mpsc::channel::<()>();

        for pid in 0..config.fuzzer.procs {
            let fuzzer = Arc::clone(&fuzzer);
            let config = &config;
            let done_tx = done_tx.clone();
            s.spawn(move || {
                let env = SimEnv::new(&config.executor.sim);
                let mut worker = Worker::new(fuzzer, pid, env)
                    .with_retry_policy(config.executor.max_retries, backoff);
                let result = match config.fuzzer.max_iterations {
                    Some(n) => worker.run_for(n),
                    None => worker.run(),
                };
                if let Err(e) = result {
                    error!("worker {pid} failed: {e}");
                    std::process::exit(1);
                }
                drop(done_tx);
            });
        }
        drop(done_tx);

        let fuzzer = Arc::clone(&fuzzer);
        s.spawn(move || {
            loop {
                match done_rx.recv_timeout(stats_interval) {
                    Err(RecvTimeoutError::Timeout) => report_stats(&fuzzer, start),
                    Ok(()) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
    });

    let elapsed_total = start.elapsed();
    info!("Fuzz loop finished in {elapsed_total:.2?}.");
    report_stats(&fuzzer, start);
    info!(
        "Programs executed: {} generated, {} mutated, {} from candidates",
        fuzzer.stats().get(Stat::Generate),
        fuzzer.stats().get(Stat::Fuzz),
        fuzzer.stats().get(Stat::Candidate)
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_config() {
        let cli = Cli::parse_from([
            "ferret",
            "--config-file",
            "/nonexistent/ferret.toml",
            "-p",
            "3",
            "-i",
            "50",
            "--output",
            "stdout",
            "--seed",
            "a",
            "--seed",
            "b",
            "-vv",
        ]);
        assert_eq!(cli.procs, Some(3));
        assert_eq!(cli.output, Some(OutputMode::Stdout));
        assert_eq!(cli.seeds, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(cli.verbose, 2);
        assert!(load_config(&cli).is_err());
    }

    #[test]
    fn config_file_is_overridden_and_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[fuzzer]\nprocs = 2\nname = \"vm9\"\n").unwrap();
        let cli = Cli::parse_from(["ferret", "-c", path.to_str().unwrap(), "-n", "vm1"]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.fuzzer.procs, 2);
        assert_eq!(config.fuzzer.name, "vm1");

        let cli = Cli::parse_from(["ferret", "-c", path.to_str().unwrap(), "-p", "0"]);
        assert!(load_config(&cli).is_err());
    }
}
