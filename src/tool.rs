//! `tierkv` command-line front-end.
//!
//! Reads a whitespace-separated operation stream from a file or stdin
//! and applies it to the chosen engine:
//!
//! ```text
//! w <key> <value>    write (alias: s)
//! r <key>            read, prints the value (alias: g)
//! d <key>            delete
//! q                  close the store and quit
//! ```
//!
//! Exits 0 on clean termination, non-zero on error. Logging is
//! controlled by `RUST_LOG`.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tierkv::{
    AppendLog, AppendLogConfig, HashIndexKind, HybridLog, HybridLogConfig, KvStore, LsmTree,
    LsmTreeConfig, StoreError,
};

#[derive(Parser)]
#[command(name = "tierkv", version, about = "Disk-resident key-value store")]
struct Cli {
    /// Path to the data directory.
    #[arg(short = 'd', long = "data-dir", default_value = "./data", global = true)]
    data_dir: PathBuf,

    /// Read the operation stream from this file instead of stdin.
    #[arg(short = 'f', long = "input-file", global = true)]
    input_file: Option<PathBuf>,

    #[command(subcommand)]
    engine: EngineCommand,
}

#[derive(Subcommand)]
enum EngineCommand {
    /// Size-tiered LSM tree (write-optimized).
    Lsmtree {
        /// Max key length in bytes.
        #[arg(long, default_value_t = 255)]
        max_key_len: usize,

        /// Max value length in bytes.
        #[arg(long, default_value_t = 255)]
        max_value_len: usize,

        /// Max runs per level before merging.
        #[arg(long, default_value_t = 3)]
        runs_per_level: usize,

        /// Fence pointer density factor.
        #[arg(long, default_value_t = 20)]
        density_factor: usize,

        /// Memtable byte budget.
        #[arg(long, default_value_t = 1_000_000)]
        memory_limit: usize,
    },

    /// FASTER-style hybrid log (hot working sets).
    Hybridlog {
        /// Max key length in bytes.
        #[arg(long, default_value_t = 255)]
        max_key_len: usize,

        /// Max value length in bytes.
        #[arg(long, default_value_t = 255)]
        max_value_len: usize,

        /// In-memory segment length in records.
        #[arg(long, default_value_t = 1 << 20)]
        memory: u64,

        /// Read-only lag interval in records.
        #[arg(long, default_value_t = 1 << 10)]
        ro_lag: u64,

        /// Flush interval in records.
        #[arg(long, default_value_t = 4 * (1 << 10))]
        flush_interval: u64,

        /// Max runs per level before merging.
        #[arg(long, default_value_t = 3)]
        runs_per_level: usize,

        /// Hash index implementation: dict or native.
        #[arg(long, default_value = "dict")]
        hash_index: String,

        /// Rewrite sealed runs dropping stale records.
        #[arg(long, default_value_t = false)]
        compaction: bool,
    },

    /// Compacted append log (per-record durability).
    Appendlog {
        /// Max key length in bytes.
        #[arg(long, default_value_t = 255)]
        max_key_len: usize,

        /// Max value length in bytes.
        #[arg(long, default_value_t = 255)]
        max_value_len: usize,

        /// Max runs per level before merging.
        #[arg(long, default_value_t = 3)]
        runs_per_level: usize,

        /// Rollover threshold in bytes.
        #[arg(long, default_value_t = 4_000_000)]
        threshold: u64,
    },
}

fn open_engine(cli: &Cli) -> Result<Box<dyn KvStore>, StoreError> {
    let data_dir = cli.data_dir.clone();
    Ok(match &cli.engine {
        EngineCommand::Lsmtree {
            max_key_len,
            max_value_len,
            runs_per_level,
            density_factor,
            memory_limit,
        } => Box::new(LsmTree::open(
            data_dir,
            LsmTreeConfig {
                max_key_len: *max_key_len,
                max_value_len: *max_value_len,
                max_runs_per_level: *runs_per_level,
                density_factor: *density_factor,
                memtable_bytes_limit: *memory_limit,
                replica: None,
            },
        )?),
        EngineCommand::Hybridlog {
            max_key_len,
            max_value_len,
            memory,
            ro_lag,
            flush_interval,
            runs_per_level,
            hash_index,
            compaction,
        } => Box::new(HybridLog::open(
            data_dir,
            HybridLogConfig {
                max_key_len: *max_key_len,
                max_value_len: *max_value_len,
                mem_segment_len: *memory,
                ro_lag_interval: *ro_lag,
                flush_interval: *flush_interval,
                max_runs_per_level: *runs_per_level,
                hash_index: parse_hash_index(hash_index)?,
                compaction_enabled: *compaction,
                replica: None,
            },
        )?),
        EngineCommand::Appendlog {
            max_key_len,
            max_value_len,
            runs_per_level,
            threshold,
        } => Box::new(AppendLog::open(
            data_dir,
            AppendLogConfig {
                max_key_len: *max_key_len,
                max_value_len: *max_value_len,
                max_runs_per_level: *runs_per_level,
                threshold: *threshold,
                replica: None,
            },
        )?),
    })
}

fn parse_hash_index(name: &str) -> Result<HashIndexKind, StoreError> {
    match name {
        "dict" => Ok(HashIndexKind::Dict),
        "native" => Ok(HashIndexKind::Native),
        other => Err(StoreError::InvalidConfig(format!(
            "hash_index must be dict or native, got {other:?}"
        ))),
    }
}

/// Applies the operation stream to the store. Returns `Ok(true)` when a
/// `q` command closed the store, `Ok(false)` at end of input.
fn run(store: &mut dyn KvStore, input: &mut dyn BufRead) -> Result<bool, StoreError> {
    let stdout = io::stdout();
    for line in input.lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        let Some(op) = parts.next() else { continue };
        match (op, parts.next(), parts.next()) {
            ("w" | "s", Some(key), Some(value)) => {
                store.set(key.as_bytes(), value.as_bytes())?;
            }
            ("r" | "g", Some(key), None) => {
                let value = store.get(key.as_bytes())?;
                let mut out = stdout.lock();
                out.write_all(&value)?;
                out.write_all(b"\n")?;
                out.flush()?;
            }
            ("d", Some(key), None) => {
                store.delete(key.as_bytes())?;
            }
            ("q", None, None) => {
                store.close()?;
                return Ok(true);
            }
            _ => eprintln!("malformed command: {line}"),
        }
    }
    Ok(false)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut store = match open_engine(&cli) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("tierkv: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match &cli.input_file {
        Some(path) => match File::open(path) {
            Ok(file) => run(store.as_mut(), &mut BufReader::new(file)),
            Err(e) => {
                eprintln!("tierkv: {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => run(store.as_mut(), &mut io::stdin().lock()),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => match store.close() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("tierkv: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("tierkv: {e}");
            ExitCode::FAILURE
        }
    }
}
