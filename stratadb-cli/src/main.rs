//! strata - inspect and maintain StrataDB shard folders

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use stratadb_core::config::STEPS_IN_BIGGEST_FILE;
use stratadb_core::domain::{Domain, DomainConfig, FileKind};
use stratadb_core::kv::MemDb;
use stratadb_core::seg::Decompressor;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "strata", version, about = "Inspect and maintain StrataDB shard folders")]
struct Args {
    /// JSON file with a domain configuration; flags override its fields
    #[arg(long, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// Shard directory
    #[arg(long, env = "STRATA_DIR")]
    dir: Option<PathBuf>,

    /// Shard file name prefix
    #[arg(long)]
    base: Option<String>,

    /// Transaction numbers per step
    #[arg(long)]
    step: Option<u64>,

    /// Open values files only
    #[arg(long)]
    no_history: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List registered shards
    Ls {
        /// Print one JSON object per shard
        #[arg(long)]
        json: bool,
    },
    /// Print the words of a shard data file
    Dump {
        /// Path to a .kv, .v or .ef file
        path: PathBuf,
        /// Stop after this many words
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Read a key from the shard files
    Get {
        /// Key in hex
        key: String,
        /// Read the value as of just before this txNum
        #[arg(long)]
        before: Option<u64>,
    },
    /// Merge shards until no merge range remains
    Merge {
        /// Widest merged shard, in steps
        #[arg(long, default_value_t = STEPS_IN_BIGGEST_FILE)]
        max_steps: u64,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("strata: error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    execute(&Args::parse())
}

fn execute(args: &Args) -> Result<()> {
    match &args.command {
        Command::Dump { path, limit } => dump(path, *limit),
        Command::Ls { json } => ls(&open_domain(args)?, *json),
        Command::Get { key, before } => get(&open_domain(args)?, key, *before),
        Command::Merge { max_steps } => merge(&open_domain(args)?, *max_steps),
    }
}

fn open_domain(args: &Args) -> Result<Domain> {
    let config = load_config(args)?;
    Domain::open(config).context("Could not open domain")
}

fn load_config(args: &Args) -> Result<DomainConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Cannot read config file: {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Invalid config file: {}", path.display()))?
        }
        None => DomainConfig::default(),
    };
    if let Some(dir) = &args.dir {
        config.dir = dir.clone();
    }
    if let Some(base) = &args.base {
        config.filename_base = base.clone();
    }
    if let Some(step) = args.step {
        config.aggregation_step = step;
    }
    if args.no_history {
        config.with_history = false;
    }
    if !config.dir.is_dir() {
        bail!("Shard directory does not exist: {}", config.dir.display());
    }
    Ok(config)
}

fn ls(domain: &Domain, as_json: bool) -> Result<()> {
    let visible: Vec<_> = domain.make_context().values_files().to_vec();
    for kind in [FileKind::Values, FileKind::History, FileKind::Index] {
        for item in domain.files(kind) {
            let live = kind != FileKind::Values || visible.iter().any(|v| v.same_range(&item));
            if as_json {
                let line = json!({
                    "kind": kind.to_string(),
                    "path": item.decompressor.path(),
                    "start_tx_num": item.start_tx_num,
                    "end_tx_num": item.end_tx_num,
                    "keys": item.key_count(),
                    "bytes": item.size(),
                    "visible": live,
                });
                println!("{}", line);
            } else {
                println!(
                    "{:<8} [{:>12}, {:>12}) {:>10} keys {:>12} bytes{}  {}",
                    kind,
                    item.start_tx_num,
                    item.end_tx_num,
                    item.key_count(),
                    item.size(),
                    if live { "" } else { " (covered)" },
                    item.decompressor.path().display()
                );
            }
        }
    }
    if as_json {
        println!("{}", serde_json::to_string(&domain.stats())?);
    }
    Ok(())
}

fn dump(path: &Path, limit: Option<usize>) -> Result<()> {
    let decompressor =
        Decompressor::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut getter = decompressor.make_getter();
    getter.reset(0);

    let limit = limit.unwrap_or(usize::MAX);
    let mut count = 0;
    while getter.has_next() && count < limit {
        match getter.next()? {
            Some(word) => println!("{}", hex::encode(word)),
            None => println!("<nil>"),
        }
        count += 1;
    }
    info!("Dumped {} of {} words", count, decompressor.word_count());
    Ok(())
}

fn get(domain: &Domain, key: &str, before: Option<u64>) -> Result<()> {
    let key = hex::decode(key.trim_start_matches("0x")).context("Key must be hex")?;
    let db = MemDb::new(domain.config().tables.table_config());
    let tx = db.begin_ro();
    let dc = domain.make_context();

    let value = match before {
        Some(tx_num) => dc.get_before_tx_num(&key, tx_num, &tx)?,
        None => dc.get_latest(&key, &[], &tx)?,
    };
    match value {
        Some(value) => println!("{}", hex::encode(value)),
        None => println!("<not found>"),
    }
    Ok(())
}

fn merge(domain: &Domain, max_steps: u64) -> Result<()> {
    let max_end = domain.end_tx_num_minimax();
    let max_span = domain.aggregation_step() * max_steps;

    let mut merges = 0;
    loop {
        let r = domain.find_merge_range(max_end, max_span);
        if !r.any() {
            break;
        }
        let dc = domain.make_context();
        let (values, index, history) = dc.static_files_in_range(&r)?;
        let merged = domain.merge_files(&values, &index, &history, &r)?;
        domain.integrate_merged_files(&values, &index, &history, merged);
        merges += 1;
    }

    info!("Finished {} merges up to txNum {}", merges, max_end);
    println!("{}", serde_json::to_string(&domain.stats())?);
    Ok(())
}
