use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::commands::{do_fix_bench, do_map, do_pool_bench};

mod backing;
mod commands;
mod logger;

/// User-level mmap demos and page pool benchmarks
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Most verbose log level printed to stderr
    #[clap(long, global = true)]
    #[clap(default_value_t = LogLevel::Info)]
    #[arg(value_enum)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: SubCommands,
}

#[derive(Subcommand)]
enum SubCommands {
    /// Map a region and touch it so every page faults in.
    Map(MapArgs),
    /// Compare the page pool with the system allocator.
    PoolBench(PoolBenchArgs),
    /// Compare fix/unfix with side-table and embedded page states.
    FixBench(FixBenchArgs),
}

#[derive(Args)]
struct MapArgs {
    /// number of pages to map
    pages: usize,

    /// back the region with this file instead of anonymous memory
    #[clap(short, long)]
    file: Option<PathBuf>,

    /// byte offset into the backing file
    #[clap(short, long)]
    #[clap(default_value_t = 0)]
    offset: u64,

    /// pause between touches, in milliseconds
    #[clap(long)]
    #[clap(default_value_t = 0)]
    delay: u64,
}

#[derive(Args)]
struct PoolBenchArgs {
    /// pages across all shards, committed up front
    #[clap(long)]
    #[clap(default_value_t = 524288)]
    total_pages: usize,

    /// allocations per thread and round
    #[clap(long)]
    #[clap(default_value_t = 10000)]
    ops: usize,

    /// thread counts to run with
    #[clap(long, value_delimiter = ',')]
    #[clap(default_value = "4,8,16,32")]
    threads: Vec<usize>,

    /// largest shard count; runs go 2, 4, ... up to it
    #[clap(long)]
    #[clap(default_value_t = 32)]
    max_shards: usize,
}

#[derive(Args)]
struct FixBenchArgs {
    /// data file, created when missing
    #[clap(long)]
    #[clap(default_value = "fix_bench_data")]
    data_file: PathBuf,

    /// pages in the data file
    #[clap(long)]
    #[clap(default_value_t = 1000000)]
    pages: usize,

    /// fix/unfix operations per layout
    #[clap(short = 'n', long)]
    #[clap(default_value_t = 1000000)]
    ops: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init(cli.log_level.into());

    match cli.command {
        SubCommands::Map(args) => do_map(args),
        SubCommands::PoolBench(args) => do_pool_bench(args),
        SubCommands::FixBench(args) => do_fix_bench(args),
    }
}
