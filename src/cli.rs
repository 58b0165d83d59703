//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Fetch URLs through a cached, prioritized request queue.
///
/// Each URL is fetched once per invocation; repeated URLs share one network
/// call and cached responses are served from the disk cache while fresh.
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to fetch
    pub urls: Vec<String>,

    /// Config file (defaults to $XDG_CONFIG_HOME/courier/config.toml when present)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Network workers (1-64), overrides the config file
    #[arg(short = 'w', long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub workers: Option<u8>,

    /// Maximum retries for transient failures (0-10), overrides the config file
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Disk cache directory, overrides the config file
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Do not read or write the disk cache
    #[arg(long, conflicts_with = "cache_dir")]
    pub no_cache: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
