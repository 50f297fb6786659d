//! fleetsync: mirrors a directory tree between a local filesystem and a
//! local path or a remote daemon instance.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;

use fleetsync::client::{self, RunOptions};
use fleetsync::compare::SyncOptions;
use fleetsync::logger::{Level, Logger};
use fleetsync::{config, daemon};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Directory synchronization over a framed TCP protocol",
    after_help = "Remote operands take the form [password@]host[:port]/instance.\n\
                  With -c <config> and no operands, runs as a daemon."
)]
struct Args {
    /// Run as a daemon using the given config file
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Source path or remote instance
    source: Option<String>,

    /// Target path or remote instance
    target: Option<String>,

    /// Delete extraneous files from the target
    #[arg(short, long)]
    delete: bool,

    /// Overwrite every target file unconditionally
    #[arg(short, long)]
    overwrite: bool,

    /// Compare file contents by checksum
    #[arg(short = 's', long)]
    checksum: bool,

    /// Compress the wire stream
    #[arg(short = 'z', long)]
    compress: bool,

    /// Restore mtime and mode on the destination
    #[arg(short, long)]
    archive: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Number of transfer workers
    #[arg(short, long, default_value_t = 1)]
    threads: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(config_path) = &args.config {
        if args.source.is_some() || args.target.is_some() {
            bail!("daemon mode takes no positional arguments");
        }
        let cfg = config::load(config_path)?;
        let log = Arc::new(Logger::from_target(
            &cfg.log_file,
            Level::parse(&cfg.log_level),
            "main",
        ));
        log.info("starting fleetsync daemon");
        return daemon::run(cfg, log);
    }

    let (Some(source), Some(target)) = (&args.source, &args.target) else {
        bail!("expected <source> and <target> operands (or -c <config> for daemon mode)");
    };

    let log = Arc::new(Logger::stdout(Level::Info, ""));
    client::run(
        source,
        target,
        RunOptions {
            sync: SyncOptions {
                delete: args.delete,
                overwrite: args.overwrite,
                checksum: args.checksum,
                compress: args.compress,
                archive: args.archive,
            },
            threads: args.threads,
            verbose: args.verbose,
        },
        log,
    )
}
