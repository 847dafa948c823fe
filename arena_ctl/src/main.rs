//! # Arena Control
//!
//! Operator tool for a shared-memory arena domain: inspect live segments,
//! force a collection pass, clear values and edit the domain configuration.
//!
//! The tool attaches as an ordinary process, so it counts towards
//! `num_procs` while it runs. Configuration edited here is written to the
//! config file by whichever process leaves the domain last.
//!
//! # Usage
//!
//! ```bash
//! # Human-readable overview of the default domain
//! arena_ctl status
//!
//! # Machine-readable snapshot of another domain
//! arena_ctl --prefix plant_ status --json
//!
//! # Remove one keyed value, or everything
//! arena_ctl clear --key setpoint
//! arena_ctl clear
//!
//! # Read and change configuration
//! arena_ctl config show
//! arena_ctl config set share_mode overwrite
//! ```

#![deny(warnings)]

use arena::config::{ConfigUpdate, UserConfig, default_config_path};
use arena::consts::DEFAULT_NAME_PREFIX;
use arena_shared_memory::{Arena, ArenaOptions, DomainStatus};
use clap::{Parser, Subcommand};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::{Level, debug, error, info};
use tracing_subscriber::EnvFilter;

/// Arena Control - inspect and maintain shared-memory arena domains
#[derive(Parser, Debug)]
#[command(name = "arena_ctl")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Inspect and maintain shared-memory arena domains")]
#[command(long_about = None)]
struct Args {
    /// Name prefix of the domain's shared-memory objects
    #[arg(short, long, default_value = DEFAULT_NAME_PREFIX)]
    prefix: String,

    /// Configuration file read on domain creation and written on teardown.
    /// Defaults to $XDG_CONFIG_HOME/shmarena/config.toml.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show domain statistics and every live segment
    Status {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Unlink shared values
    Clear {
        /// Only the value shared under this key
        #[arg(short, long)]
        key: Option<String>,
    },
    /// Run a collection pass and report how many segments it removed
    Gc,
    /// Read or change the domain configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the active configuration as TOML
    Show,
    /// Change a single field, e.g. `gc_enabled false`
    Set {
        /// Field name as it appears in config.toml
        field: String,
        /// New value
        value: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(&args);

    if let Err(e) = run(args) {
        error!("arena_ctl failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = args.config.or_else(default_config_path);
    debug!("Attaching to '{}' (config {:?})", args.prefix, config_path);

    let mut arena: Arena = Arena::attach(ArenaOptions {
        name_prefix: args.prefix,
        config_path,
    })?;

    match args.command {
        Command::Status { json } => {
            let status = arena.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", render_status(&status));
            }
        }
        Command::Clear { key: Some(key) } => {
            arena.clear_key(&key)?;
            info!("Cleared '{}'", key);
            println!("cleared '{key}'");
        }
        Command::Clear { key: None } => {
            let removed = arena.clear()?;
            info!("Cleared {} segments", removed);
            println!("cleared {removed} segment(s)");
        }
        Command::Gc => {
            let collected = arena.gc()?;
            println!("collected {collected} segment(s)");
        }
        Command::Config(ConfigCommand::Show) => {
            print!("{}", render_config(&arena.config()?)?);
        }
        Command::Config(ConfigCommand::Set { field, value }) => {
            let mut update = ConfigUpdate::default();
            update.set_field(&field, &value)?;
            let config = arena.set_config(&update)?;
            info!("Set {} = {}", field, value);
            print!("{}", render_config(&config)?);
        }
    }
    Ok(())
}

fn render_config(config: &UserConfig) -> Result<String, toml::ser::Error> {
    toml::to_string(config)
}

/// Plain-text report: domain summary followed by one row per segment.
fn render_status(status: &DomainStatus) -> String {
    let mut out = String::new();
    let owner = if status.lock_owner_pid == 0 {
        "-".to_string()
    } else {
        status.lock_owner_pid.to_string()
    };
    let _ = writeln!(out, "domain      {}", status.prefix);
    let _ = writeln!(out, "revision    {}", status.rev_num);
    let _ = writeln!(out, "processes   {}", status.num_procs);
    let _ = writeln!(
        out,
        "segments    {} / {}",
        status.num_valid_segments, status.config.max_segments
    );
    let _ = writeln!(
        out,
        "bytes       {} / {}",
        status.total_shared_size, status.config.max_shared_size
    );
    let _ = writeln!(out, "lock owner  {}", owner);
    if status.has_fatal_error {
        let _ = writeln!(out, "state       POISONED");
    }
    if status.segments.is_empty() {
        let _ = writeln!(out, "\n(no live segments)");
        return out;
    }

    let _ = writeln!(
        out,
        "\n{:>8}  {:>12}  {:>5}  {:>5}  {:<4}  KEY",
        "SEG", "BYTES", "USING", "TRACK", "FLAG"
    );
    for seg in &status.segments {
        let flags = format!(
            "{}{}",
            if seg.persistent { 'P' } else { '-' },
            if seg.fetched_here { 'F' } else { '-' }
        );
        let _ = writeln!(
            out,
            "{:>8}  {:>12}  {:>5}  {:>5}  {:<4}  {}",
            seg.seg_num,
            seg.data_size,
            seg.procs_using,
            seg.procs_tracking,
            flags,
            seg.key.as_deref().unwrap_or("-")
        );
    }
    out
}

fn setup_tracing(args: &Args) {
    let level = if args.verbose { Level::DEBUG } else { Level::WARN };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries command output
    if args.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
