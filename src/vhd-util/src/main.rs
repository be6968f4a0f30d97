//! VHD image utilities.
//!
//! One subcommand per maintenance operation; exit codes are errno-style so
//! scripts can tell ENOENT from EIO. The first fatal error is reported on
//! one line; `check` additionally dumps the offending file's metadata.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "vhd-util", about = "VHD image utilities", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new image.
    Create {
        #[arg(short = 'n', value_name = "FILE")]
        name: PathBuf,
        /// Virtual size in MiB.
        #[arg(short = 's', value_name = "MiB")]
        size: u64,
        /// Reserve: fully-allocated (fixed) image instead of sparse.
        #[arg(short = 'r')]
        reserve: bool,
    },

    /// Snapshot an image into a differencing child.
    Snapshot {
        #[arg(short = 'n', value_name = "CHILD")]
        name: PathBuf,
        #[arg(short = 'p', value_name = "PARENT")]
        parent: PathBuf,
        /// Do not open or link against the parent's metadata.
        #[arg(short = 'm')]
        ignore_parent: bool,
    },

    /// Print image properties.
    Query {
        #[arg(short = 'n', value_name = "FILE")]
        name: PathBuf,
        /// Virtual size in sectors.
        #[arg(short = 'v')]
        virtsize: bool,
        /// Parent path.
        #[arg(short = 'p')]
        parent: bool,
        /// Tapdisk fields (hidden).
        #[arg(short = 'f')]
        fields: bool,
    },

    /// Set a tapdisk field (hidden).
    Set {
        #[arg(short = 'n', value_name = "FILE")]
        name: PathBuf,
        field: String,
        value: u64,
    },

    /// Restore the primary footer and trim trailing garbage.
    Repair {
        #[arg(short = 'n', value_name = "FILE")]
        name: PathBuf,
    },

    /// Allocate and zero-fill every unallocated block.
    Fill {
        #[arg(short = 'n', value_name = "FILE")]
        name: PathBuf,
    },

    /// Print metadata, BAT entries, bitmaps or data.
    Read {
        #[arg(short = 'n', value_name = "FILE")]
        name: PathBuf,
        /// Print footer, header, locators and batmap.
        #[arg(short = 'p')]
        print_headers: bool,
        /// Print the BAT entry for a block.
        #[arg(short = 't', value_name = "BLK")]
        bat: Option<u32>,
        /// Summarise the bitmap of a block.
        #[arg(short = 'b', value_name = "BLK")]
        bitmap: Option<u32>,
        /// Hex-dump data starting at a sector (needs -c).
        #[arg(short = 'd', value_name = "SECTOR")]
        data: Option<u64>,
        /// Sector count for -d.
        #[arg(short = 'c', value_name = "SECS", default_value_t = 1)]
        count: u32,
    },

    /// Validate an image (and optionally its ancestors).
    Check {
        #[arg(short = 'n', value_name = "FILE")]
        name: PathBuf,
        /// Tolerate a missing primary footer.
        #[arg(short = 'i')]
        ignore_footer: bool,
        /// Ignore parent uuids.
        #[arg(short = 'I')]
        ignore_parent_uuids: bool,
        /// Ignore timestamps.
        #[arg(short = 't')]
        ignore_timestamps: bool,
        /// Check parents recursively.
        #[arg(short = 'p')]
        parents: bool,
        /// Verify zeroes under clear bitmap bits.
        #[arg(short = 'b')]
        check_data: bool,
        /// Skip the BAT overlap scan.
        #[arg(short = 'B')]
        no_check_bat: bool,
        /// Collect allocation statistics across the chain.
        #[arg(short = 's')]
        stats: bool,
    },

    /// Fold a child's sectors into its parent.
    Coalesce {
        #[arg(short = 'n', value_name = "CHILD")]
        name: PathBuf,
    },

    /// Change the virtual size (within the existing BAT's capacity).
    Resize {
        #[arg(short = 'n', value_name = "FILE")]
        name: PathBuf,
        /// New virtual size in MiB.
        #[arg(short = 's', value_name = "MiB")]
        size: u64,
    },

    /// One-line summary per image.
    Scan {
        #[arg(value_name = "FILE", required = true)]
        names: Vec<PathBuf>,
    },

    /// Roll journalled bitmaps back into an image.
    Revert {
        #[arg(short = 'n', value_name = "FILE")]
        name: PathBuf,
        #[arg(short = 'j', value_name = "JOURNAL")]
        journal: PathBuf,
    },

    /// Re-point a differencing image at a new parent.
    Modify {
        #[arg(short = 'n', value_name = "FILE")]
        name: PathBuf,
        #[arg(short = 'p', value_name = "PARENT")]
        parent: PathBuf,
    },

    /// Journalled bitmap-ordering update for tap 0.1 images.
    Update {
        #[arg(short = 'n', value_name = "FILE")]
        name: PathBuf,
        #[arg(short = 'j', value_name = "JOURNAL")]
        journal: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let res = match cli.command {
        Command::Create {
            name,
            size,
            reserve,
        } => commands::create(&name, size, reserve),
        Command::Snapshot {
            name,
            parent,
            ignore_parent,
        } => commands::snapshot(&name, &parent, ignore_parent),
        Command::Query {
            name,
            virtsize,
            parent,
            fields,
        } => commands::query(&name, virtsize, parent, fields),
        Command::Set { name, field, value } => commands::set(&name, &field, value),
        Command::Repair { name } => commands::repair(&name),
        Command::Fill { name } => commands::fill(&name),
        Command::Read {
            name,
            print_headers,
            bat,
            bitmap,
            data,
            count,
        } => commands::read(&name, print_headers, bat, bitmap, data, count),
        Command::Check {
            name,
            ignore_footer,
            ignore_parent_uuids,
            ignore_timestamps,
            parents,
            check_data,
            no_check_bat,
            stats,
        } => commands::check(
            &name,
            vhdfmt::check::CheckOpts {
                ignore_footer,
                ignore_parent_uuid: ignore_parent_uuids,
                ignore_timestamps,
                check_data,
                no_check_bat,
                collect_stats: stats,
                check_parents: parents,
            },
        ),
        Command::Coalesce { name } => commands::coalesce(&name),
        Command::Resize { name, size } => commands::resize(&name, size),
        Command::Scan { names } => commands::scan(&names),
        Command::Revert { name, journal } => commands::revert(&name, &journal),
        Command::Modify { name, parent } => commands::modify(&name, &parent),
        Command::Update { name, journal } => commands::update(&name, journal.as_deref()),
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("vhd-util: {}", e.message);
            ExitCode::from((e.errno as i32).clamp(1, 255) as u8)
        }
    }
}
