//! PS2 memory card CLI - inspect and convert cards from the host side.
//!
//! Usage:
//!   ps2mcd <command> [args]
//!
//! Examples:
//!   ps2mcd info Mcd001                     # Geometry and free space of a folder card
//!   ps2mcd ls Mcd001 --filter SLUS-20001   # Entries visible to one game
//!   ps2mcd export Mcd001 -o Mcd001.ps2     # Raw image of a folder card
//!   ps2mcd format NewCard --size-mb 16     # Empty formatted folder card
//!   ps2mcd convert dump.bin dump.ps2       # Add ECC to a bare page dump

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mcd_core::folder::superblock::CLUSTER_SIZE;
use mcd_core::{
    convert_no_ecc_to_raw, convert_raw_to_no_ecc, format_folder, FolderMemoryCard,
    FolderOpenOptions, McdResult,
};

/// PS2 memory card tool
#[derive(Parser, Debug)]
#[command(name = "ps2mcd")]
#[command(about = "Inspect, export and convert PS2 memory cards")]
struct Args {
    /// Log card activity at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the geometry and free space of a folder card
    Info {
        folder: PathBuf,
    },
    /// List the entries a folder card exposes
    Ls {
        folder: PathBuf,

        /// Only index directories matching these `/`-separated fragments
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Write a folder card out as a raw image, ECC included
    Export {
        folder: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },
    /// Turn a directory into an empty formatted folder card
    Format {
        folder: PathBuf,

        #[arg(long, default_value_t = 8)]
        size_mb: u32,
    },
    /// Convert between bare 512-byte page dumps and raw images
    Convert {
        input: PathBuf,
        output: PathBuf,

        /// Strip ECC from a raw image instead of adding it
        #[arg(long)]
        strip_ecc: bool,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> McdResult<()> {
    match command {
        Command::Info { folder } => info(&folder),
        Command::Ls { folder, filter } => ls(&folder, filter),
        Command::Export { folder, output } => {
            let mut card = open_read_only(&folder, None)?;
            card.export_image(&output)?;
            println!("Exported {} to {}", folder.display(), output.display());
            Ok(())
        }
        Command::Format { folder, size_mb } => {
            let clusters = size_mb * 1024 * 1024 / CLUSTER_SIZE as u32;
            format_folder(&folder, clusters)?;
            println!("Formatted {} ({size_mb} MiB)", folder.display());
            Ok(())
        }
        Command::Convert {
            input,
            output,
            strip_ecc,
        } => {
            if strip_ecc {
                convert_raw_to_no_ecc(&input, &output)
            } else {
                convert_no_ecc_to_raw(&input, &output)
            }
        }
    }
}

/// Open a folder card without ever touching the host folder.
fn open_read_only(folder: &Path, filter: Option<String>) -> McdResult<FolderMemoryCard> {
    let mut card = FolderMemoryCard::new(0);
    card.open(
        folder,
        FolderOpenOptions {
            filtering: filter.is_some(),
            filter: filter.unwrap_or_default(),
            simulate_file_writes: true,
            ..Default::default()
        },
    )?;
    Ok(card)
}

fn info(folder: &Path) -> McdResult<()> {
    let card = open_read_only(folder, None)?;
    let sb = card.superblock();

    println!("Folder:      {}", folder.display());
    if !card.is_formatted() {
        println!("Formatted:   no");
        return Ok(());
    }
    println!("Formatted:   yes");
    println!("Clusters:    {}", card.size_in_clusters());
    println!("Alloc:       offset {} end {}", sb.alloc_offset, sb.alloc_end);
    println!(
        "Backups:     blocks {} and {}",
        sb.backup_block1, sb.backup_block2
    );
    println!("Entries:     {}", card.list_entries().len());
    println!(
        "Free:        {} clusters ({} KiB)",
        card.amount_free_data_clusters(),
        card.amount_free_data_clusters() as usize * CLUSTER_SIZE / 1024
    );
    Ok(())
}

fn ls(folder: &Path, filter: Option<String>) -> McdResult<()> {
    let card = open_read_only(folder, filter)?;
    for (path, entry) in card.list_entries() {
        let t = entry.time_modified;
        println!(
            "{} {:#06x} {:>8} {:04}-{:02}-{:02} {:02}:{:02} {path}",
            if entry.is_dir() { 'd' } else { '-' },
            entry.mode,
            entry.length,
            t.year,
            t.month,
            t.day,
            t.hour,
            t.minute,
        );
    }
    Ok(())
}
