//! punzip - parallel ZIP extractor.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use pzip::{extract, ExtractorOptions, ZipReader};

#[derive(Parser)]
#[command(name = "punzip")]
#[command(about = "Parallel ZIP extractor")]
struct Cli {
    /// Extract into this directory (default: current directory)
    #[arg(short = 'd', long = "directory", default_value = ".")]
    directory: PathBuf,

    /// Number of decompress threads (default: all CPU cores)
    #[arg(short, long, default_value_t = 0)]
    concurrency: usize,

    /// Overwrite existing files
    #[arg(short = 'o', long = "overwrite", conflicts_with = "no_overwrite")]
    overwrite: bool,

    /// Never overwrite existing files
    #[arg(short = 'n', long = "no-overwrite")]
    no_overwrite: bool,

    /// Show per-file progress
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all non-error output
    #[arg(short, long)]
    quiet: bool,

    /// List entries and exit
    #[arg(short = 'l', long = "list")]
    list: bool,

    /// Archive to extract
    archive: PathBuf,
}

fn list_archive(archive: &PathBuf) -> ExitCode {
    let reader = match ZipReader::open(archive) {
        Ok(reader) => reader,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    println!("  length      name");
    println!("--------      ----");
    let mut total = 0u64;
    for entry in reader.entries() {
        println!("{:>8}      {}", entry.header.uncompressed_size, entry.header.name);
        total += entry.header.uncompressed_size;
    }
    println!("--------");
    println!("{:>8}      {} entries", total, reader.entries().len());

    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if cli.list {
        return list_archive(&cli.archive);
    }

    if std::fs::symlink_metadata(&cli.archive).is_err() {
        eprintln!("error: no such file: {}", cli.archive.display());
        return ExitCode::FAILURE;
    }

    let options = ExtractorOptions {
        concurrency: cli.concurrency,
        overwrite: cli.overwrite || !cli.no_overwrite,
        preserve_permissions: true,
        progress: if cli.verbose && !cli.quiet {
            Some(Box::new(|current, total| {
                eprint!("\rextracting: {current}/{total}");
            }))
        } else {
            None
        },
    };

    if !cli.quiet {
        println!(
            "extracting {} to {}",
            cli.archive.display(),
            cli.directory.display()
        );
    }

    let start = Instant::now();
    if let Err(err) = extract(&cli.archive, &cli.directory, options) {
        eprintln!("\nerror: {err}");
        return ExitCode::FAILURE;
    }

    if !cli.quiet {
        if cli.verbose {
            eprintln!();
        }
        println!("done in {:.1}s", start.elapsed().as_secs_f64());
    }

    ExitCode::SUCCESS
}
