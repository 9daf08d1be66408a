//! pzip - parallel ZIP archiver.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use pzip::{compress, ArchiverOptions};

#[derive(Parser)]
#[command(name = "pzip")]
#[command(about = "Parallel ZIP archiver")]
struct Cli {
    /// Number of compress threads (default: all CPU cores)
    #[arg(short, long, default_value_t = 0)]
    concurrency: usize,

    /// Compression level, 0-9
    #[arg(short = 'l', long, default_value_t = 1)]
    level: u32,

    /// Show per-file progress
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all non-error output
    #[arg(short, long)]
    quiet: bool,

    /// Output archive
    archive: PathBuf,

    /// Files and directories to add
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

fn format_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{size} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn input_size(paths: &[PathBuf]) -> u64 {
    let mut total = 0;
    for path in paths {
        if path.is_dir() {
            for entry in walkdir::WalkDir::new(path).into_iter().flatten() {
                if entry.file_type().is_file() {
                    total += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
            }
        } else if let Ok(meta) = std::fs::symlink_metadata(path) {
            total += meta.len();
        }
    }
    total
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if cli.level > 9 {
        eprintln!("error: compression level must be between 0 and 9");
        return ExitCode::FAILURE;
    }

    for path in &cli.paths {
        if std::fs::symlink_metadata(path).is_err() {
            eprintln!("error: no such file or directory: {}", path.display());
            return ExitCode::FAILURE;
        }
    }

    let options = ArchiverOptions {
        concurrency: cli.concurrency,
        compression_level: cli.level,
        progress: if cli.verbose && !cli.quiet {
            Some(Box::new(|current, total| {
                eprint!("\rcompressing: {current}/{total}");
            }))
        } else {
            None
        },
    };

    if !cli.quiet {
        println!("creating archive: {}", cli.archive.display());
    }

    let start = Instant::now();
    if let Err(err) = compress(&cli.archive, &cli.paths, options) {
        eprintln!("\nerror: {err}");
        return ExitCode::FAILURE;
    }
    let elapsed = start.elapsed().as_secs_f64();

    if !cli.quiet {
        if cli.verbose {
            eprintln!();
        }
        let original = input_size(&cli.paths);
        let archived = std::fs::metadata(&cli.archive).map(|m| m.len()).unwrap_or(0);
        println!("original size: {}", format_size(original));
        println!("archive size:  {}", format_size(archived));
        if original > 0 {
            let ratio = 100.0 * (1.0 - archived as f64 / original as f64);
            println!("space saved:   {ratio:.1}%");
            if elapsed > 0.0 {
                let speed = original as f64 / elapsed / (1024.0 * 1024.0);
                println!("done in {elapsed:.1}s ({speed:.1} MB/s)");
            }
        }
    }

    ExitCode::SUCCESS
}
