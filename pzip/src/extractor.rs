//! Parallel archive extraction.
//!
//! One task per central-directory entry, fanned out to a worker pool.
//! Workers stream-decompress straight to the target file, then restore
//! mode and mtime. Existing targets are silently skipped unless
//! `overwrite` is set.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{PzipError, Result};
use crate::pool::WorkerPool;
use crate::reader::{ZipEntry, ZipReader};
use crate::util;
use crate::ProgressCallback;

pub struct ExtractorOptions {
    /// Decompress workers; zero means one per hardware thread.
    pub concurrency: usize,
    pub overwrite: bool,
    pub preserve_permissions: bool,
    pub progress: Option<ProgressCallback>,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        Self {
            concurrency: 0,
            overwrite: true,
            preserve_permissions: true,
            progress: None,
        }
    }
}

struct ExtractTask {
    entry: ZipEntry,
    output_path: PathBuf,
}

struct ExtractContext {
    reader: ZipReader,
    overwrite: bool,
    preserve_permissions: bool,
    cancelled: Arc<AtomicBool>,
    total_files: u64,
    processed_files: AtomicU64,
    progress: Option<ProgressCallback>,
}

pub struct Extractor {
    output_dir: PathBuf,
    options: ExtractorOptions,
    cancelled: Arc<AtomicBool>,
}

impl Extractor {
    pub fn new(output_dir: &Path, options: ExtractorOptions) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            options,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn extract(&mut self, archive: &Path) -> Result<()> {
        let reader = ZipReader::open(archive)?;

        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| PzipError::write(&self.output_dir, e))?;
        let output_dir = std::fs::canonicalize(&self.output_dir)
            .map_err(|e| PzipError::open(&self.output_dir, e))?;

        let entries: Vec<ZipEntry> = reader.entries().to_vec();
        let total = entries.len() as u64;
        log::debug!("extracting {total} entries to {}", output_dir.display());

        let concurrency = if self.options.concurrency == 0 {
            num_cpus::get()
        } else {
            self.options.concurrency
        };

        let ctx = Arc::new(ExtractContext {
            reader,
            overwrite: self.options.overwrite,
            preserve_permissions: self.options.preserve_permissions,
            cancelled: Arc::clone(&self.cancelled),
            total_files: total,
            processed_files: AtomicU64::new(0),
            progress: self.options.progress.take(),
        });

        let pool = {
            let ctx = Arc::clone(&ctx);
            WorkerPool::new(
                Box::new(move |task| extract_file(&ctx, task)),
                concurrency,
                concurrency * 2,
            )
        };

        pool.start();
        for entry in entries {
            if self.cancelled.load(Ordering::SeqCst) {
                pool.cancel();
                break;
            }
            let output_path = output_dir.join(util::from_zip_path(&entry.header.name));
            pool.enqueue(Box::new(ExtractTask { entry, output_path }));
        }
        pool.close()?;

        if self.cancelled.load(Ordering::SeqCst) {
            return Err(PzipError::Cancelled);
        }
        Ok(())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

fn extract_file(ctx: &ExtractContext, task: Box<ExtractTask>) -> Result<()> {
    if ctx.cancelled.load(Ordering::SeqCst) {
        return Err(PzipError::Cancelled);
    }

    let entry = &task.entry;
    let path = &task.output_path;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PzipError::write(parent, e))?;
    }

    if entry.is_directory() {
        write_directory(ctx, path)?;
        restore_metadata(ctx, entry, path);
    } else if entry.is_symlink() {
        write_symlink(ctx, entry, path)?;
    } else {
        write_file(ctx, entry, path)?;
    }

    let processed = ctx.processed_files.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(progress) = &ctx.progress {
        progress(processed, ctx.total_files);
    }

    Ok(())
}

fn write_directory(ctx: &ExtractContext, path: &Path) -> Result<()> {
    if path.exists() && !path.is_dir() {
        if !ctx.overwrite {
            return Ok(());
        }
        std::fs::remove_file(path).map_err(|e| PzipError::write(path, e))?;
    }
    std::fs::create_dir_all(path).map_err(|e| PzipError::write(path, e))
}

fn write_symlink(ctx: &ExtractContext, entry: &ZipEntry, path: &Path) -> Result<()> {
    // The payload is the link target; its CRC is checked like any other.
    let target = ctx.reader.read_to_vec(entry)?;
    let target = PathBuf::from(String::from_utf8_lossy(&target).into_owned());

    if path.symlink_metadata().is_ok() {
        if !ctx.overwrite {
            return Ok(());
        }
        std::fs::remove_file(path).map_err(|e| PzipError::write(path, e))?;
    }

    std::os::unix::fs::symlink(&target, path).map_err(|e| PzipError::write(path, e))?;

    // chmod on a link would follow the target; only the link's own mtime
    // is restorable.
    util::set_symlink_mod_time(path, entry.mod_time);
    Ok(())
}

fn write_file(ctx: &ExtractContext, entry: &ZipEntry, path: &Path) -> Result<()> {
    if path.exists() && !ctx.overwrite {
        return Ok(());
    }

    let file = File::create(path).map_err(|e| PzipError::open(path, e))?;
    let mut out = BufWriter::new(file);
    ctx.reader.read_into(entry, &mut out)?;
    out.flush().map_err(|e| PzipError::write(path, e))?;
    drop(out);

    restore_metadata(ctx, entry, path);
    Ok(())
}

/// Mode from the attr high bits (when non-zero), then mtime; both are
/// best-effort, matching what unzip tooling does.
fn restore_metadata(ctx: &ExtractContext, entry: &ZipEntry, path: &Path) {
    if ctx.preserve_permissions {
        let mode = util::zip_attr_to_mode(entry.header.external_attr);
        if mode != 0 {
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777));
        }
    }
    util::set_mod_time(path, entry.mod_time);
}
