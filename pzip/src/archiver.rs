//! Parallel archive creation.
//!
//! Paths are walked on the calling thread and fanned out to a compress
//! pool (one worker per hardware thread by default); finished tasks flow
//! into a single-worker writer pool that serializes them into the ZIP
//! file. Both queues are bounded at twice the compress concurrency, which
//! caps the number of 2 MiB scratch buffers in flight.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use pzip_deflate::{CompressionLevel, FlateWriter};
use walkdir::WalkDir;

use crate::error::{PzipError, Result};
use crate::header::{
    EntryKind, ExtendedTimestamp, ZIP_FLAG_DATA_DESCRIPTOR, ZIP_FLAG_UTF8, ZIP_METHOD_DEFLATE,
    ZIP_METHOD_STORE, ZIP_VERSION_20,
};
use crate::task::{FileTask, FileTaskPool, READ_BUFFER_SIZE};
use crate::util;
use crate::writer::ZipWriter;
use crate::ProgressCallback;

pub struct ArchiverOptions {
    /// Compress workers; zero means one per hardware thread.
    pub concurrency: usize,
    pub compression_level: u32,
    pub progress: Option<ProgressCallback>,
}

impl Default for ArchiverOptions {
    fn default() -> Self {
        Self {
            concurrency: 0,
            compression_level: 1,
            progress: None,
        }
    }
}

struct ArchiveContext {
    writer: ZipWriter,
    task_pool: FileTaskPool,
    cancelled: AtomicBool,
    total_files: AtomicU64,
    processed_files: AtomicU64,
    level: CompressionLevel,
    progress: Option<ProgressCallback>,
}

type TaskQueue = crate::pool::WorkerPool<Box<FileTask>>;

pub struct Archiver {
    archive_path: PathBuf,
    ctx: Arc<ArchiveContext>,
    compress_pool: Arc<TaskQueue>,
    writer_pool: Arc<TaskQueue>,
}

impl Archiver {
    pub fn new(archive: &Path, options: ArchiverOptions) -> Self {
        Self::with_task_pool(archive, options, FileTaskPool::new())
    }

    pub fn with_task_pool(
        archive: &Path,
        options: ArchiverOptions,
        task_pool: FileTaskPool,
    ) -> Self {
        let concurrency = if options.concurrency == 0 {
            num_cpus::get()
        } else {
            options.concurrency
        };
        let queue_capacity = concurrency * 2;

        let ctx = Arc::new(ArchiveContext {
            writer: ZipWriter::new(archive),
            task_pool,
            cancelled: AtomicBool::new(false),
            total_files: AtomicU64::new(0),
            processed_files: AtomicU64::new(0),
            level: CompressionLevel::new(options.compression_level),
            progress: options.progress,
        });

        let writer_pool = {
            let ctx = Arc::clone(&ctx);
            Arc::new(TaskQueue::new(
                Box::new(move |task| archive_file(&ctx, task)),
                1,
                queue_capacity,
            ))
        };

        let compress_pool = {
            let ctx = Arc::clone(&ctx);
            let writer_pool = Arc::clone(&writer_pool);
            Arc::new(TaskQueue::new(
                Box::new(move |task| compress_file(&ctx, &writer_pool, task)),
                concurrency,
                queue_capacity,
            ))
        };

        Self {
            archive_path: archive.to_path_buf(),
            ctx,
            compress_pool,
            writer_pool,
        }
    }

    /// Walks the inputs and drives both pools to completion. The archive
    /// stays open so callers can inspect state before `close`.
    pub fn archive(&self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            if std::fs::symlink_metadata(path).is_err() {
                return Err(PzipError::FileNotFound(path.display().to_string()));
            }
        }

        self.ctx.writer.open()?;

        // Identity of the output file, to skip it during the walk.
        let archive_id = std::fs::metadata(&self.archive_path)
            .map(|m| (m.dev(), m.ino()))
            .ok();

        self.compress_pool.start();
        self.writer_pool.start();

        let walk_result = self.enqueue_paths(paths, archive_id);
        if walk_result.is_err() {
            self.compress_pool.cancel();
            self.writer_pool.cancel();
        }

        let compress_result = self.compress_pool.close();
        let writer_result = self.writer_pool.close();

        walk_result?;
        compress_result?;
        writer_result?;

        if self.ctx.cancelled.load(Ordering::SeqCst) {
            return Err(PzipError::Cancelled);
        }
        Ok(())
    }

    fn enqueue_paths(&self, paths: &[PathBuf], archive_id: Option<(u64, u64)>) -> Result<()> {
        for path in paths {
            if self.ctx.cancelled.load(Ordering::SeqCst) {
                break;
            }

            let meta = std::fs::symlink_metadata(path)
                .map_err(|_| PzipError::FileNotFound(path.display().to_string()))?;

            if meta.is_dir() {
                self.walk_directory(path, archive_id)?;
            } else {
                let mut task = self.ctx.task_pool.acquire();
                task.reset(path, None)?;
                if is_archive_itself(&task, archive_id) {
                    self.ctx.task_pool.release(task);
                    continue;
                }
                self.ctx.total_files.fetch_add(1, Ordering::SeqCst);
                self.compress_pool.enqueue(task);
            }
        }
        Ok(())
    }

    fn walk_directory(&self, root: &Path, archive_id: Option<(u64, u64)>) -> Result<()> {
        let chroot = std::fs::canonicalize(root)
            .map_err(|_| PzipError::FileNotFound(root.display().to_string()))?;
        let base = chroot.parent().map(Path::to_path_buf);

        for entry in WalkDir::new(&chroot).follow_links(false) {
            if self.ctx.cancelled.load(Ordering::SeqCst) {
                break;
            }
            let entry =
                entry.map_err(|e| PzipError::FileRead(format!("walking {}: {e}", root.display())))?;

            let mut task = self.ctx.task_pool.acquire();
            if task.reset(entry.path(), base.as_deref()).is_err() {
                // A file that vanished mid-walk is skipped, not fatal.
                self.ctx.task_pool.release(task);
                continue;
            }
            if is_archive_itself(&task, archive_id) {
                self.ctx.task_pool.release(task);
                continue;
            }

            self.ctx.total_files.fetch_add(1, Ordering::SeqCst);
            self.compress_pool.enqueue(task);
        }

        Ok(())
    }

    pub fn cancel(&self) {
        self.ctx.cancelled.store(true, Ordering::SeqCst);
        self.compress_pool.cancel();
        self.writer_pool.cancel();
    }

    /// Finalizes the archive (central directory and end records).
    pub fn close(&self) -> Result<()> {
        if self.ctx.writer.is_open()? {
            return self.ctx.writer.close();
        }
        Ok(())
    }

    pub fn total_files(&self) -> u64 {
        self.ctx.total_files.load(Ordering::SeqCst)
    }

    pub fn processed_files(&self) -> u64 {
        self.ctx.processed_files.load(Ordering::SeqCst)
    }
}

fn is_archive_itself(task: &FileTask, archive_id: Option<(u64, u64)>) -> bool {
    let Some((dev, ino)) = archive_id else {
        return false;
    };
    if let Ok(meta) = task.metadata() {
        if meta.dev() == dev && meta.ino() == ino {
            return true;
        }
    }
    // Identity comparison resolves symlinks, so a link pointing at the
    // output file is the output file.
    if task.kind == EntryKind::Symlink {
        if let Ok(meta) = std::fs::metadata(&task.path) {
            return meta.dev() == dev && meta.ino() == ino;
        }
    }
    false
}

/// Compress-pool executor: fills the task's scratch with the compressed
/// payload, finishes the header, and hands the task to the writer pool.
fn compress_file(
    ctx: &ArchiveContext,
    writer_pool: &TaskQueue,
    mut task: Box<FileTask>,
) -> Result<()> {
    if ctx.cancelled.load(Ordering::SeqCst) {
        ctx.task_pool.release(task);
        return Err(PzipError::Cancelled);
    }

    compress(ctx, &mut task)?;
    populate_header(&mut task);

    writer_pool.enqueue(task);
    Ok(())
}

fn compress(ctx: &ArchiveContext, task: &mut FileTask) -> Result<()> {
    match task.kind {
        EntryKind::Directory => Ok(()),
        EntryKind::Symlink => {
            let target = std::mem::take(&mut task.symlink_target);
            task.write_compressed(&target)
                .map_err(|e| PzipError::write(&task.path, e))?;
            task.header.crc32 = crc32fast::hash(&target);
            task.symlink_target = target;
            Ok(())
        }
        EntryKind::Regular => {
            let path = task.path.clone();
            let mut file = File::open(&path).map_err(|e| PzipError::open(&path, e))?;

            let expected = task.file_size;
            let level = ctx.level;
            let mut crc = crc32fast::Hasher::new();
            let mut total_read = 0u64;

            let mut writer = FlateWriter::new(&mut *task, level);
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                let n = file.read(&mut buf).map_err(|e| PzipError::read(&path, e))?;
                if n == 0 {
                    break;
                }
                crc.update(&buf[..n]);
                writer
                    .write_all(&buf[..n])
                    .map_err(|e| PzipError::write(&path, e))?;
                total_read += n as u64;
            }
            writer.finish().map_err(|e| PzipError::write(&path, e))?;

            // A file shrinking mid-read must not silently truncate.
            if total_read != expected {
                return Err(PzipError::FileRead(format!(
                    "{}: short read, expected {expected} bytes, got {total_read}",
                    path.display()
                )));
            }

            task.header.crc32 = crc.finalize();
            Ok(())
        }
    }
}

/// Fills the remaining header fields once the payload is known.
fn populate_header(task: &mut FileTask) {
    let written = task.written();
    let h = &mut task.header;

    let (valid_utf8, requires_utf8) = util::detect_utf8(h.name.as_bytes());
    if requires_utf8 && valid_utf8 {
        h.flags |= ZIP_FLAG_UTF8;
    }

    h.version_made_by = (3 << 8) | ZIP_VERSION_20; // Unix, ZIP 2.0
    h.version_needed = ZIP_VERSION_20;

    let ext = ExtendedTimestamp {
        mod_time: task.mod_time,
    };
    h.extra.extend_from_slice(&ext.encode());

    let (mod_date, mod_time) = util::unix_to_dos(task.mod_time);
    h.mod_date = mod_date;
    h.mod_time = mod_time;

    match task.kind {
        EntryKind::Directory => {
            if !h.name.ends_with('/') {
                h.name.push('/');
            }
            h.method = ZIP_METHOD_STORE;
            h.flags &= !ZIP_FLAG_DATA_DESCRIPTOR;
            h.uncompressed_size = 0;
            h.compressed_size = 0;
            h.crc32 = 0;
        }
        EntryKind::Symlink => {
            h.method = ZIP_METHOD_STORE;
            h.flags &= !ZIP_FLAG_DATA_DESCRIPTOR;
            h.uncompressed_size = task.symlink_target.len() as u64;
            h.compressed_size = task.symlink_target.len() as u64;
            h.external_attr = util::mode_to_zip_attr(libc::S_IFLNK as u32 | 0o777);
        }
        EntryKind::Regular => {
            h.method = ZIP_METHOD_DEFLATE;
            h.flags |= ZIP_FLAG_DATA_DESCRIPTOR;
            h.uncompressed_size = task.file_size;
            h.compressed_size = written;
        }
    }
}

/// Writer-pool executor (single worker): streams the task's scratch into
/// the archive and recycles the task.
fn archive_file(ctx: &ArchiveContext, mut task: Box<FileTask>) -> Result<()> {
    if ctx.cancelled.load(Ordering::SeqCst) {
        ctx.task_pool.release(task);
        return Err(PzipError::Cancelled);
    }

    let header = task.header.clone();
    let result = ctx
        .writer
        .create_raw(&header, |sink| task.read_compressed(sink));

    let processed = ctx.processed_files.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(progress) = &ctx.progress {
        progress(processed, ctx.total_files.load(Ordering::SeqCst));
    }

    ctx.task_pool.release(task);
    result
}
