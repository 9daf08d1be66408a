//! Per-file scratch for the compression pipeline.
//!
//! Compressed bytes land in a fixed 2 MiB buffer; anything past that spills
//! into a temp file. The spill file's lifetime is tied to the task, so it
//! is removed on every exit path, unwinding included.

use std::fs::Metadata;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::NamedTempFile;

use crate::error::{PzipError, Result};
use crate::header::{EntryKind, ZipFileHeader};
use crate::util;

pub(crate) const TASK_BUFFER_SIZE: usize = 2 * 1024 * 1024;
pub(crate) const READ_BUFFER_SIZE: usize = 32 * 1024;
const POOL_CAPACITY: usize = 32;
const OVERFLOW_PREFIX: &str = "pzip-overflow-";

pub struct FileTask {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub file_size: u64,
    pub mod_time: i64,
    pub symlink_target: Vec<u8>,
    pub header: ZipFileHeader,
    buffer: Vec<u8>,
    overflow: Option<NamedTempFile>,
    written: u64,
}

impl FileTask {
    pub fn new() -> Self {
        Self {
            path: PathBuf::new(),
            kind: EntryKind::Regular,
            file_size: 0,
            mod_time: 0,
            symlink_target: Vec::new(),
            header: ZipFileHeader::default(),
            buffer: Vec::with_capacity(TASK_BUFFER_SIZE),
            overflow: None,
            written: 0,
        }
    }

    /// Re-points the task at a new source file and derives its archive
    /// name relative to `relative_to`.
    pub fn reset(&mut self, path: &Path, relative_to: Option<&Path>) -> Result<()> {
        self.buffer.clear();
        self.overflow = None;
        self.written = 0;
        self.symlink_target.clear();
        self.header = ZipFileHeader::default();
        self.path = path.to_path_buf();

        let meta = std::fs::symlink_metadata(path)
            .map_err(|_| PzipError::FileNotFound(path.display().to_string()))?;
        self.mod_time = meta
            .modified()
            .map(util::system_time_to_unix)
            .unwrap_or(0);

        if meta.file_type().is_symlink() {
            self.kind = EntryKind::Symlink;
            let target = std::fs::read_link(path).map_err(|e| PzipError::read(path, e))?;
            use std::os::unix::ffi::OsStrExt;
            self.symlink_target = target.as_os_str().as_bytes().to_vec();
            self.file_size = self.symlink_target.len() as u64;
        } else if meta.file_type().is_dir() {
            self.kind = EntryKind::Directory;
            self.file_size = 0;
        } else {
            self.kind = EntryKind::Regular;
            self.file_size = meta.len();
        }

        let rel = match relative_to {
            Some(base) => path.strip_prefix(base).unwrap_or(path),
            None => Path::new(
                path.file_name()
                    .unwrap_or_else(|| path.as_os_str()),
            ),
        };
        self.header.name = util::to_zip_path(rel);
        if self.kind == EntryKind::Directory && !self.header.name.ends_with('/') {
            self.header.name.push('/');
        }

        self.header.external_attr = util::mode_to_zip_attr(meta.mode());

        Ok(())
    }

    pub(crate) fn metadata(&self) -> io::Result<Metadata> {
        std::fs::symlink_metadata(&self.path)
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn overflowed(&self) -> bool {
        self.overflow.is_some()
    }

    /// Appends compressed output; the spill file is created on the first
    /// byte that does not fit the buffer, and once it exists the buffer is
    /// never grown again.
    pub fn write_compressed(&mut self, mut data: &[u8]) -> io::Result<()> {
        if self.overflow.is_none() {
            let available = TASK_BUFFER_SIZE - self.buffer.len();
            let take = data.len().min(available);
            self.buffer.extend_from_slice(&data[..take]);
            self.written += take as u64;
            data = &data[take..];
        }

        if !data.is_empty() {
            if self.overflow.is_none() {
                let file = tempfile::Builder::new()
                    .prefix(OVERFLOW_PREFIX)
                    .tempfile()?;
                log::debug!(
                    "task {} spilling to {}",
                    self.header.name,
                    file.path().display()
                );
                self.overflow = Some(file);
            }
            if let Some(file) = self.overflow.as_mut() {
                file.as_file_mut().write_all(data)?;
                self.written += data.len() as u64;
            }
        }

        Ok(())
    }

    /// Replays the compressed bytes: buffer first, then the spill file in
    /// 32 KiB chunks from the start.
    pub fn read_compressed(
        &mut self,
        callback: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        if !self.buffer.is_empty() {
            callback(&self.buffer)?;
        }

        if let Some(overflow) = self.overflow.as_mut() {
            let file = overflow.as_file_mut();
            file.seek(SeekFrom::Start(0))
                .map_err(|e| PzipError::FileRead(format!("overflow seek: {e}")))?;

            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                let n = file
                    .read(&mut buf)
                    .map_err(|e| PzipError::FileRead(format!("overflow read: {e}")))?;
                if n == 0 {
                    break;
                }
                callback(&buf[..n])?;
            }
        }

        Ok(())
    }
}

impl Default for FileTask {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for FileTask {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_compressed(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Process-wide free list of tasks; releasing drops the spill file and
/// keeps the 2 MiB buffer allocation for reuse.
#[derive(Clone, Default)]
pub struct FileTaskPool {
    inner: Arc<Mutex<Vec<Box<FileTask>>>>,
}

impl FileTaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> Box<FileTask> {
        let mut pool = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pool.pop().unwrap_or_else(|| Box::new(FileTask::new()))
    }

    pub fn release(&self, mut task: Box<FileTask>) {
        task.buffer.clear();
        task.overflow = None;
        task.written = 0;
        task.symlink_target.clear();

        let mut pool = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if pool.len() < POOL_CAPACITY {
            pool.push(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_writes_stay_in_the_buffer() {
        let mut task = FileTask::new();
        task.write_compressed(b"hello").unwrap();
        task.write_compressed(b" world").unwrap();
        assert_eq!(task.written(), 11);
        assert!(!task.overflowed());

        let mut collected = Vec::new();
        task.read_compressed(&mut |chunk| {
            collected.extend_from_slice(chunk);
            Ok(())
        })
        .unwrap();
        assert_eq!(collected, b"hello world");
    }

    #[test]
    fn writes_past_two_mib_spill_and_replay_in_order() {
        let mut task = FileTask::new();
        let chunk = vec![0xABu8; 700 * 1024];
        for _ in 0..4 {
            task.write_compressed(&chunk).unwrap(); // 2.8 MiB total
        }
        assert!(task.overflowed());
        assert_eq!(task.written(), 4 * 700 * 1024);

        let mut total = 0usize;
        let mut first = true;
        task.read_compressed(&mut |chunk| {
            if first {
                assert_eq!(chunk.len(), TASK_BUFFER_SIZE);
                first = false;
            }
            assert!(chunk.iter().all(|&b| b == 0xAB));
            total += chunk.len();
            Ok(())
        })
        .unwrap();
        assert_eq!(total, 4 * 700 * 1024);
    }

    #[test]
    fn spill_file_disappears_when_the_task_is_released() {
        let pool = FileTaskPool::new();
        let mut task = pool.acquire();
        task.write_compressed(&vec![7u8; TASK_BUFFER_SIZE + 10]).unwrap();
        let spill_path = task
            .overflow
            .as_ref()
            .expect("task should have spilled")
            .path()
            .to_path_buf();
        assert!(spill_path.exists());

        pool.release(task);
        assert!(!spill_path.exists());
    }

    #[test]
    fn pool_reuses_released_tasks_up_to_capacity() {
        let pool = FileTaskPool::new();
        let task = pool.acquire();
        let buffer_ptr = task.buffer.as_ptr();
        pool.release(task);

        let task = pool.acquire();
        assert_eq!(task.buffer.as_ptr(), buffer_ptr);
    }
}
