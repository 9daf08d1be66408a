//! Parallel ZIP archiver and extractor.
//!
//! Compression fans file tasks out to a bounded worker pool; each worker
//! streams its file through the [`pzip_deflate`] encoder into a 2 MiB
//! scratch buffer (spilling to disk past that), and a single writer
//! thread serializes finished tasks into a valid, possibly-ZIP64 archive.
//! Extraction parses the central directory and decompresses entries in
//! parallel.
//!
//! ```no_run
//! use pzip::{compress, extract, ArchiverOptions, ExtractorOptions};
//!
//! compress(
//!     "backup.zip".as_ref(),
//!     &["photos".into(), "notes.txt".into()],
//!     ArchiverOptions::default(),
//! )?;
//! extract(
//!     "backup.zip".as_ref(),
//!     "restored".as_ref(),
//!     ExtractorOptions::default(),
//! )?;
//! # Ok::<(), pzip::PzipError>(())
//! ```

mod archiver;
mod error;
mod extractor;
mod header;
mod pool;
mod reader;
mod task;
mod util;
mod writer;

pub use archiver::{Archiver, ArchiverOptions};
pub use error::{PzipError, Result};
pub use extractor::{Extractor, ExtractorOptions};
pub use header::{
    EntryKind, ExtendedTimestamp, ZipFileHeader, ZIP_FLAG_DATA_DESCRIPTOR, ZIP_FLAG_UTF8,
    ZIP_METHOD_DEFLATE, ZIP_METHOD_STORE,
};
pub use pool::{Executor, WorkerPool};
pub use reader::{ZipEntry, ZipReader};
pub use task::{FileTask, FileTaskPool};
pub use util::{detect_utf8, dos_to_unix, unix_to_dos};
pub use writer::ZipWriter;

use std::path::{Path, PathBuf};

/// Called with `(processed, total)` after each entry is written.
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Archives `paths` into `archive` and finalizes it.
pub fn compress(archive: &Path, paths: &[PathBuf], options: ArchiverOptions) -> Result<()> {
    let archiver = Archiver::new(archive, options);
    archiver.archive(paths)?;
    archiver.close()
}

/// Expands `archive` under `output_dir`.
pub fn extract(archive: &Path, output_dir: &Path, options: ExtractorOptions) -> Result<()> {
    let mut extractor = Extractor::new(output_dir, options);
    extractor.extract(archive)
}
