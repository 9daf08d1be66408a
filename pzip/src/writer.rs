//! ZIP archive writer.
//!
//! One mutex guards the output file, the running offset and the central
//! directory list; `create_raw` holds it for the full duration of one
//! entry so the single writer thread is the only effective user. Entries
//! land in the central directory in completion order.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{PzipError, Result};
use crate::header::{
    ZipFileHeader, CENTRAL_DIR_HEADER_SIG, DATA_DESCRIPTOR_SIG, EOCD_SIG, EXTRA_ID_ZIP64,
    LOCAL_FILE_HEADER_SIG, ZIP64_EOCD_LOCATOR_SIG, ZIP64_EOCD_SIG, ZIP_FLAG_DATA_DESCRIPTOR,
    ZIP_UINT16_MAX, ZIP_UINT32_MAX, ZIP_VERSION_45,
};

const WRITE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub(crate) struct CentralDirEntry {
    pub(crate) header: ZipFileHeader,
    pub(crate) local_header_offset: u64,
}

struct WriterInner {
    file: Option<BufWriter<File>>,
    offset: u64,
    entries: Vec<CentralDirEntry>,
}

pub struct ZipWriter {
    path: PathBuf,
    inner: Mutex<WriterInner>,
}

impl ZipWriter {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            inner: Mutex::new(WriterInner {
                file: None,
                offset: 0,
                entries: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, WriterInner>> {
        self.inner
            .lock()
            .map_err(|_| PzipError::Unknown("zip writer mutex poisoned".to_string()))
    }

    pub fn open(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.file.is_some() {
            return Err(PzipError::FileOpen(format!(
                "{}: already open",
                self.path.display()
            )));
        }
        let file = File::create(&self.path).map_err(|e| PzipError::open(&self.path, e))?;
        inner.file = Some(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file));
        inner.offset = 0;
        inner.entries.clear();
        Ok(())
    }

    pub fn is_open(&self) -> Result<bool> {
        Ok(self.lock()?.file.is_some())
    }

    /// Emits a complete entry: local header, the provider's compressed
    /// payload, and a data descriptor when the header asks for one. The
    /// central-directory record is queued under the same lock, which fixes
    /// the archive order.
    pub fn create_raw<F>(&self, header: &ZipFileHeader, provider: F) -> Result<()>
    where
        F: FnOnce(&mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()>,
    {
        let mut inner = self.lock()?;
        if inner.file.is_none() {
            return Err(PzipError::FileOpen("archive is not open".to_string()));
        }

        let local_header_offset = inner.offset;
        inner.write_local_header(header, &self.path)?;

        {
            let inner = &mut *inner;
            let path = &self.path;
            provider(&mut |data: &[u8]| {
                if let Some(file) = inner.file.as_mut() {
                    file.write_all(data).map_err(|e| PzipError::write(path, e))?;
                    inner.offset += data.len() as u64;
                }
                Ok(())
            })?;
        }

        if header.flags & ZIP_FLAG_DATA_DESCRIPTOR != 0 {
            inner.write_data_descriptor(header, &self.path)?;
        }

        inner.entries.push(CentralDirEntry {
            header: header.clone(),
            local_header_offset,
        });

        Ok(())
    }

    /// Writes the central directory and end records, then closes the file.
    /// A second close is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.file.is_none() {
            return Ok(());
        }

        let cd_offset = inner.offset;
        inner.write_central_directory(&self.path)?;
        let cd_size = inner.offset - cd_offset;
        inner.write_end_of_central_directory(cd_offset, cd_size, &self.path)?;

        if let Some(mut file) = inner.file.take() {
            file.flush().map_err(|e| PzipError::write(&self.path, e))?;
        }
        log::debug!(
            "archive {} closed: {} entries, {} bytes",
            self.path.display(),
            inner.entries.len(),
            inner.offset
        );
        Ok(())
    }
}

impl WriterInner {
    fn write_record(&mut self, buf: &[u8], path: &Path) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf).map_err(|e| PzipError::write(path, e))?;
            self.offset += buf.len() as u64;
        }
        Ok(())
    }

    fn write_local_header(&mut self, header: &ZipFileHeader, path: &Path) -> Result<()> {
        let buf = encode_local_header(header);
        self.write_record(&buf, path)
    }

    fn write_data_descriptor(&mut self, header: &ZipFileHeader, path: &Path) -> Result<()> {
        let buf = encode_data_descriptor(header);
        self.write_record(&buf, path)
    }

    fn write_central_directory(&mut self, path: &Path) -> Result<()> {
        let entries = std::mem::take(&mut self.entries);
        for entry in &entries {
            let buf = encode_central_header(entry);
            self.write_record(&buf, path)?;
        }
        self.entries = entries;
        Ok(())
    }

    fn write_end_of_central_directory(
        &mut self,
        cd_offset: u64,
        cd_size: u64,
        path: &Path,
    ) -> Result<()> {
        let records = self.entries.len() as u64;
        let zip64_eocd_offset = self.offset;
        let buf = encode_end_records(records, cd_offset, cd_size, zip64_eocd_offset);
        self.write_record(&buf, path)
    }
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Local header. With the data-descriptor flag set the CRC and sizes are
/// written as zero; otherwise ZIP64 entries carry sentinel sizes (the real
/// values live in the central directory's ZIP64 extra).
pub(crate) fn encode_local_header(header: &ZipFileHeader) -> Vec<u8> {
    let name = header.name.as_bytes();
    let mut buf = Vec::with_capacity(30 + name.len() + header.extra.len());

    put_u32(&mut buf, LOCAL_FILE_HEADER_SIG);
    put_u16(
        &mut buf,
        if header.is_zip64() {
            ZIP_VERSION_45
        } else {
            header.version_needed
        },
    );
    put_u16(&mut buf, header.flags);
    put_u16(&mut buf, header.method);
    put_u16(&mut buf, header.mod_time);
    put_u16(&mut buf, header.mod_date);

    let deferred = header.flags & ZIP_FLAG_DATA_DESCRIPTOR != 0;
    put_u32(&mut buf, if deferred { 0 } else { header.crc32 });

    if deferred {
        put_u32(&mut buf, 0);
        put_u32(&mut buf, 0);
    } else if header.is_zip64() {
        put_u32(&mut buf, ZIP_UINT32_MAX);
        put_u32(&mut buf, ZIP_UINT32_MAX);
    } else {
        put_u32(&mut buf, header.compressed_size as u32);
        put_u32(&mut buf, header.uncompressed_size as u32);
    }

    put_u16(&mut buf, name.len() as u16);
    put_u16(&mut buf, header.extra.len() as u16);
    buf.extend_from_slice(name);
    buf.extend_from_slice(&header.extra);

    buf
}

/// Data descriptor with signature; 16 bytes, or 24 with 64-bit sizes when
/// the entry is ZIP64.
pub(crate) fn encode_data_descriptor(header: &ZipFileHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    put_u32(&mut buf, DATA_DESCRIPTOR_SIG);
    put_u32(&mut buf, header.crc32);
    if header.is_zip64() {
        put_u64(&mut buf, header.compressed_size);
        put_u64(&mut buf, header.uncompressed_size);
    } else {
        put_u32(&mut buf, header.compressed_size as u32);
        put_u32(&mut buf, header.uncompressed_size as u32);
    }
    buf
}

pub(crate) fn encode_central_header(entry: &CentralDirEntry) -> Vec<u8> {
    let h = &entry.header;
    let name = h.name.as_bytes();
    let need_zip64 = h.is_zip64() || entry.local_header_offset >= u64::from(ZIP_UINT32_MAX);

    let mut zip64_extra = Vec::new();
    if need_zip64 {
        put_u16(&mut zip64_extra, EXTRA_ID_ZIP64);
        put_u16(&mut zip64_extra, 24);
        put_u64(&mut zip64_extra, h.uncompressed_size);
        put_u64(&mut zip64_extra, h.compressed_size);
        put_u64(&mut zip64_extra, entry.local_header_offset);
    }

    let mut buf = Vec::with_capacity(46 + name.len() + h.extra.len() + zip64_extra.len());

    put_u32(&mut buf, CENTRAL_DIR_HEADER_SIG);
    put_u16(&mut buf, h.version_made_by);
    put_u16(
        &mut buf,
        if need_zip64 {
            ZIP_VERSION_45
        } else {
            h.version_needed
        },
    );
    put_u16(&mut buf, h.flags);
    put_u16(&mut buf, h.method);
    put_u16(&mut buf, h.mod_time);
    put_u16(&mut buf, h.mod_date);
    put_u32(&mut buf, h.crc32);

    if need_zip64 {
        put_u32(&mut buf, ZIP_UINT32_MAX);
        put_u32(&mut buf, ZIP_UINT32_MAX);
    } else {
        put_u32(&mut buf, h.compressed_size as u32);
        put_u32(&mut buf, h.uncompressed_size as u32);
    }

    put_u16(&mut buf, name.len() as u16);
    put_u16(&mut buf, (h.extra.len() + zip64_extra.len()) as u16);
    put_u16(&mut buf, 0); // comment len
    put_u16(&mut buf, 0); // disk number start
    put_u16(&mut buf, 0); // internal attributes
    put_u32(&mut buf, h.external_attr);

    if entry.local_header_offset >= u64::from(ZIP_UINT32_MAX) {
        put_u32(&mut buf, ZIP_UINT32_MAX);
    } else {
        put_u32(&mut buf, entry.local_header_offset as u32);
    }

    buf.extend_from_slice(name);
    buf.extend_from_slice(&h.extra);
    buf.extend_from_slice(&zip64_extra);

    buf
}

/// End records: a ZIP64 EOCD record and locator when any count, size or
/// offset overflows, then the classic EOCD (with sentinels in that case).
pub(crate) fn encode_end_records(
    records: u64,
    cd_offset: u64,
    cd_size: u64,
    zip64_eocd_offset: u64,
) -> Vec<u8> {
    let need_zip64 = records >= u64::from(ZIP_UINT16_MAX)
        || cd_size >= u64::from(ZIP_UINT32_MAX)
        || cd_offset >= u64::from(ZIP_UINT32_MAX);

    let mut buf = Vec::with_capacity(56 + 20 + 22);

    let (eocd_records, eocd_size, eocd_offset) = if need_zip64 {
        put_u32(&mut buf, ZIP64_EOCD_SIG);
        put_u64(&mut buf, 44); // remaining record size
        put_u16(&mut buf, ZIP_VERSION_45);
        put_u16(&mut buf, ZIP_VERSION_45);
        put_u32(&mut buf, 0); // this disk
        put_u32(&mut buf, 0); // disk with the central directory
        put_u64(&mut buf, records);
        put_u64(&mut buf, records);
        put_u64(&mut buf, cd_size);
        put_u64(&mut buf, cd_offset);

        put_u32(&mut buf, ZIP64_EOCD_LOCATOR_SIG);
        put_u32(&mut buf, 0);
        put_u64(&mut buf, zip64_eocd_offset);
        put_u32(&mut buf, 1); // total disks

        (
            ZIP_UINT16_MAX,
            ZIP_UINT32_MAX,
            ZIP_UINT32_MAX,
        )
    } else {
        (records as u16, cd_size as u32, cd_offset as u32)
    };

    put_u32(&mut buf, EOCD_SIG);
    put_u16(&mut buf, 0); // this disk
    put_u16(&mut buf, 0); // disk with the central directory
    put_u16(&mut buf, eocd_records);
    put_u16(&mut buf, eocd_records);
    put_u32(&mut buf, eocd_size);
    put_u32(&mut buf, eocd_offset);
    put_u16(&mut buf, 0); // comment len

    buf
}
