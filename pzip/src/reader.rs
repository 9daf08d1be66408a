//! ZIP archive reader.
//!
//! The end-of-central-directory record is found by scanning the file tail
//! backwards; ZIP64 end records are consulted when the classic record
//! carries sentinel values. Entry payloads are read with positioned reads,
//! so extraction workers share one descriptor without any seek contention,
//! and decompression is streamed through flate2 with the CRC checked
//! against the directory.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use flate2::read::DeflateDecoder;

use crate::error::{PzipError, Result};
use crate::header::{
    parse_extra_fields, ZipFileHeader, CENTRAL_DIR_HEADER_SIG, CENTRAL_HEADER_LEN, EOCD_LEN,
    EOCD_SEARCH_LEN, EOCD_SIG, LOCAL_FILE_HEADER_SIG, LOCAL_HEADER_LEN, ZIP64_EOCD_LEN,
    ZIP64_EOCD_LOCATOR_LEN, ZIP64_EOCD_LOCATOR_SIG, ZIP64_EOCD_SIG, ZIP_METHOD_DEFLATE,
    ZIP_METHOD_STORE, ZIP_UINT16_MAX, ZIP_UINT32_MAX,
};
use crate::task::READ_BUFFER_SIZE;
use crate::util;

#[derive(Debug, Clone)]
pub struct ZipEntry {
    pub header: ZipFileHeader,
    pub local_header_offset: u64,
    pub data_offset: u64,
    /// Modification seconds: the extended-timestamp extra when present,
    /// the DOS fields otherwise.
    pub mod_time: i64,
}

impl ZipEntry {
    pub fn is_directory(&self) -> bool {
        self.header.is_directory()
    }

    pub fn is_symlink(&self) -> bool {
        let mode = util::zip_attr_to_mode(self.header.external_attr);
        mode & (libc::S_IFMT as u32) == libc::S_IFLNK as u32
    }
}

struct Eocd {
    total_entries: u64,
    cd_size: u64,
    cd_offset: u64,
}

#[derive(Debug)]
pub struct ZipReader {
    path: PathBuf,
    file: File,
    entries: Vec<ZipEntry>,
}

impl ZipReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| PzipError::open(path, e))?;
        let file_len = file
            .metadata()
            .map_err(|e| PzipError::read(path, e))?
            .len();

        let eocd = read_eocd(&file, file_len, path)?;
        let entries = read_central_directory(&file, &eocd, file_len, path)?;

        log::debug!(
            "opened {}: {} entries",
            path.display(),
            entries.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    /// Streams one entry's payload into `out`, decompressing DEFLATE
    /// entries and copying STORE entries, and verifies the CRC-32.
    pub fn read_into(&self, entry: &ZipEntry, out: &mut dyn Write) -> Result<u64> {
        let section = SectionReader {
            file: &self.file,
            offset: entry.data_offset,
            remaining: entry.header.compressed_size,
        };

        let mut crc = crc32fast::Hasher::new();
        let total = match entry.header.method {
            ZIP_METHOD_STORE => copy_with_crc(section, out, &mut crc, &self.path)?,
            ZIP_METHOD_DEFLATE => {
                let decoder = DeflateDecoder::new(section);
                copy_with_crc(decoder, out, &mut crc, &self.path)?
            }
            _ => {
                return Err(PzipError::Decompression(format!(
                    "unsupported compression method {}",
                    entry.header.method
                )))
            }
        };

        if total != entry.header.uncompressed_size {
            return Err(PzipError::Decompression(format!(
                "{}: size mismatch, expected {} got {}",
                entry.header.name, entry.header.uncompressed_size, total
            )));
        }
        if crc.finalize() != entry.header.crc32 {
            return Err(PzipError::Decompression(format!(
                "{}: crc32 mismatch",
                entry.header.name
            )));
        }

        Ok(total)
    }

    pub fn read_to_vec(&self, entry: &ZipEntry) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(entry.header.uncompressed_size.min(1 << 20) as usize);
        self.read_into(entry, &mut out)?;
        Ok(out)
    }
}

/// `Read` over a byte range of the archive, via positioned reads.
struct SectionReader<'a> {
    file: &'a File,
    offset: u64,
    remaining: u64,
}

impl Read for SectionReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.file.read_at(&mut buf[..want], self.offset)?;
        self.offset += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn copy_with_crc<R: Read>(
    mut reader: R,
    out: &mut dyn Write,
    crc: &mut crc32fast::Hasher,
    path: &Path,
) -> Result<u64> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| PzipError::Decompression(format!("{}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        crc.update(&buf[..n]);
        out.write_all(&buf[..n])
            .map_err(|e| PzipError::write(path, e))?;
        total += n as u64;
    }
    Ok(total)
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16> {
    let bytes = buf
        .get(pos..pos + 2)
        .ok_or(PzipError::InvalidArchive("record truncated"))?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32> {
    let bytes = buf
        .get(pos..pos + 4)
        .ok_or(PzipError::InvalidArchive("record truncated"))?;
    let mut v = [0u8; 4];
    v.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(v))
}

fn read_u64(buf: &[u8], pos: usize) -> Result<u64> {
    let bytes = buf
        .get(pos..pos + 8)
        .ok_or(PzipError::InvalidArchive("record truncated"))?;
    let mut v = [0u8; 8];
    v.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(v))
}

/// Locates and parses the EOCD, following the ZIP64 locator when the
/// classic record carries sentinel values.
fn read_eocd(file: &File, file_len: u64, path: &Path) -> Result<Eocd> {
    let search_len = file_len.min(EOCD_SEARCH_LEN) as usize;
    if search_len < EOCD_LEN {
        return Err(PzipError::InvalidArchive("file too small for an archive"));
    }

    let tail_start = file_len - search_len as u64;
    let mut tail = vec![0u8; search_len];
    file.read_exact_at(&mut tail, tail_start)
        .map_err(|e| PzipError::read(path, e))?;

    let mut sig_offset = None;
    let mut i = search_len - EOCD_LEN;
    loop {
        if read_u32(&tail, i)? == EOCD_SIG {
            sig_offset = Some(i);
            break;
        }
        if i == 0 {
            break;
        }
        i -= 1;
    }
    let Some(sig_offset) = sig_offset else {
        return Err(PzipError::InvalidArchive("end of central directory not found"));
    };

    let total_entries = read_u16(&tail, sig_offset + 10)?;
    let cd_size = read_u32(&tail, sig_offset + 12)?;
    let cd_offset = read_u32(&tail, sig_offset + 16)?;

    if total_entries != ZIP_UINT16_MAX && cd_size != ZIP_UINT32_MAX && cd_offset != ZIP_UINT32_MAX
    {
        return Ok(Eocd {
            total_entries: u64::from(total_entries),
            cd_size: u64::from(cd_size),
            cd_offset: u64::from(cd_offset),
        });
    }

    // Sentinels: the ZIP64 EOCD locator sits directly before the EOCD.
    let eocd_pos = tail_start + sig_offset as u64;
    if eocd_pos < ZIP64_EOCD_LOCATOR_LEN as u64 {
        return Err(PzipError::InvalidArchive("zip64 locator missing"));
    }
    let mut locator = [0u8; ZIP64_EOCD_LOCATOR_LEN];
    file.read_exact_at(&mut locator, eocd_pos - ZIP64_EOCD_LOCATOR_LEN as u64)
        .map_err(|e| PzipError::read(path, e))?;
    if read_u32(&locator, 0)? != ZIP64_EOCD_LOCATOR_SIG {
        return Err(PzipError::InvalidArchive("zip64 locator missing"));
    }
    let zip64_eocd_offset = read_u64(&locator, 8)?;

    let mut record = [0u8; ZIP64_EOCD_LEN];
    file.read_exact_at(&mut record, zip64_eocd_offset)
        .map_err(|e| PzipError::read(path, e))?;
    if read_u32(&record, 0)? != ZIP64_EOCD_SIG {
        return Err(PzipError::InvalidArchive("bad zip64 end record signature"));
    }

    Ok(Eocd {
        total_entries: read_u64(&record, 32)?,
        cd_size: read_u64(&record, 40)?,
        cd_offset: read_u64(&record, 48)?,
    })
}

fn read_central_directory(
    file: &File,
    eocd: &Eocd,
    file_len: u64,
    path: &Path,
) -> Result<Vec<ZipEntry>> {
    let cd_end = eocd
        .cd_offset
        .checked_add(eocd.cd_size)
        .ok_or(PzipError::InvalidArchive("central directory overflow"))?;
    if cd_end > file_len {
        return Err(PzipError::InvalidArchive("central directory out of range"));
    }

    let cd_size = usize::try_from(eocd.cd_size)
        .map_err(|_| PzipError::InvalidArchive("central directory too large"))?;
    let mut cd = vec![0u8; cd_size];
    file.read_exact_at(&mut cd, eocd.cd_offset)
        .map_err(|e| PzipError::read(path, e))?;

    let entry_count = usize::try_from(eocd.total_entries)
        .map_err(|_| PzipError::InvalidArchive("entry count too large"))?;
    let mut entries = Vec::with_capacity(entry_count.min(1 << 20));

    let mut pos = 0usize;
    for _ in 0..entry_count {
        if read_u32(&cd, pos)? != CENTRAL_DIR_HEADER_SIG {
            return Err(PzipError::InvalidArchive("bad central directory signature"));
        }

        let mut header = ZipFileHeader {
            version_made_by: read_u16(&cd, pos + 4)?,
            version_needed: read_u16(&cd, pos + 6)?,
            flags: read_u16(&cd, pos + 8)?,
            method: read_u16(&cd, pos + 10)?,
            mod_time: read_u16(&cd, pos + 12)?,
            mod_date: read_u16(&cd, pos + 14)?,
            crc32: read_u32(&cd, pos + 16)?,
            ..Default::default()
        };
        let compressed_size = read_u32(&cd, pos + 20)?;
        let uncompressed_size = read_u32(&cd, pos + 24)?;
        let name_len = read_u16(&cd, pos + 28)? as usize;
        let extra_len = read_u16(&cd, pos + 30)? as usize;
        let comment_len = read_u16(&cd, pos + 32)? as usize;
        header.external_attr = read_u32(&cd, pos + 38)?;
        let offset_u32 = read_u32(&cd, pos + 42)?;

        let name_start = pos + CENTRAL_HEADER_LEN;
        let name = cd
            .get(name_start..name_start + name_len)
            .ok_or(PzipError::InvalidArchive("entry name out of range"))?;
        header.name = String::from_utf8_lossy(name).into_owned();

        let extra_start = name_start + name_len;
        let extra = cd
            .get(extra_start..extra_start + extra_len)
            .ok_or(PzipError::InvalidArchive("extra field out of range"))?;
        header.extra = extra.to_vec();

        let (zip64, timestamp) = parse_extra_fields(
            extra,
            uncompressed_size == ZIP_UINT32_MAX,
            compressed_size == ZIP_UINT32_MAX,
            offset_u32 == ZIP_UINT32_MAX,
        );

        header.uncompressed_size = if uncompressed_size == ZIP_UINT32_MAX {
            zip64
                .uncompressed_size
                .ok_or(PzipError::InvalidArchive("missing zip64 uncompressed size"))?
        } else {
            u64::from(uncompressed_size)
        };
        header.compressed_size = if compressed_size == ZIP_UINT32_MAX {
            zip64
                .compressed_size
                .ok_or(PzipError::InvalidArchive("missing zip64 compressed size"))?
        } else {
            u64::from(compressed_size)
        };
        let local_header_offset = if offset_u32 == ZIP_UINT32_MAX {
            zip64
                .local_header_offset
                .ok_or(PzipError::InvalidArchive("missing zip64 header offset"))?
        } else {
            u64::from(offset_u32)
        };

        let mod_time = match timestamp {
            Some(ts) if ts.mod_time != 0 => ts.mod_time,
            _ => util::dos_to_unix(header.mod_date, header.mod_time),
        };

        entries.push(ZipEntry {
            header,
            local_header_offset,
            data_offset: 0,
            mod_time,
        });

        pos = extra_start + extra_len + comment_len;
    }

    // Resolve each entry's data offset through its local header.
    for entry in &mut entries {
        let mut local = [0u8; LOCAL_HEADER_LEN];
        file.read_exact_at(&mut local, entry.local_header_offset)
            .map_err(|e| PzipError::read(path, e))?;
        if read_u32(&local, 0)? != LOCAL_FILE_HEADER_SIG {
            return Err(PzipError::InvalidArchive("bad local header signature"));
        }
        let name_len = read_u16(&local, 26)? as u64;
        let extra_len = read_u16(&local, 28)? as u64;
        entry.data_offset =
            entry.local_header_offset + LOCAL_HEADER_LEN as u64 + name_len + extra_len;
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ExtendedTimestamp;
    use crate::writer::ZipWriter;
    use std::io::Write as _;

    fn write_archive(path: &Path, entries: &[(&str, &[u8])]) {
        let writer = ZipWriter::new(path);
        writer.open().expect("open");
        for (name, data) in entries {
            let compressed =
                pzip_deflate::deflate_compress(data, pzip_deflate::CompressionLevel::best_speed())
                    .expect("deflate");
            let header = ZipFileHeader {
                name: name.to_string(),
                crc32: crc32fast::hash(data),
                compressed_size: compressed.len() as u64,
                uncompressed_size: data.len() as u64,
                extra: ExtendedTimestamp {
                    mod_time: 1_700_000_000,
                }
                .encode(),
                ..Default::default()
            };
            writer
                .create_raw(&header, |sink| sink(&compressed))
                .expect("create_raw");
        }
        writer.close().expect("close");
    }

    #[test]
    fn reads_back_what_the_writer_wrote() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        write_archive(
            &archive,
            &[("one.txt", b"first file"), ("two/neste.bin", &[7u8; 4096])],
        );

        let reader = ZipReader::open(&archive).expect("open archive");
        assert_eq!(reader.entries().len(), 2);

        let e0 = &reader.entries()[0];
        assert_eq!(e0.header.name, "one.txt");
        assert_eq!(e0.header.uncompressed_size, 10);
        assert_eq!(e0.mod_time, 1_700_000_000);
        assert_eq!(reader.read_to_vec(e0).expect("read"), b"first file");

        let e1 = &reader.entries()[1];
        assert_eq!(reader.read_to_vec(e1).expect("read"), vec![7u8; 4096]);
    }

    #[test]
    fn crc_mismatch_is_a_decompression_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        write_archive(&archive, &[("x", b"payload bytes")]);

        let reader = ZipReader::open(&archive).expect("open archive");
        let mut entry = reader.entries()[0].clone();
        entry.header.crc32 ^= 1;
        let err = reader
            .read_into(&entry, &mut Vec::new())
            .expect_err("corrupted crc must fail");
        assert!(matches!(err, PzipError::Decompression(_)));
    }

    #[test]
    fn garbage_files_are_invalid_archives() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.zip");
        std::fs::File::create(&bogus)
            .unwrap()
            .write_all(&[0u8; 4096])
            .unwrap();
        let err = ZipReader::open(&bogus).expect_err("must fail");
        assert!(matches!(err, PzipError::InvalidArchive(_)));
    }
}
