//! ZIP record model: signatures, fixed sizes, per-entry header, and the
//! extra fields this writer emits.

pub(crate) const LOCAL_FILE_HEADER_SIG: u32 = 0x0403_4b50;
pub(crate) const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
pub(crate) const CENTRAL_DIR_HEADER_SIG: u32 = 0x0201_4b50;
pub(crate) const EOCD_SIG: u32 = 0x0605_4b50;
pub(crate) const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
pub(crate) const ZIP64_EOCD_LOCATOR_SIG: u32 = 0x0706_4b50;

pub(crate) const LOCAL_HEADER_LEN: usize = 30;
pub(crate) const CENTRAL_HEADER_LEN: usize = 46;
pub(crate) const EOCD_LEN: usize = 22;
pub(crate) const ZIP64_EOCD_LEN: usize = 56;
pub(crate) const ZIP64_EOCD_LOCATOR_LEN: usize = 20;

/// Longest possible EOCD tail: record plus a maximal comment.
pub(crate) const EOCD_SEARCH_LEN: u64 = 65535 + EOCD_LEN as u64;

pub(crate) const EXTRA_ID_ZIP64: u16 = 0x0001;
pub(crate) const EXTRA_ID_EXTENDED_TIMESTAMP: u16 = 0x5455;

pub const ZIP_METHOD_STORE: u16 = 0;
pub const ZIP_METHOD_DEFLATE: u16 = 8;

pub const ZIP_FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
pub const ZIP_FLAG_UTF8: u16 = 1 << 11;

pub(crate) const ZIP_VERSION_20: u16 = 20;
pub(crate) const ZIP_VERSION_45: u16 = 45;

pub(crate) const ZIP_UINT32_MAX: u32 = 0xFFFF_FFFF;
pub(crate) const ZIP_UINT16_MAX: u16 = 0xFFFF;

/// Unix file kind carried by a compression task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
}

#[derive(Debug, Clone)]
pub struct ZipFileHeader {
    /// Forward-slash name; directories carry a trailing slash.
    pub name: String,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub mod_time: u16,
    pub mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// Unix mode in the high 16 bits.
    pub external_attr: u32,
    pub extra: Vec<u8>,
}

impl Default for ZipFileHeader {
    fn default() -> Self {
        Self {
            name: String::new(),
            version_made_by: 0,
            version_needed: ZIP_VERSION_20,
            flags: 0,
            method: ZIP_METHOD_DEFLATE,
            mod_time: 0,
            mod_date: 0,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            external_attr: 0,
            extra: Vec::new(),
        }
    }
}

impl ZipFileHeader {
    pub fn is_directory(&self) -> bool {
        self.name.ends_with('/')
    }

    pub fn is_zip64(&self) -> bool {
        self.compressed_size >= u64::from(ZIP_UINT32_MAX)
            || self.uncompressed_size >= u64::from(ZIP_UINT32_MAX)
    }
}

/// Extra field 0x5455: Unix modification seconds at 1 s granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedTimestamp {
    pub mod_time: i64,
}

impl ExtendedTimestamp {
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(9);
        data.extend_from_slice(&EXTRA_ID_EXTENDED_TIMESTAMP.to_le_bytes());
        data.extend_from_slice(&5u16.to_le_bytes());
        data.push(0x01); // mtime present
        data.extend_from_slice(&(self.mod_time as u32).to_le_bytes());
        data
    }

    /// Decodes the payload of a 0x5455 field (tag and size stripped).
    pub fn decode(data: &[u8]) -> Self {
        let mut ts = Self { mod_time: 0 };
        if data.len() >= 5 && data[0] & 0x01 != 0 {
            let mut secs = [0u8; 4];
            secs.copy_from_slice(&data[1..5]);
            ts.mod_time = i64::from(u32::from_le_bytes(secs));
        }
        ts
    }
}

/// Sizes and offset resolved from a central-directory ZIP64 extra field.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Zip64Extra {
    pub uncompressed_size: Option<u64>,
    pub compressed_size: Option<u64>,
    pub local_header_offset: Option<u64>,
}

/// Walks the extra-field area, resolving the ZIP64 field (only the values
/// flagged as sentinels are present, in the fixed order) and the extended
/// timestamp.
pub(crate) fn parse_extra_fields(
    extra: &[u8],
    need_uncompressed: bool,
    need_compressed: bool,
    need_offset: bool,
) -> (Zip64Extra, Option<ExtendedTimestamp>) {
    let mut zip64 = Zip64Extra::default();
    let mut timestamp = None;

    let mut pos = 0usize;
    while pos + 4 <= extra.len() {
        let tag = u16::from_le_bytes([extra[pos], extra[pos + 1]]);
        let size = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
        pos += 4;
        let Some(data) = extra.get(pos..pos + size) else {
            break;
        };

        match tag {
            EXTRA_ID_ZIP64 => {
                let mut off = 0usize;
                let mut read_u64 = |want: bool| -> Option<u64> {
                    if !want {
                        return None;
                    }
                    let bytes = data.get(off..off + 8)?;
                    let mut v = [0u8; 8];
                    v.copy_from_slice(bytes);
                    off += 8;
                    Some(u64::from_le_bytes(v))
                };
                zip64.uncompressed_size = read_u64(need_uncompressed);
                zip64.compressed_size = read_u64(need_compressed);
                zip64.local_header_offset = read_u64(need_offset);
            }
            EXTRA_ID_EXTENDED_TIMESTAMP => {
                timestamp = Some(ExtendedTimestamp::decode(data));
            }
            _ => {}
        }

        pos += size;
    }

    (zip64, timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip64_kicks_in_at_the_32_bit_boundary() {
        let mut h = ZipFileHeader::default();
        assert!(!h.is_zip64());
        h.uncompressed_size = u64::from(ZIP_UINT32_MAX) - 1;
        assert!(!h.is_zip64());
        h.uncompressed_size = u64::from(ZIP_UINT32_MAX);
        assert!(h.is_zip64());
        h.uncompressed_size = 0;
        h.compressed_size = 5 << 30;
        assert!(h.is_zip64());
    }

    #[test]
    fn directory_headers_are_named_with_a_trailing_slash() {
        let mut h = ZipFileHeader::default();
        h.name = "d/".to_string();
        assert!(h.is_directory());
        h.name = "d".to_string();
        assert!(!h.is_directory());
    }

    #[test]
    fn extended_timestamp_roundtrips() {
        let ts = ExtendedTimestamp {
            mod_time: 1_718_454_896,
        };
        let encoded = ts.encode();
        assert_eq!(encoded.len(), 9);
        assert_eq!(&encoded[..2], &0x5455u16.to_le_bytes());
        assert_eq!(&encoded[2..4], &5u16.to_le_bytes());
        assert_eq!(encoded[4], 0x01);
        assert_eq!(ExtendedTimestamp::decode(&encoded[4..]), ts);
    }

    #[test]
    fn extra_fields_resolve_only_the_sentinel_values() {
        let mut extra = Vec::new();
        extra.extend_from_slice(&EXTRA_ID_ZIP64.to_le_bytes());
        extra.extend_from_slice(&16u16.to_le_bytes());
        extra.extend_from_slice(&(6u64 << 30).to_le_bytes());
        extra.extend_from_slice(&(5u64 << 30).to_le_bytes());

        let (zip64, ts) = parse_extra_fields(&extra, true, true, false);
        assert_eq!(zip64.uncompressed_size, Some(6 << 30));
        assert_eq!(zip64.compressed_size, Some(5 << 30));
        assert_eq!(zip64.local_header_offset, None);
        assert!(ts.is_none());
    }
}
