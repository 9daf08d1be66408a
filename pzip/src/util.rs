//! Byte codec utilities: UTF-8 detection, DOS timestamps, path and mode
//! conversions.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

/// Scans a name the way ZIP tooling expects: returns `(valid, requires
/// utf8 flag)`. Any byte outside printable ASCII minus backslash takes the
/// multi-byte path; malformed sequences clear `valid` and stop the scan.
pub fn detect_utf8(s: &[u8]) -> (bool, bool) {
    let mut valid = true;
    let mut require = false;

    let mut i = 0;
    while i < s.len() {
        let c = s[i];

        if !(0x20..=0x7d).contains(&c) || c == 0x5c {
            if c < 0x80 {
                // ASCII control character or backslash.
                require = true;
            } else if c & 0xE0 == 0xC0 {
                if i + 1 >= s.len() || s[i + 1] & 0xC0 != 0x80 {
                    valid = false;
                    break;
                }
                i += 1;
                require = true;
            } else if c & 0xF0 == 0xE0 {
                if i + 2 >= s.len() || s[i + 1] & 0xC0 != 0x80 || s[i + 2] & 0xC0 != 0x80 {
                    valid = false;
                    break;
                }
                i += 2;
                require = true;
            } else if c & 0xF8 == 0xF0 {
                if i + 3 >= s.len()
                    || s[i + 1] & 0xC0 != 0x80
                    || s[i + 2] & 0xC0 != 0x80
                    || s[i + 3] & 0xC0 != 0x80
                {
                    valid = false;
                    break;
                }
                i += 3;
                require = true;
            } else {
                valid = false;
                break;
            }
        }
        i += 1;
    }

    (valid, require)
}

/// Archive-side name: forward slashes, no leading slash.
pub fn to_zip_path(path: &Path) -> String {
    let mut result: String = path
        .to_string_lossy()
        .chars()
        .map(|c| if c == '\\' { '/' } else { c })
        .collect();

    while result.starts_with('/') {
        result.remove(0);
    }

    result
}

pub fn from_zip_path(name: &str) -> PathBuf {
    PathBuf::from(name)
}

/// Packs Unix seconds into DOS `(date, time)` fields, UTC.
pub fn unix_to_dos(secs: i64) -> (u16, u16) {
    let dt = match OffsetDateTime::from_unix_timestamp(secs) {
        Ok(dt) => dt,
        Err(_) => return (0x21, 0),
    };
    let year = dt.year();
    if year < 1980 {
        // DOS cannot represent it; clamp to 1980-01-01.
        return (0x21, 0);
    }

    let date = (dt.day() as u16 & 0x1F)
        | ((dt.month() as u8 as u16 & 0x0F) << 5)
        | ((((year - 1980) as u16) & 0x7F) << 9);
    let time = ((dt.second() / 2) as u16 & 0x1F)
        | ((dt.minute() as u16 & 0x3F) << 5)
        | ((dt.hour() as u16 & 0x1F) << 11);

    (date, time)
}

/// Unpacks DOS `(date, time)` fields back to Unix seconds, UTC.
pub fn dos_to_unix(date: u16, time: u16) -> i64 {
    let year = 1980 + ((date >> 9) & 0x7F) as i32;
    let month = (((date >> 5) & 0x0F) as u8).clamp(1, 12);
    let day = ((date & 0x1F) as u8).max(1);
    let hour = (((time >> 11) & 0x1F) as u8).min(23);
    let minute = (((time >> 5) & 0x3F) as u8).min(59);
    let second = (((time & 0x1F) * 2) as u8).min(59);

    let month = match Month::try_from(month) {
        Ok(m) => m,
        Err(_) => Month::January,
    };
    let date = match Date::from_calendar_date(year, month, day) {
        Ok(d) => d,
        Err(_) => return 0,
    };
    let time = match Time::from_hms(hour, minute, second) {
        Ok(t) => t,
        Err(_) => return 0,
    };

    PrimitiveDateTime::new(date, time)
        .assume_utc()
        .unix_timestamp()
}

/// High 16 bits carry the Unix mode.
pub fn mode_to_zip_attr(mode: u32) -> u32 {
    mode << 16
}

pub fn zip_attr_to_mode(attr: u32) -> u32 {
    attr >> 16
}

pub fn system_time_to_unix(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Best-effort mtime restoration; mirrors `utime(2)` semantics.
pub fn set_mod_time(path: &Path, mod_time: i64) -> bool {
    use std::os::unix::ffi::OsStrExt;

    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    let times = libc::utimbuf {
        actime: mod_time as libc::time_t,
        modtime: mod_time as libc::time_t,
    };
    // Safety: cpath is a valid NUL-terminated path, times is a plain struct.
    unsafe { libc::utime(cpath.as_ptr(), &times) == 0 }
}

/// Best-effort mtime restoration on the link itself, not its target.
pub fn set_symlink_mod_time(path: &Path, mod_time: i64) -> bool {
    use std::os::unix::ffi::OsStrExt;

    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    let stamp = libc::timespec {
        tv_sec: mod_time as libc::time_t,
        tv_nsec: 0,
    };
    let times = [stamp, stamp];
    // Safety: cpath is a valid NUL-terminated path, times points at two
    // initialized timespec values.
    unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            cpath.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        ) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_names_need_no_flag() {
        assert_eq!(detect_utf8(b"plain/name.txt"), (true, false));
    }

    #[test]
    fn non_ascii_names_need_the_flag() {
        assert_eq!(detect_utf8("héllo.txt".as_bytes()), (true, true));
        assert_eq!(detect_utf8("目录/文件".as_bytes()), (true, true));
    }

    #[test]
    fn control_chars_and_backslash_need_the_flag() {
        assert_eq!(detect_utf8(b"a\x01b"), (true, true));
        assert_eq!(detect_utf8(b"a\\b"), (true, true));
    }

    #[test]
    fn malformed_sequences_are_invalid() {
        let (valid, _) = detect_utf8(&[0x61, 0xC3]); // truncated 2-byte seq
        assert!(!valid);
        let (valid, _) = detect_utf8(&[0xFF, 0x61]);
        assert!(!valid);
    }

    #[test]
    fn zip_paths_use_forward_slashes_without_leading_slash() {
        assert_eq!(to_zip_path(Path::new("/a/b/c")), "a/b/c");
        assert_eq!(to_zip_path(Path::new("a/b")), "a/b");
    }

    #[test]
    fn dos_time_packs_the_documented_bitfields() {
        // 2024-06-15 12:34:56 UTC
        let secs = 1_718_454_896;
        let (date, time) = unix_to_dos(secs);
        assert_eq!(date & 0x1F, 15);
        assert_eq!((date >> 5) & 0x0F, 6);
        assert_eq!((date >> 9) & 0x7F, 44); // 2024 - 1980
        assert_eq!((time >> 11) & 0x1F, 12);
        assert_eq!((time >> 5) & 0x3F, 34);
        assert_eq!(time & 0x1F, 28); // 56 / 2
    }

    #[test]
    fn dos_time_roundtrips_to_two_second_granularity() {
        for secs in [315_532_800i64, 1_000_000_000, 1_718_454_896, 2_000_000_001] {
            let (date, time) = unix_to_dos(secs);
            let back = dos_to_unix(date, time);
            assert!((secs - back).abs() <= 1, "{secs} -> {back}");
        }
    }

    #[test]
    fn pre_1980_times_clamp_instead_of_wrapping() {
        let (date, time) = unix_to_dos(0);
        assert_eq!((date, time), (0x21, 0));
        assert_eq!(dos_to_unix(date, time), 315_532_800); // 1980-01-01
    }

    #[test]
    fn mode_attr_roundtrips_through_the_high_bits() {
        let mode = 0o100644;
        assert_eq!(zip_attr_to_mode(mode_to_zip_attr(mode)), mode);
    }

    #[test]
    fn crc32_matches_the_standard_check_value() {
        assert_eq!(crc32fast::hash(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn symlink_mtime_is_set_on_the_link_itself() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t");
        std::fs::write(&target, b"x").unwrap();
        let link = dir.path().join("l");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let stamp = 1_600_000_000;
        assert!(set_symlink_mod_time(&link, stamp));

        let meta = std::fs::symlink_metadata(&link).unwrap();
        assert_eq!(system_time_to_unix(meta.modified().unwrap()), stamp);
        // The target keeps its own mtime.
        let target_meta = std::fs::metadata(&target).unwrap();
        assert_ne!(system_time_to_unix(target_meta.modified().unwrap()), stamp);
    }
}
