use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use pzip_deflate::{deflate_compress, CompressionLevel, FlateWriter};

fn build_mixed_dataset(bytes: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes);
    let mut state: u32 = 0x1234_5678;

    while out.len() < bytes {
        let zone = (out.len() / 4096) % 3;
        match zone {
            0 => out.extend_from_slice(b"pzip-fast-deflate-stream-"),
            1 => out.extend_from_slice(b"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"),
            _ => {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                out.push((state >> 24) as u8);
            }
        }
    }

    out.truncate(bytes);
    out
}

fn inflate(compressed: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    DeflateDecoder::new(compressed)
        .read_to_end(&mut out)
        .expect("stream should be decodable by a conformant inflater");
    out
}

#[test]
fn multi_megabyte_streams_roundtrip_at_every_level() {
    let input = build_mixed_dataset(6 * 1024 * 1024 + 321);
    for level in 0..=9 {
        let compressed =
            deflate_compress(&input, CompressionLevel::new(level)).expect("compress");
        assert_eq!(inflate(&compressed), input, "level {level}");
    }
}

#[test]
fn sink_receives_output_only_in_large_slabs() {
    struct CountingSink {
        writes: Vec<usize>,
    }

    impl Write for CountingSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.writes.push(buf.len());
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let input = build_mixed_dataset(4 * 1024 * 1024);
    let mut writer = FlateWriter::new(
        CountingSink { writes: Vec::new() },
        CompressionLevel::best_speed(),
    );
    writer.write_all(&input).expect("write");
    let sink = writer.finish().expect("finish");

    assert!(!sink.writes.is_empty());
    // Every write except the final flush carries at least 256 KiB.
    for &len in &sink.writes[..sink.writes.len() - 1] {
        assert!(len >= 256 * 1024, "sink saw a small mid-stream write: {len}");
    }
}

#[test]
fn interleaved_encoders_produce_independent_valid_streams() {
    let a = build_mixed_dataset(300 * 1024);
    let b: Vec<u8> = a.iter().rev().copied().collect();

    let mut wa = FlateWriter::new(Vec::new(), CompressionLevel::new(4));
    let mut wb = FlateWriter::new(Vec::new(), CompressionLevel::new(4));
    for (ca, cb) in a.chunks(10_000).zip(b.chunks(10_000)) {
        wa.write_all(ca).expect("write a");
        wb.write_all(cb).expect("write b");
    }
    let ca = wa.finish().expect("finish a");
    let cb = wb.finish().expect("finish b");

    assert_eq!(inflate(&ca), a);
    assert_eq!(inflate(&cb), b);
}
