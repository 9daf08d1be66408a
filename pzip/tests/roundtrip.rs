use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pzip::{
    compress, extract, Archiver, ArchiverOptions, ExtractorOptions, PzipError, ZipReader,
    ZIP_METHOD_DEFLATE, ZIP_METHOD_STORE,
};

fn mixed_data(bytes: usize, seed: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes);
    let mut state = seed;
    while out.len() < bytes {
        let zone = (out.len() / 4096) % 3;
        match zone {
            0 => out.extend_from_slice(b"pzip-roundtrip-corpus-line-"),
            1 => out.extend_from_slice(b"0000000000000000000000000000"),
            _ => {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                out.push((state >> 24) as u8);
            }
        }
    }
    out.truncate(bytes);
    out
}

fn random_data(bytes: usize, seed: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes);
    let mut state = seed;
    while out.len() < bytes {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        out.push((state >> 24) as u8);
    }
    out
}

fn assert_same_file(a: &Path, b: &Path) {
    let da = fs::read(a).unwrap_or_else(|_| panic!("read {}", a.display()));
    let db = fs::read(b).unwrap_or_else(|_| panic!("read {}", b.display()));
    assert_eq!(da, db, "{} differs from {}", a.display(), b.display());
}

#[test]
fn files_roundtrip_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();

    fs::write(src.join("text.txt"), mixed_data(50_000, 1)).unwrap();
    fs::write(src.join("small.bin"), b"tiny").unwrap();
    fs::write(src.join("empty.dat"), b"").unwrap();

    let archive = dir.path().join("out.zip");
    compress(
        &archive,
        &[
            src.join("text.txt"),
            src.join("small.bin"),
            src.join("empty.dat"),
        ],
        ArchiverOptions::default(),
    )
    .expect("compress");

    let out = dir.path().join("out");
    extract(&archive, &out, ExtractorOptions::default()).expect("extract");

    assert_same_file(&src.join("text.txt"), &out.join("text.txt"));
    assert_same_file(&src.join("small.bin"), &out.join("small.bin"));
    assert_same_file(&src.join("empty.dat"), &out.join("empty.dat"));
}

#[test]
fn empty_file_entry_is_a_two_byte_deflate_stream() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("a.txt");
    fs::write(&input, b"").unwrap();

    let archive = dir.path().join("a.zip");
    compress(&archive, &[input], ArchiverOptions::default()).expect("compress");

    let reader = ZipReader::open(&archive).expect("open");
    let entry = &reader.entries()[0];
    assert_eq!(entry.header.method, ZIP_METHOD_DEFLATE);
    assert_eq!(entry.header.uncompressed_size, 0);
    assert_eq!(entry.header.compressed_size, 2);
    assert_eq!(entry.header.crc32, 0);
    assert_eq!(reader.read_to_vec(entry).expect("read"), b"");
}

#[test]
fn directory_tree_with_symlink_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("d");
    fs::create_dir(&root).unwrap();
    fs::write(root.join("x"), b"foo").unwrap();
    std::os::unix::fs::symlink("x", root.join("l")).unwrap();

    let archive = dir.path().join("d.zip");
    compress(&archive, &[root.clone()], ArchiverOptions::default()).expect("compress");

    let reader = ZipReader::open(&archive).expect("open");
    let mut names: Vec<&str> = reader
        .entries()
        .iter()
        .map(|e| e.header.name.as_str())
        .collect();
    names.sort_unstable();
    assert_eq!(names, ["d/", "d/l", "d/x"]);

    for entry in reader.entries() {
        match entry.header.name.as_str() {
            "d/" => {
                assert_eq!(entry.header.method, ZIP_METHOD_STORE);
                assert_eq!(entry.header.uncompressed_size, 0);
                assert_eq!(entry.header.crc32, 0);
            }
            "d/l" => {
                assert_eq!(entry.header.method, ZIP_METHOD_STORE);
                assert_eq!(entry.header.uncompressed_size, 1);
                assert!(entry.is_symlink());
                assert_eq!(reader.read_to_vec(entry).expect("read"), b"x");
            }
            "d/x" => {
                assert_eq!(reader.read_to_vec(entry).expect("read"), b"foo");
            }
            other => panic!("unexpected entry {other}"),
        }
    }

    let out = dir.path().join("out");
    extract(&archive, &out, ExtractorOptions::default()).expect("extract");

    assert_eq!(fs::read(out.join("d/x")).unwrap(), b"foo");
    let link = out.join("d/l");
    assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("x"));
    assert_eq!(fs::read(&link).unwrap(), b"foo");
}

#[test]
fn modes_and_mtimes_survive_the_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();
    let script = src.join("run.sh");
    fs::write(&script, b"#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o754)).unwrap();

    let archive = dir.path().join("m.zip");
    compress(&archive, &[src.clone()], ArchiverOptions::default()).expect("compress");

    let out = dir.path().join("out");
    extract(&archive, &out, ExtractorOptions::default()).expect("extract");

    let extracted = out.join("src/run.sh");
    let mode = fs::metadata(&extracted).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o754);

    let orig_mtime = fs::metadata(&script).unwrap().modified().unwrap();
    let new_mtime = fs::metadata(&extracted).unwrap().modified().unwrap();
    let delta = orig_mtime
        .duration_since(new_mtime)
        .unwrap_or_else(|e| e.duration())
        .as_secs();
    assert!(delta <= 2, "mtime drifted by {delta}s");
}

#[test]
fn large_incompressible_file_spills_and_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("big.bin");
    // Incompressible, so the compressed stream exceeds the 2 MiB task
    // buffer and exercises the overflow spill.
    let data = random_data(3 * 1024 * 1024, 42);
    fs::write(&input, &data).unwrap();

    let archive = dir.path().join("big.zip");
    compress(&archive, &[input], ArchiverOptions::default()).expect("compress");

    let out = dir.path().join("out");
    extract(&archive, &out, ExtractorOptions::default()).expect("extract");
    assert_eq!(fs::read(out.join("big.bin")).unwrap(), data);
}

#[test]
fn every_concurrency_level_extracts_to_the_same_set() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();
    for i in 0..40 {
        fs::write(
            src.join(format!("f{i:02}.dat")),
            mixed_data(10_000 + i * 137, i as u32),
        )
        .unwrap();
    }

    let mut reference: Option<Vec<(String, Vec<u8>)>> = None;

    for n in [1usize, 2, 4, 8] {
        let archive = dir.path().join(format!("c{n}.zip"));
        compress(
            &archive,
            &[src.clone()],
            ArchiverOptions {
                concurrency: n,
                ..Default::default()
            },
        )
        .expect("compress");

        let reader = ZipReader::open(&archive).expect("open");
        let mut contents: Vec<(String, Vec<u8>)> = reader
            .entries()
            .iter()
            .filter(|e| !e.is_directory())
            .map(|e| (e.header.name.clone(), reader.read_to_vec(e).expect("read")))
            .collect();
        contents.sort_by(|a, b| a.0.cmp(&b.0));

        match &reference {
            None => reference = Some(contents),
            Some(expected) => assert_eq!(expected, &contents, "concurrency {n}"),
        }
    }
}

#[test]
fn existing_files_are_skipped_without_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("note.txt");
    fs::write(&input, b"new contents").unwrap();

    let archive = dir.path().join("n.zip");
    compress(&archive, &[input], ArchiverOptions::default()).expect("compress");

    let out = dir.path().join("out");
    fs::create_dir(&out).unwrap();
    fs::write(out.join("note.txt"), b"old contents").unwrap();

    extract(
        &archive,
        &out,
        ExtractorOptions {
            overwrite: false,
            ..Default::default()
        },
    )
    .expect("extract should succeed while skipping");
    assert_eq!(fs::read(out.join("note.txt")).unwrap(), b"old contents");

    extract(&archive, &out, ExtractorOptions::default()).expect("extract with overwrite");
    assert_eq!(fs::read(out.join("note.txt")).unwrap(), b"new contents");
}

#[test]
fn missing_input_fails_before_any_partial_archive_work() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("x.zip");
    let err = compress(
        &archive,
        &[dir.path().join("does-not-exist")],
        ArchiverOptions::default(),
    )
    .expect_err("must fail");
    assert!(matches!(err, PzipError::FileNotFound(_)));
}

#[test]
fn archive_file_inside_the_tree_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();
    fs::write(src.join("a.txt"), b"hello").unwrap();

    // The output lands inside the directory being archived.
    let archive = src.join("self.zip");
    compress(&archive, &[src.clone()], ArchiverOptions::default()).expect("compress");

    let reader = ZipReader::open(&archive).expect("open");
    assert!(reader
        .entries()
        .iter()
        .all(|e| !e.header.name.ends_with("self.zip")));
}

#[test]
fn cancel_during_archive_surfaces_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();
    for i in 0..60 {
        fs::write(src.join(format!("f{i:02}")), mixed_data(20_000, i)).unwrap();
    }

    let cancel_flag = Arc::new(AtomicBool::new(false));
    let archiver = Arc::new(Archiver::new(
        &dir.path().join("c.zip"),
        ArchiverOptions {
            concurrency: 2,
            ..Default::default()
        },
    ));

    let watcher = {
        let archiver = Arc::clone(&archiver);
        let cancel_flag = Arc::clone(&cancel_flag);
        std::thread::spawn(move || {
            while !cancel_flag.load(Ordering::SeqCst) {
                if archiver.processed_files() >= 1 {
                    archiver.cancel();
                    return;
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        })
    };

    let paths = vec![src];
    let result = archiver.archive(&paths);
    cancel_flag.store(true, Ordering::SeqCst);
    watcher.join().unwrap();

    if let Err(err) = result {
        assert!(
            matches!(err, PzipError::Cancelled),
            "unexpected error kind: {err}"
        );
    }
    // Either way, no worker threads linger and close still works.
    archiver.close().ok();
}

#[test]
fn utf8_names_set_the_language_flag_and_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("天气预报.txt");
    fs::write(&input, b"sunny").unwrap();

    let archive = dir.path().join("u.zip");
    compress(&archive, &[input], ArchiverOptions::default()).expect("compress");

    let reader = ZipReader::open(&archive).expect("open");
    let entry = &reader.entries()[0];
    assert_eq!(entry.header.name, "天气预报.txt");
    assert_ne!(entry.header.flags & pzip::ZIP_FLAG_UTF8, 0);

    let out = dir.path().join("out");
    extract(&archive, &out, ExtractorOptions::default()).expect("extract");
    assert_eq!(fs::read(out.join("天气预报.txt")).unwrap(), b"sunny");
}

#[test]
fn plain_ascii_names_leave_the_utf8_flag_clear() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("plain.txt");
    fs::write(&input, b"ascii").unwrap();

    let archive = dir.path().join("p.zip");
    compress(&archive, &[input], ArchiverOptions::default()).expect("compress");

    let reader = ZipReader::open(&archive).expect("open");
    assert_eq!(reader.entries()[0].header.flags & pzip::ZIP_FLAG_UTF8, 0);
}
