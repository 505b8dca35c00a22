use mmnpz::{NpzArchive, NpzWriter, ReadNpzError};
use ndarray::{array, Array1, Array2, CowArray, Ix1, Ix2};
use std::borrow::Cow;
use std::fs::{self, File};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn archive_path(dir: &TempDir) -> PathBuf {
    dir.path().join("data.npz")
}

/// Writes a two-member archive: `x` is a 2x3 i32 array, `y` is a 1-d f64
/// array.
fn write_sample(path: &Path, compressed: bool) {
    let file = File::create(path).unwrap();
    let mut writer = if compressed {
        NpzWriter::new_compressed(file)
    } else {
        NpzWriter::new(file)
    };
    writer.add_array("x", &array![[1i32, 2, 3], [4, 5, 6]]).unwrap();
    writer.add_array("y", &array![0.5f64, 1.5, 2.5]).unwrap();
    writer.finish().unwrap();
}

/// Returns the offset of the first occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> usize {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
        .unwrap()
}

#[test]
fn stored_round_trip_borrows_the_mapping() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    write_sample(&path, false);

    let npz = NpzArchive::open(&path).unwrap();
    assert_eq!(npz.names().collect::<Vec<_>>(), ["x", "y"]);
    assert_eq!(npz.len(), 2);

    let x: CowArray<i32, Ix2> = npz.by_name("x").unwrap();
    assert!(x.is_view());
    assert_eq!(x, array![[1, 2, 3], [4, 5, 6]]);

    let y: CowArray<f64, Ix1> = npz.by_name("y").unwrap();
    assert!(y.is_view());
    assert_eq!(y, array![0.5, 1.5, 2.5]);

    // Repeated access binds the same mapped bytes, not a fresh copy.
    let x_again: CowArray<i32, Ix2> = npz.by_name("x").unwrap();
    assert_eq!(x.as_ptr(), x_again.as_ptr());
}

#[test]
fn deflated_round_trip_owns_its_buffer() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    write_sample(&path, true);

    let npz = NpzArchive::open(&path).unwrap();
    let x: CowArray<i32, Ix2> = npz.by_name("x").unwrap();
    assert!(x.is_owned());
    assert_eq!(x, array![[1, 2, 3], [4, 5, 6]]);
    let y: CowArray<f64, Ix1> = npz.by_name("y").unwrap();
    assert_eq!(y, array![0.5, 1.5, 2.5]);

    // Each access decompresses into a fresh buffer with the same values.
    let x_again: CowArray<i32, Ix2> = npz.by_name("x").unwrap();
    assert_ne!(x.as_ptr(), x_again.as_ptr());
    assert_eq!(x, x_again);
}

#[test]
fn raw_bytes_of_stored_member_are_borrowed_npy() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    write_sample(&path, false);

    let npz = NpzArchive::open(&path).unwrap();
    let bytes = npz.bytes_by_name("y").unwrap();
    assert!(matches!(bytes, Cow::Borrowed(_)));
    assert!(bytes.starts_with(b"\x93NUMPY"));
}

#[test]
fn members_can_be_fetched_by_directory_index() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    write_sample(&path, false);

    let npz = NpzArchive::open(&path).unwrap();
    let x: CowArray<i32, Ix2> = npz.by_index(0).unwrap();
    assert_eq!(x, array![[1, 2, 3], [4, 5, 6]]);
    let y: CowArray<f64, Ix1> = npz.by_index(1).unwrap();
    assert_eq!(y, array![0.5, 1.5, 2.5]);
    match npz.by_index::<f64, Ix1>(2) {
        Err(ReadNpzError::EntryNotFound(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn lookup_accepts_both_array_and_member_names() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    write_sample(&path, false);

    let npz = NpzArchive::open(&path).unwrap();
    let by_array_name: CowArray<f64, Ix1> = npz.by_name("y").unwrap();
    let by_member_name: CowArray<f64, Ix1> = npz.by_name("y.npy").unwrap();
    assert_eq!(by_array_name, by_member_name);
}

#[test]
fn missing_member_leaves_the_archive_usable() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    write_sample(&path, false);

    let npz = NpzArchive::open(&path).unwrap();
    match npz.by_name::<f64, Ix1>("absent") {
        Err(ReadNpzError::EntryNotFound(name)) => assert_eq!(name, "absent"),
        other => panic!("unexpected result: {other:?}"),
    }
    let y: CowArray<f64, Ix1> = npz.by_name("y").unwrap();
    assert_eq!(y, array![0.5, 1.5, 2.5]);
}

#[test]
fn access_after_close_fails() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    write_sample(&path, false);

    let mut npz = NpzArchive::open(&path).unwrap();
    let x: CowArray<i32, Ix2> = npz.by_name("x").unwrap();
    assert_eq!(x[[1, 2]], 6);
    drop(x);
    npz.close().unwrap();
    match npz.by_name::<i32, Ix2>("x") {
        Err(ReadNpzError::UseAfterClose) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    match npz.bytes_by_name("x") {
        Err(ReadNpzError::UseAfterClose) => {}
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn empty_archive_has_no_members() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    let writer = NpzWriter::new(File::create(&path).unwrap());
    writer.finish().unwrap();

    let npz = NpzArchive::open(&path).unwrap();
    assert!(npz.is_empty());
    assert_eq!(npz.names().count(), 0);
}

#[test]
fn opens_from_a_non_seekable_reader() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    let file = File::create(&path).unwrap();
    let mut writer = NpzWriter::new(file);
    // u8 data so the borrowed view has no alignment requirement on the owned
    // buffer.
    writer.add_array("bytes", &array![1u8, 2, 3, 4]).unwrap();
    writer.finish().unwrap();

    let bytes = fs::read(&path).unwrap();
    let npz = NpzArchive::from_reader(Cursor::new(bytes)).unwrap();
    let arr: CowArray<u8, Ix1> = npz.by_name("bytes").unwrap();
    assert_eq!(arr, array![1, 2, 3, 4]);
}

#[test]
fn tolerates_bytes_appended_after_the_archive() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    write_sample(&path, false);

    let mut bytes = fs::read(&path).unwrap();
    bytes.extend_from_slice(b"trailing junk that is not part of the archive");
    fs::write(&path, &bytes).unwrap();

    let npz = NpzArchive::open(&path).unwrap();
    let x: CowArray<i32, Ix2> = npz.by_name("x").unwrap();
    assert_eq!(x, array![[1, 2, 3], [4, 5, 6]]);
}

#[test]
fn rejects_a_truncated_archive() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    write_sample(&path, false);

    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
    match NpzArchive::open(&path) {
        Err(ReadNpzError::CorruptArchive(_)) => {}
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[test]
fn reports_an_unsupported_compression_method() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    let mut writer = NpzWriter::new(File::create(&path).unwrap());
    writer.add_array("x", &array![1i32, 2, 3]).unwrap();
    writer.finish().unwrap();

    // Forge method 12 (bzip2) in both the local header and the central
    // directory record so the two stay consistent.
    let mut bytes = fs::read(&path).unwrap();
    let lfh = find(&bytes, b"PK\x03\x04");
    bytes[lfh + 8..lfh + 10].copy_from_slice(&12u16.to_le_bytes());
    let cdfh = find(&bytes, b"PK\x01\x02");
    bytes[cdfh + 10..cdfh + 12].copy_from_slice(&12u16.to_le_bytes());
    fs::write(&path, &bytes).unwrap();

    // Opening only parses the directory and must not fail yet.
    let npz = NpzArchive::open(&path).unwrap();
    match npz.by_name::<i32, Ix1>("x") {
        Err(ReadNpzError::UnsupportedCompression(12)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn rejects_a_local_header_that_disagrees_with_the_directory() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    let mut writer = NpzWriter::new(File::create(&path).unwrap());
    writer.add_array("x", &array![1i32, 2, 3]).unwrap();
    writer.finish().unwrap();

    // Forge the method in the local header only.
    let mut bytes = fs::read(&path).unwrap();
    let lfh = find(&bytes, b"PK\x03\x04");
    bytes[lfh + 8..lfh + 10].copy_from_slice(&12u16.to_le_bytes());
    fs::write(&path, &bytes).unwrap();

    let npz = NpzArchive::open(&path).unwrap();
    match npz.by_name::<i32, Ix1>("x") {
        Err(ReadNpzError::CorruptArchive(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn rejects_a_checksum_that_disagrees_between_headers() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    let mut writer = NpzWriter::new(File::create(&path).unwrap());
    writer.add_array("x", &array![1i32, 2, 3]).unwrap();
    writer.finish().unwrap();

    let mut bytes = fs::read(&path).unwrap();
    let cdfh = find(&bytes, b"PK\x01\x02");
    for b in &mut bytes[cdfh + 16..cdfh + 20] {
        *b ^= 0xFF;
    }
    fs::write(&path, &bytes).unwrap();

    let npz = NpzArchive::open(&path).unwrap();
    match npz.by_name::<i32, Ix1>("x") {
        Err(ReadNpzError::CorruptArchive(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn detects_corruption_in_a_compressed_payload() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    let mut writer = NpzWriter::new_compressed(File::create(&path).unwrap());
    let data: Array1<f64> = Array1::linspace(0.0, 1.0, 1000);
    writer.add_array("x", &data).unwrap();
    writer.finish().unwrap();

    let mut bytes = fs::read(&path).unwrap();
    let lfh = find(&bytes, b"PK\x03\x04");
    let name_len = u16::from_le_bytes([bytes[lfh + 26], bytes[lfh + 27]]) as usize;
    let extra_len = u16::from_le_bytes([bytes[lfh + 28], bytes[lfh + 29]]) as usize;
    let payload = lfh + 30 + name_len + extra_len;
    bytes[payload + 100] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let npz = NpzArchive::open(&path).unwrap();
    match npz.by_name::<f64, Ix1>("x") {
        Err(ReadNpzError::Decompression(_)) | Err(ReadNpzError::CorruptArchive(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn writes_back_through_a_mutable_view() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    let mut writer = NpzWriter::new(File::create(&path).unwrap());
    writer.add_array("x", &array![1.0f64, 2.0, 3.0]).unwrap();
    writer.finish().unwrap();

    let mut npz = NpzArchive::open_mut(&path).unwrap();
    assert!(npz.is_writable());
    {
        let mut x = npz.by_name_mut::<f64, Ix1>("x").unwrap();
        x[1] = 20.0;
    }
    // The write is visible through the same mapping before any flush or
    // reopen.
    let x: CowArray<f64, Ix1> = npz.by_name("x").unwrap();
    assert_eq!(x, array![1.0, 20.0, 3.0]);
    drop(x);
    npz.flush().unwrap();
    npz.close().unwrap();

    let npz = NpzArchive::open(&path).unwrap();
    let x: CowArray<f64, Ix1> = npz.by_name("x").unwrap();
    assert_eq!(x, array![1.0, 20.0, 3.0]);
}

#[test]
fn mutable_views_require_a_writable_mapping() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    write_sample(&path, false);

    let mut npz = NpzArchive::open(&path).unwrap();
    assert!(!npz.is_writable());
    match npz.by_name_mut::<f64, Ix1>("y") {
        Err(ReadNpzError::ReadOnly) => {}
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn mutable_views_reject_compressed_members() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    write_sample(&path, true);

    let mut npz = NpzArchive::open_mut(&path).unwrap();
    match npz.by_name_mut::<f64, Ix1>("y") {
        Err(ReadNpzError::CompressedWrite) => {}
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn large_stored_member_round_trips() {
    let dir = TempDir::new().unwrap();
    let path = archive_path(&dir);
    let mut writer = NpzWriter::new(File::create(&path).unwrap());
    let data: Array2<f32> = Array2::from_shape_fn((300, 400), |(i, j)| (i * 400 + j) as f32);
    writer.add_array("big", &data).unwrap();
    writer.finish().unwrap();

    let npz = NpzArchive::open(&path).unwrap();
    let big: CowArray<f32, Ix2> = npz.by_name("big").unwrap();
    assert!(big.is_view());
    assert_eq!(big[[0, 0]], 0.0);
    assert_eq!(big[[299, 399]], 119_999.0);
    assert_eq!(big, data);
}
