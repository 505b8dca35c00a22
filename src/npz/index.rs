//! Parsing of the ZIP container structures that make up an `.npz` archive.
//!
//! Archives are read back to front: the end-of-central-directory record is
//! located by a bounded backward scan, the central directory it points to is
//! parsed into [`EntryRecord`]s without touching any payload bytes, and a
//! member's payload range is only resolved (and cross-checked against its
//! local file header) when the member is actually requested.

use super::ReadNpzError;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use std::ops::Range;

const EOCD_SIGNATURE: &[u8] = b"PK\x05\x06";
const EOCD_SIZE: usize = 22;
const ZIP64_EOCD_SIGNATURE: &[u8] = b"PK\x06\x06";
const ZIP64_EOCD_SIZE: usize = 56;
const ZIP64_EOCD_LOCATOR_SIGNATURE: &[u8] = b"PK\x06\x07";
const ZIP64_EOCD_LOCATOR_SIZE: usize = 20;
const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";
const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
const LFH_SIZE: usize = 30;

/// Maximum ZIP comment size allowed by the format. Bounds the backward scan
/// for the end-of-central-directory record.
const MAX_COMMENT_SIZE: usize = 65535;

/// ZIP64 extended information extra field id.
const ZIP64_EXTRA_ID: u16 = 0x0001;

/// General purpose flag bit 0: the entry is encrypted.
const FLAG_ENCRYPTED: u16 = 0x0001;
/// General purpose flag bit 3: sizes and CRC live in a trailing data
/// descriptor, not the local file header.
const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

fn corrupt(msg: impl Into<String>) -> ReadNpzError {
    ReadNpzError::CorruptArchive(msg.into())
}

/// Compression method of one archive member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    Stored,
    Deflated,
    Other(u16),
}

impl Method {
    fn from_u16(value: u16) -> Self {
        match value {
            0 => Method::Stored,
            8 => Method::Deflated,
            other => Method::Other(other),
        }
    }
}

/// One member of the central directory. Built once at open time and never
/// mutated.
#[derive(Debug, Clone)]
pub(crate) struct EntryRecord {
    pub name: String,
    pub method: Method,
    pub flags: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub header_offset: u64,
}

struct EndOfCentralDirectory {
    disk_number: u16,
    disk_with_cd: u16,
    disk_entries: u16,
    total_entries: u16,
    cd_size: u32,
    cd_offset: u32,
}

impl EndOfCentralDirectory {
    fn from_bytes(data: &[u8]) -> Self {
        Self {
            disk_number: LittleEndian::read_u16(&data[4..]),
            disk_with_cd: LittleEndian::read_u16(&data[6..]),
            disk_entries: LittleEndian::read_u16(&data[8..]),
            total_entries: LittleEndian::read_u16(&data[10..]),
            cd_size: LittleEndian::read_u32(&data[12..]),
            cd_offset: LittleEndian::read_u32(&data[16..]),
        }
    }

    fn needs_zip64(&self) -> bool {
        self.total_entries == u16::MAX
            || self.cd_size == u32::MAX
            || self.cd_offset == u32::MAX
    }
}

/// Locates the end-of-central-directory record by scanning backward from the
/// end of the archive.
///
/// Some archive authors append data after the logical end, so the scan covers
/// the whole trailing window allowed by the format (maximum comment length
/// plus the fixed record size) and accepts a record whose comment field does
/// not reach exactly to the end of the file.
fn find_eocd(bytes: &[u8]) -> Result<(usize, EndOfCentralDirectory), ReadNpzError> {
    if bytes.len() < EOCD_SIZE {
        return Err(corrupt(format!(
            "file of {} bytes is too short to be an archive",
            bytes.len()
        )));
    }
    let window_start = bytes.len().saturating_sub(EOCD_SIZE + MAX_COMMENT_SIZE);
    let window = &bytes[window_start..];
    for i in (0..=window.len() - EOCD_SIZE).rev() {
        if &window[i..i + 4] == EOCD_SIGNATURE {
            let comment_len = LittleEndian::read_u16(&window[i + 20..]) as usize;
            if comment_len <= window.len() - i - EOCD_SIZE {
                let eocd = EndOfCentralDirectory::from_bytes(&window[i..i + EOCD_SIZE]);
                return Ok((window_start + i, eocd));
            }
        }
    }
    Err(corrupt("end of central directory signature not found"))
}

/// Reads the ZIP64 end-of-central-directory record via its locator, which
/// sits immediately before the classic record.
fn read_zip64_eocd(bytes: &[u8], eocd_offset: usize) -> Result<(u64, u64, u64), ReadNpzError> {
    let locator_offset = eocd_offset
        .checked_sub(ZIP64_EOCD_LOCATOR_SIZE)
        .ok_or_else(|| corrupt("missing zip64 end of central directory locator"))?;
    let locator = &bytes[locator_offset..eocd_offset];
    if &locator[..4] != ZIP64_EOCD_LOCATOR_SIGNATURE {
        return Err(corrupt("missing zip64 end of central directory locator"));
    }
    let record_offset = usize::try_from(LittleEndian::read_u64(&locator[8..]))
        .map_err(|_| corrupt("zip64 end of central directory offset overflows"))?;
    let record = record_offset
        .checked_add(ZIP64_EOCD_SIZE)
        .and_then(|end| bytes.get(record_offset..end))
        .ok_or_else(|| corrupt("zip64 end of central directory out of bounds"))?;
    if &record[..4] != ZIP64_EOCD_SIGNATURE {
        return Err(corrupt("bad zip64 end of central directory signature"));
    }
    let total_entries = LittleEndian::read_u64(&record[32..]);
    let cd_size = LittleEndian::read_u64(&record[40..]);
    let cd_offset = LittleEndian::read_u64(&record[48..]);
    Ok((cd_offset, cd_size, total_entries))
}

/// Parses the central directory of `bytes` into member records, in directory
/// order. Does not read any payload bytes.
pub(crate) fn read_central_directory(bytes: &[u8]) -> Result<Vec<EntryRecord>, ReadNpzError> {
    let (eocd_offset, eocd) = find_eocd(bytes)?;
    if eocd.disk_number != eocd.disk_with_cd || eocd.disk_entries != eocd.total_entries {
        return Err(corrupt("multi-disk archives are not supported"));
    }
    let (cd_offset, cd_size, total_entries) = if eocd.needs_zip64() {
        read_zip64_eocd(bytes, eocd_offset)?
    } else {
        (
            u64::from(eocd.cd_offset),
            u64::from(eocd.cd_size),
            u64::from(eocd.total_entries),
        )
    };
    let cd_start = usize::try_from(cd_offset)
        .map_err(|_| corrupt("central directory offset overflows"))?;
    let cd_end = cd_offset
        .checked_add(cd_size)
        .and_then(|end| usize::try_from(end).ok())
        .filter(|&end| end <= eocd_offset)
        .ok_or_else(|| corrupt("central directory extends past its end record"))?;
    if cd_start > cd_end {
        return Err(corrupt("central directory offset past its end record"));
    }
    let entry_count = usize::try_from(total_entries)
        .map_err(|_| corrupt("central directory entry count overflows"))?;

    let mut cursor = Cursor::new(&bytes[cd_start..cd_end]);
    let mut entries = Vec::with_capacity(entry_count.min(cd_end - cd_start));
    for _ in 0..entry_count {
        entries.push(read_cd_record(&mut cursor)?);
    }
    Ok(entries)
}

/// Parses one central directory file header at the cursor.
fn read_cd_record(cursor: &mut Cursor<&[u8]>) -> Result<EntryRecord, ReadNpzError> {
    let truncated = |_| corrupt("truncated central directory record");

    let mut sig = [0u8; 4];
    cursor.read_exact(&mut sig).map_err(truncated)?;
    if sig != CDFH_SIGNATURE {
        return Err(corrupt("bad central directory record signature"));
    }
    let _version_made_by = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _version_needed = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let flags = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let method = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _last_mod_time = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _last_mod_date = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let crc32 = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let mut compressed_size = u64::from(cursor.read_u32::<LittleEndian>().map_err(truncated)?);
    let mut uncompressed_size = u64::from(cursor.read_u32::<LittleEndian>().map_err(truncated)?);
    let name_len = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let extra_len = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let comment_len = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _disk_number_start = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _external_attrs = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let mut header_offset = u64::from(cursor.read_u32::<LittleEndian>().map_err(truncated)?);

    let mut name_bytes = vec![0u8; usize::from(name_len)];
    cursor.read_exact(&mut name_bytes).map_err(truncated)?;
    let name = String::from_utf8(name_bytes)
        .map_err(|_| corrupt("member name is not valid UTF-8"))?;

    // ZIP64 sizes/offset live in an extra field when the 32-bit fields
    // saturate.
    let extra_end = cursor.position() + u64::from(extra_len);
    while cursor.position() + 4 <= extra_end {
        let header_id = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
        let field_size = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
        let field_end = cursor.position() + u64::from(field_size);
        if header_id == ZIP64_EXTRA_ID {
            if uncompressed_size == u64::from(u32::MAX) && cursor.position() + 8 <= field_end {
                uncompressed_size = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
            }
            if compressed_size == u64::from(u32::MAX) && cursor.position() + 8 <= field_end {
                compressed_size = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
            }
            if header_offset == u64::from(u32::MAX) && cursor.position() + 8 <= field_end {
                header_offset = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
            }
        }
        cursor.set_position(field_end);
    }
    cursor.set_position(extra_end + u64::from(comment_len));

    Ok(EntryRecord {
        name,
        method: Method::from_u16(method),
        flags,
        crc32,
        compressed_size,
        uncompressed_size,
        header_offset,
    })
}

/// Resolves the payload byte range of `entry`, validating the local file
/// header at the recorded offset against the central directory record.
///
/// The central directory and the local headers are written independently, so
/// a malformed (or forged) archive can disagree between the two; both must
/// agree before the payload location is trusted.
pub(crate) fn entry_data_range(
    bytes: &[u8],
    entry: &EntryRecord,
) -> Result<Range<usize>, ReadNpzError> {
    let offset = usize::try_from(entry.header_offset)
        .map_err(|_| corrupt(format!("local header offset overflows for `{}`", entry.name)))?;
    let header = offset
        .checked_add(LFH_SIZE)
        .and_then(|end| bytes.get(offset..end))
        .ok_or_else(|| corrupt(format!("local header out of bounds for `{}`", entry.name)))?;
    if &header[..4] != LFH_SIGNATURE {
        return Err(corrupt(format!("bad local header signature for `{}`", entry.name)));
    }
    let flags = LittleEndian::read_u16(&header[6..]);
    if flags & FLAG_ENCRYPTED != 0 || entry.flags & FLAG_ENCRYPTED != 0 {
        return Err(corrupt(format!("member `{}` is encrypted", entry.name)));
    }
    let method = Method::from_u16(LittleEndian::read_u16(&header[8..]));
    if method != entry.method {
        return Err(corrupt(format!(
            "local header compression method disagrees with central directory for `{}`",
            entry.name
        )));
    }
    // With a data descriptor (flag bit 3) the local sizes and CRC are zero
    // and only the central directory is authoritative.
    if flags & FLAG_DATA_DESCRIPTOR == 0 {
        let crc32 = LittleEndian::read_u32(&header[14..]);
        let compressed = u64::from(LittleEndian::read_u32(&header[18..]));
        let uncompressed = u64::from(LittleEndian::read_u32(&header[22..]));
        let sentinel = u64::from(u32::MAX);
        let sizes_agree = (compressed == entry.compressed_size || compressed == sentinel)
            && (uncompressed == entry.uncompressed_size || uncompressed == sentinel);
        if !sizes_agree || crc32 != entry.crc32 {
            return Err(corrupt(format!(
                "local header disagrees with central directory for `{}`",
                entry.name
            )));
        }
    }
    let name_len = usize::from(LittleEndian::read_u16(&header[26..]));
    let extra_len = usize::from(LittleEndian::read_u16(&header[28..]));
    let data_start = offset + LFH_SIZE + name_len + extra_len;
    let data_end = u64::try_from(data_start)
        .ok()
        .and_then(|start| start.checked_add(entry.compressed_size))
        .and_then(|end| usize::try_from(end).ok())
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| corrupt(format!("payload out of bounds for `{}`", entry.name)))?;
    Ok(data_start..data_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An archive with no members is just an end-of-central-directory record.
    fn empty_archive() -> Vec<u8> {
        let mut out = EOCD_SIGNATURE.to_vec();
        out.extend_from_slice(&[0u8; 18]);
        out
    }

    #[test]
    fn parses_empty_archive() {
        let entries = read_central_directory(&empty_archive()).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn rejects_too_short_file() {
        match read_central_directory(&[0u8; 10]) {
            Err(ReadNpzError::CorruptArchive(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_signature() {
        match read_central_directory(&[0u8; 64]) {
            Err(ReadNpzError::CorruptArchive(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn finds_record_behind_comment() {
        let mut bytes = empty_archive();
        let comment = b"written by a test";
        let len = bytes.len();
        LittleEndian::write_u16(&mut bytes[len - 2..], comment.len() as u16);
        bytes.extend_from_slice(comment);
        let entries = read_central_directory(&bytes).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn tolerates_trailing_junk() {
        let mut bytes = empty_archive();
        bytes.extend_from_slice(&[0xAA; 100]);
        let entries = read_central_directory(&bytes).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn rejects_multi_disk_markers() {
        let mut bytes = empty_archive();
        // Disk number 1, central directory on disk 0.
        LittleEndian::write_u16(&mut bytes[4..], 1);
        match read_central_directory(&bytes) {
            Err(ReadNpzError::CorruptArchive(msg)) => {
                assert!(msg.contains("multi-disk"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    /// A zip64 end-of-central-directory record for an empty directory,
    /// followed by its locator and a classic record with saturated fields.
    fn empty_zip64_archive() -> Vec<u8> {
        let mut out = Vec::new();
        // Zip64 end-of-central-directory record at offset 0.
        out.extend_from_slice(ZIP64_EOCD_SIGNATURE);
        out.extend_from_slice(&44u64.to_le_bytes()); // size of remainder
        out.extend_from_slice(&45u16.to_le_bytes()); // version made by
        out.extend_from_slice(&45u16.to_le_bytes()); // version needed
        out.extend_from_slice(&0u32.to_le_bytes()); // disk number
        out.extend_from_slice(&0u32.to_le_bytes()); // disk with directory
        out.extend_from_slice(&0u64.to_le_bytes()); // entries on this disk
        out.extend_from_slice(&0u64.to_le_bytes()); // total entries
        out.extend_from_slice(&0u64.to_le_bytes()); // directory size
        out.extend_from_slice(&0u64.to_le_bytes()); // directory offset
        // Locator.
        out.extend_from_slice(ZIP64_EOCD_LOCATOR_SIGNATURE);
        out.extend_from_slice(&0u32.to_le_bytes()); // disk with the record
        out.extend_from_slice(&0u64.to_le_bytes()); // record offset
        out.extend_from_slice(&1u32.to_le_bytes()); // total disks
        // Classic record with every zip64-relevant field saturated.
        out.extend_from_slice(EOCD_SIGNATURE);
        out.extend_from_slice(&0u16.to_le_bytes()); // disk number
        out.extend_from_slice(&0u16.to_le_bytes()); // disk with directory
        out.extend_from_slice(&u16::MAX.to_le_bytes()); // entries on this disk
        out.extend_from_slice(&u16::MAX.to_le_bytes()); // total entries
        out.extend_from_slice(&u32::MAX.to_le_bytes()); // directory size
        out.extend_from_slice(&u32::MAX.to_le_bytes()); // directory offset
        out.extend_from_slice(&0u16.to_le_bytes()); // comment length
        out
    }

    #[test]
    fn follows_the_zip64_record_when_classic_fields_saturate() {
        let entries = read_central_directory(&empty_zip64_archive()).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn rejects_a_zip64_record_offset_past_the_end() {
        let mut bytes = empty_zip64_archive();
        // The locator's record-offset field sits 8 bytes into the locator.
        let locator = ZIP64_EOCD_SIZE + 8;
        bytes[locator..locator + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        match read_central_directory(&bytes) {
            Err(ReadNpzError::CorruptArchive(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn reads_the_offset_from_a_zip64_extra_field() {
        let mut out = Vec::new();
        // Local file header for member `x` with a 4-byte stored payload.
        out.extend_from_slice(LFH_SIGNATURE);
        out.extend_from_slice(&20u16.to_le_bytes()); // version needed
        out.extend_from_slice(&0u16.to_le_bytes()); // flags
        out.extend_from_slice(&0u16.to_le_bytes()); // method
        out.extend_from_slice(&[0u8; 4]); // mod time/date
        out.extend_from_slice(&0x1111_1111u32.to_le_bytes()); // crc
        out.extend_from_slice(&4u32.to_le_bytes()); // compressed size
        out.extend_from_slice(&4u32.to_le_bytes()); // uncompressed size
        out.extend_from_slice(&1u16.to_le_bytes()); // name length
        out.extend_from_slice(&0u16.to_le_bytes()); // extra length
        out.push(b'x');
        out.extend_from_slice(&[7, 8, 9, 10]);
        let cd_offset = out.len();
        // Directory record with a saturated offset field; the real offset
        // lives in a zip64 extra field.
        out.extend_from_slice(CDFH_SIGNATURE);
        out.extend_from_slice(&45u16.to_le_bytes()); // version made by
        out.extend_from_slice(&20u16.to_le_bytes()); // version needed
        out.extend_from_slice(&0u16.to_le_bytes()); // flags
        out.extend_from_slice(&0u16.to_le_bytes()); // method
        out.extend_from_slice(&[0u8; 4]); // mod time/date
        out.extend_from_slice(&0x1111_1111u32.to_le_bytes()); // crc
        out.extend_from_slice(&4u32.to_le_bytes()); // compressed size
        out.extend_from_slice(&4u32.to_le_bytes()); // uncompressed size
        out.extend_from_slice(&1u16.to_le_bytes()); // name length
        out.extend_from_slice(&12u16.to_le_bytes()); // extra length
        out.extend_from_slice(&0u16.to_le_bytes()); // comment length
        out.extend_from_slice(&0u16.to_le_bytes()); // disk number start
        out.extend_from_slice(&0u16.to_le_bytes()); // internal attributes
        out.extend_from_slice(&0u32.to_le_bytes()); // external attributes
        out.extend_from_slice(&u32::MAX.to_le_bytes()); // header offset
        out.push(b'x');
        out.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // real header offset
        let cd_size = out.len() - cd_offset;
        out.extend_from_slice(EOCD_SIGNATURE);
        out.extend_from_slice(&0u16.to_le_bytes()); // disk number
        out.extend_from_slice(&0u16.to_le_bytes()); // disk with directory
        out.extend_from_slice(&1u16.to_le_bytes()); // entries on this disk
        out.extend_from_slice(&1u16.to_le_bytes()); // total entries
        out.extend_from_slice(&(cd_size as u32).to_le_bytes());
        out.extend_from_slice(&(cd_offset as u32).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // comment length

        let entries = read_central_directory(&out).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "x");
        assert_eq!(entries[0].header_offset, 0);
        let range = entry_data_range(&out, &entries[0]).unwrap();
        assert_eq!(&out[range], [7, 8, 9, 10]);
    }

    #[test]
    fn rejects_a_header_offset_past_the_end_of_the_file() {
        let entry = EntryRecord {
            name: "x".to_string(),
            method: Method::Stored,
            flags: 0,
            crc32: 0,
            compressed_size: 4,
            uncompressed_size: 4,
            header_offset: u64::MAX - 10,
        };
        match entry_data_range(&[0u8; 64], &entry) {
            Err(ReadNpzError::CorruptArchive(msg)) => {
                assert!(msg.contains("out of bounds") || msg.contains("overflows"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejects_inconsistent_directory_bounds() {
        let mut bytes = empty_archive();
        // One entry claimed, but the directory has zero size and sits at a
        // nonsense offset.
        LittleEndian::write_u16(&mut bytes[8..], 1);
        LittleEndian::write_u16(&mut bytes[10..], 1);
        LittleEndian::write_u32(&mut bytes[12..], 46);
        LittleEndian::write_u32(&mut bytes[16..], 0);
        match read_central_directory(&bytes) {
            Err(ReadNpzError::CorruptArchive(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
