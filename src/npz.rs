mod index;

use self::index::{EntryRecord, Method};
use crate::npy::{ReadNpyError, ViewNpyError, WriteNpyError};
use memmap2::{Mmap, MmapMut};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Seek, Write};
use std::path::Path;
use thiserror::Error;
use zip::result::ZipError;
use zip::write::{SimpleFileOptions, ZipWriter};
use zip::CompressionMethod;

/// Stored members are aligned to this many bytes so that zero-copy views of a
/// page-aligned mapping start on an element boundary.
const MEMBER_ALIGNMENT: u16 = 64;

/// An error reading an `.npz` archive.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReadNpzError {
    /// An error caused by I/O.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The archive container is damaged or inconsistent: the central
    /// directory is unparsable, a local header disagrees with it, or a
    /// member's checksum does not match its decompressed payload.
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),
    /// No member with the requested name exists.
    #[error("archive does not contain `{0}`")]
    EntryNotFound(String),
    /// A member uses a compression method other than stored or deflate.
    #[error("unsupported compression method {0}")]
    UnsupportedCompression(u16),
    /// The codec failed on a member's compressed payload.
    #[error("error decompressing member: {0}")]
    Decompression(io::Error),
    /// The archive was closed before this access.
    #[error("archive has been closed")]
    UseAfterClose,
    /// A writable view was requested from a read-only archive.
    #[error("archive was not opened for writing")]
    ReadOnly,
    /// A writable view was requested for a compressed member. In-place
    /// mutation is limited to stored members.
    #[error("cannot create a writable view of a compressed member")]
    CompressedWrite,
    /// An error reading a member in `.npy` format.
    #[error("error reading npy member: {0}")]
    Npy(#[from] ReadNpyError),
    /// An error viewing a member in `.npy` format.
    #[error("error viewing npy member: {0}")]
    View(#[from] ViewNpyError),
}

/// An error writing an `.npz` archive.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WriteNpzError {
    /// An error caused by I/O.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// An error caused by the zip container layer.
    #[error("zip error: {0}")]
    Zip(#[from] ZipError),
    /// An error writing a member in `.npy` format.
    #[error("error writing npy member: {0}")]
    Npy(#[from] WriteNpyError),
}

fn corrupt(msg: impl Into<String>) -> ReadNpzError {
    ReadNpzError::CorruptArchive(msg.into())
}

/// The byte source backing an open archive.
enum Source {
    /// Read-only memory mapping.
    Map(Mmap),
    /// Read-write memory mapping.
    MapMut(MmapMut),
    /// Owned buffer, used when no mapping is available for the input (e.g. a
    /// non-seekable stream read to the end).
    Owned(Vec<u8>),
}

impl Source {
    fn bytes(&self) -> &[u8] {
        match self {
            Source::Map(map) => map,
            Source::MapMut(map) => map,
            Source::Owned(buf) => buf,
        }
    }

    fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Source::MapMut(map) => Some(map),
            Source::Map(_) | Source::Owned(_) => None,
        }
    }

    fn is_writable(&self) -> bool {
        matches!(self, Source::MapMut(_))
    }

    fn flush(&self) -> io::Result<()> {
        match self {
            Source::MapMut(map) => map.flush(),
            Source::Map(_) | Source::Owned(_) => Ok(()),
        }
    }
}

/// Strips the conventional `.npy` suffix from a member name, yielding the
/// array name `numpy.savez` would report.
fn array_name(member_name: &str) -> &str {
    member_name.strip_suffix(".npy").unwrap_or(member_name)
}

/// The member name `numpy.savez` would use for an array name.
fn member_name(name: &str) -> String {
    if name.ends_with(".npy") {
        name.to_string()
    } else {
        format!("{name}.npy")
    }
}

/// A memory-mapped `.npz` archive opened for random access.
///
/// Opening parses only the ZIP central directory; member payloads are touched
/// when requested. Stored members can be borrowed without copying, deflated
/// members are decompressed on each request and verified against their
/// recorded CRC-32. There is no caching: callers that request the same
/// compressed member repeatedly should hold on to the result themselves.
///
/// All read accessors take `&self`, so one open archive can serve multiple
/// threads concurrently without locking; the directory and the mapping are
/// immutable after open. Writable views take `&mut self` and are therefore
/// exclusive by construction.
///
/// A failed member access leaves the archive usable; only a failure to parse
/// the central directory is fatal, and that happens at open time.
///
/// # Example
///
/// ```no_run
/// use mmnpz::NpzArchive;
/// use ndarray::{CowArray, Ix1};
///
/// let npz = NpzArchive::open("data.npz")?;
/// for name in npz.names() {
///     println!("{name}");
/// }
/// let x: CowArray<f64, Ix1> = npz.by_name("x")?;
/// # Ok::<_, Box<dyn std::error::Error>>(())
/// ```
pub struct NpzArchive {
    /// `None` once the archive has been closed.
    source: Option<Source>,
    /// Members in central-directory order.
    entries: Vec<EntryRecord>,
    /// Member name to index in `entries`.
    lookup: HashMap<String, usize>,
}

impl NpzArchive {
    /// Opens the archive at `path` through a read-only memory mapping.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ReadNpzError> {
        let file = fs::File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        Self::from_source(Source::Map(map))
    }

    /// Opens the archive at `path` through a read-write memory mapping,
    /// enabling [`by_name_mut`](Self::by_name_mut) and
    /// [`bytes_by_name_mut`](Self::bytes_by_name_mut).
    ///
    /// Writes through the mapping modify the file in place and bypass the
    /// CRC-32 recorded in the archive, which becomes informational for the
    /// modified member. The archive layout is never changed: members cannot
    /// grow, shrink, or be added this way.
    pub fn open_mut<P: AsRef<Path>>(path: P) -> Result<Self, ReadNpzError> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Self::from_source(Source::MapMut(map))
    }

    /// Opens an archive held in an owned buffer.
    ///
    /// Zero-copy accessors borrow from the buffer exactly as they would from
    /// a mapping; writable views are not available.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ReadNpzError> {
        Self::from_source(Source::Owned(bytes))
    }

    /// Reads `reader` to the end and opens the result.
    ///
    /// This is the fallback for sources that cannot be memory-mapped, such as
    /// non-seekable streams.
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ReadNpzError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_bytes(bytes)
    }

    fn from_source(source: Source) -> Result<Self, ReadNpzError> {
        let entries = index::read_central_directory(source.bytes())?;
        let lookup = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.name.clone(), i))
            .collect();
        Ok(Self { source: Some(source), entries, lookup })
    }

    /// Returns the array names of all members, in central-directory order.
    ///
    /// The conventional `.npy` suffix is stripped, matching the names
    /// `numpy.savez` reports.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|entry| array_name(&entry.name))
    }

    /// Returns the number of members.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the archive has no members.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if the archive was opened with
    /// [`open_mut`](Self::open_mut) and has not been closed.
    pub fn is_writable(&self) -> bool {
        self.source.as_ref().is_some_and(Source::is_writable)
    }

    /// Flushes outstanding writes of a read-write mapping to the file.
    pub fn flush(&self) -> Result<(), ReadNpzError> {
        self.source()?.flush()?;
        Ok(())
    }

    /// Closes the archive, flushing and releasing its mapping.
    ///
    /// Any later access fails with [`ReadNpzError::UseAfterClose`]. Borrowed
    /// views cannot outlive the data they alias: while any exist, the borrow
    /// checker rejects calling `close`. Dropping the archive releases the
    /// mapping as well; `close` exists to observe flush errors and to free
    /// the mapping before the value goes out of scope.
    pub fn close(&mut self) -> Result<(), ReadNpzError> {
        if let Some(source) = self.source.take() {
            source.flush()?;
        }
        Ok(())
    }

    fn source(&self) -> Result<&Source, ReadNpzError> {
        self.source.as_ref().ok_or(ReadNpzError::UseAfterClose)
    }

    fn resolve(&self, name: &str) -> Result<&EntryRecord, ReadNpzError> {
        if let Some(&i) = self.lookup.get(name) {
            return Ok(&self.entries[i]);
        }
        // `numpy.savez` stores array `x` as member `x.npy`.
        self.lookup
            .get(&member_name(name))
            .map(|&i| &self.entries[i])
            .ok_or_else(|| ReadNpzError::EntryNotFound(name.to_string()))
    }

    fn entry_at(&self, index: usize) -> Result<&EntryRecord, ReadNpzError> {
        self.entries
            .get(index)
            .ok_or_else(|| ReadNpzError::EntryNotFound(format!("member #{index}")))
    }

    fn entry_bytes(&self, entry: &EntryRecord) -> Result<Cow<'_, [u8]>, ReadNpzError> {
        let bytes = self.source()?.bytes();
        let range = index::entry_data_range(bytes, entry)?;
        match entry.method {
            Method::Stored => {
                if entry.compressed_size != entry.uncompressed_size {
                    return Err(corrupt(format!(
                        "stored member `{}` declares differing sizes",
                        entry.name
                    )));
                }
                Ok(Cow::Borrowed(&bytes[range]))
            }
            Method::Deflated => materialize(&bytes[range], entry).map(Cow::Owned),
            Method::Other(method) => Err(ReadNpzError::UnsupportedCompression(method)),
        }
    }

    /// Returns the raw bytes of the member for `name` in `.npy` format.
    ///
    /// Stored members are borrowed straight from the mapping without copying;
    /// deflated members are decompressed into an owned buffer and verified
    /// against the recorded CRC-32.
    pub fn bytes_by_name(&self, name: &str) -> Result<Cow<'_, [u8]>, ReadNpzError> {
        self.entry_bytes(self.resolve(name)?)
    }

    /// Returns the raw bytes of the member at `index` in central-directory
    /// order, as [`bytes_by_name`](Self::bytes_by_name) would.
    pub fn bytes_by_index(&self, index: usize) -> Result<Cow<'_, [u8]>, ReadNpzError> {
        self.entry_bytes(self.entry_at(index)?)
    }

    /// Returns the raw bytes of the stored member for `name` as a mutable
    /// slice aliasing the read-write mapping.
    ///
    /// Fails with [`ReadNpzError::ReadOnly`] unless the archive was opened
    /// with [`open_mut`](Self::open_mut), and with
    /// [`ReadNpzError::CompressedWrite`] for deflated members.
    pub fn bytes_by_name_mut(&mut self, name: &str) -> Result<&mut [u8], ReadNpzError> {
        let entry = self.resolve(name)?.clone();
        match entry.method {
            Method::Stored => {}
            Method::Deflated => return Err(ReadNpzError::CompressedWrite),
            Method::Other(method) => return Err(ReadNpzError::UnsupportedCompression(method)),
        }
        if entry.compressed_size != entry.uncompressed_size {
            return Err(corrupt(format!(
                "stored member `{}` declares differing sizes",
                entry.name
            )));
        }
        let source = self.source.as_mut().ok_or(ReadNpzError::UseAfterClose)?;
        let range = index::entry_data_range(source.bytes(), &entry)?;
        let bytes = source.bytes_mut().ok_or(ReadNpzError::ReadOnly)?;
        Ok(&mut bytes[range])
    }
}

/// Decompresses a deflated member and verifies its length and CRC-32.
#[cfg(feature = "deflate")]
fn materialize(compressed: &[u8], entry: &EntryRecord) -> Result<Vec<u8>, ReadNpzError> {
    let declared = usize::try_from(entry.uncompressed_size)
        .map_err(|_| corrupt(format!("member `{}` is too large for this target", entry.name)))?;
    // The capacity is capped so a forged size field cannot trigger a huge
    // up-front allocation.
    let mut out = Vec::with_capacity(declared.min(1 << 20));
    // One extra byte so an over-long stream is detected as a length mismatch
    // instead of silently truncated.
    let mut decoder = flate2::read::DeflateDecoder::new(compressed)
        .take(entry.uncompressed_size.saturating_add(1));
    decoder
        .read_to_end(&mut out)
        .map_err(ReadNpzError::Decompression)?;
    if out.len() != declared {
        return Err(corrupt(format!(
            "member `{}` decompressed to {} bytes, expected {}",
            entry.name,
            out.len(),
            declared
        )));
    }
    let mut crc = flate2::Crc::new();
    crc.update(&out);
    if crc.sum() != entry.crc32 {
        return Err(corrupt(format!("CRC-32 mismatch for member `{}`", entry.name)));
    }
    Ok(out)
}

#[cfg(not(feature = "deflate"))]
fn materialize(_compressed: &[u8], _entry: &EntryRecord) -> Result<Vec<u8>, ReadNpzError> {
    Err(ReadNpzError::UnsupportedCompression(8))
}

/// A writer for `.npz` archives.
///
/// Members are written in `.npy` format through the zip container layer.
/// Stored members are aligned to 64 bytes so that an archive written here can
/// later be memory-mapped and bound as zero-copy views.
///
/// # Example
///
/// ```no_run
/// use mmnpz::NpzWriter;
/// use ndarray::array;
/// use std::fs::File;
///
/// let mut writer = NpzWriter::new(File::create("data.npz")?);
/// writer.add_array("a", &array![[1i32, 2], [3, 4]])?;
/// writer.add_array("b", &array![7.0f64, 8.0])?;
/// writer.finish()?;
/// # Ok::<_, Box<dyn std::error::Error>>(())
/// ```
pub struct NpzWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    method: CompressionMethod,
}

impl<W: Write + Seek> NpzWriter<W> {
    /// Creates a writer storing members uncompressed.
    pub fn new(writer: W) -> Self {
        Self { zip: ZipWriter::new(writer), method: CompressionMethod::Stored }
    }

    /// Creates a writer compressing members with deflate.
    ///
    /// Compressed members cannot be bound as zero-copy views when the archive
    /// is read back; they are decompressed on access instead.
    #[cfg(feature = "deflate")]
    pub fn new_compressed(writer: W) -> Self {
        Self { zip: ZipWriter::new(writer), method: CompressionMethod::Deflated }
    }

    fn options(&self, payload_len: u64) -> SimpleFileOptions {
        let mut options = SimpleFileOptions::default()
            .compression_method(self.method)
            .large_file(payload_len >= u64::from(u32::MAX));
        if self.method == CompressionMethod::Stored {
            options = options.with_alignment(MEMBER_ALIGNMENT);
        }
        options
    }

    /// Adds a member holding the given complete `.npy`-format bytes.
    ///
    /// `name` is the array name; the conventional `.npy` suffix is appended
    /// to form the member name unless already present.
    pub fn add_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<(), WriteNpzError> {
        self.zip
            .start_file(member_name(name), self.options(bytes.len() as u64))?;
        self.zip.write_all(bytes)?;
        Ok(())
    }

    /// Finishes the archive, writing the central directory, and returns the
    /// inner writer.
    pub fn finish(self) -> Result<W, WriteNpzError> {
        Ok(self.zip.finish()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_names_follow_the_numpy_convention() {
        assert_eq!(member_name("x"), "x.npy");
        assert_eq!(member_name("x.npy"), "x.npy");
        assert_eq!(array_name("x.npy"), "x");
        assert_eq!(array_name("x"), "x");
        // Only a trailing suffix is stripped.
        assert_eq!(array_name("x.npy.bak"), "x.npy.bak");
    }

    #[test]
    fn owned_archives_report_read_only_for_mutable_access() {
        // A minimal archive: just an end-of-central-directory record.
        let mut eocd = b"PK\x05\x06".to_vec();
        eocd.extend_from_slice(&[0u8; 18]);
        let mut npz = NpzArchive::from_bytes(eocd).unwrap();
        assert!(!npz.is_writable());
        match npz.bytes_by_name_mut("x") {
            Err(ReadNpzError::EntryNotFound(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
