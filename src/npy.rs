mod elements;
pub mod header;

pub use self::elements::ParseBoolError;
pub use self::header::ParseHeaderError;
use self::header::{FormatHeaderError, ReadHeaderError, WriteHeaderError};
use py_literal::Value as PyValue;
use std::{fs, io};
use thiserror::Error;

/// Read an `.npy` file located at the specified path.
///
/// This is a convenience function for `File::open` followed by
/// [`ReadNpyExt::read_npy`].
///
/// # Example
///
/// ```no_run
/// use mmnpz::read_npy;
/// use ndarray::Array2;
/// # use mmnpz::ReadNpyError;
///
/// let arr: Array2<i32> = read_npy("array.npy")?;
/// # Ok::<_, ReadNpyError>(())
/// ```
pub fn read_npy<P, T>(path: P) -> Result<T, ReadNpyError>
where
    P: AsRef<std::path::Path>,
    T: ReadNpyExt,
{
    T::read_npy(fs::File::open(path)?)
}

/// Writes an array to an `.npy` file at the specified path.
///
/// This function will create the file if it does not exist, or overwrite it if
/// it does.
///
/// This is a convenience function for `BufWriter::new(File::create(path)?)`
/// followed by [`WriteNpyExt::write_npy`].
///
/// # Example
///
/// ```no_run
/// use mmnpz::write_npy;
/// use ndarray::array;
/// # use mmnpz::WriteNpyError;
///
/// let arr = array![[1, 2, 3], [4, 5, 6]];
/// write_npy("array.npy", &arr)?;
/// # Ok::<_, WriteNpyError>(())
/// ```
pub fn write_npy<P, T>(path: P, array: &T) -> Result<(), WriteNpyError>
where
    P: AsRef<std::path::Path>,
    T: WriteNpyExt,
{
    array.write_npy(io::BufWriter::new(fs::File::create(path)?))
}

/// An array element type that can be written to an `.npy` or `.npz` file.
pub trait WritableElement: Sized {
    /// Returns a descriptor of the type that can be used in the header.
    fn type_descriptor() -> PyValue;

    /// Writes a single instance of `Self` to the writer.
    fn write<W: io::Write>(&self, writer: W) -> Result<(), WriteDataError>;

    /// Writes a slice of `Self` to the writer.
    fn write_slice<W: io::Write>(slice: &[Self], writer: W) -> Result<(), WriteDataError>;
}

/// Extension trait for writing an array to `.npy` files.
///
/// If writes are expensive (e.g. for a file or network socket) and the layout
/// of the array is not known to be in standard or Fortran layout, it is
/// strongly recommended to wrap the writer in a [`std::io::BufWriter`]. For the
/// sake of convenience, this method calls [`io::Write::flush()`] on the writer
/// before returning.
pub trait WriteNpyExt {
    /// Writes the array to `writer` in [`.npy`
    /// format](https://numpy.org/doc/stable/reference/generated/numpy.lib.format.html).
    ///
    /// This function is the Rust equivalent of
    /// [`numpy.save`](https://numpy.org/doc/stable/reference/generated/numpy.save.html).
    fn write_npy<W: io::Write>(&self, writer: W) -> Result<(), WriteNpyError>;
}

/// An error writing array data.
#[derive(Debug, Error)]
pub enum WriteDataError {
    /// An error caused by I/O.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// An error writing a `.npy` file.
#[derive(Debug, Error)]
pub enum WriteNpyError {
    /// An error caused by I/O.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// An error formatting the header.
    #[error("error formatting header: {0}")]
    FormatHeader(#[from] FormatHeaderError),
}

impl From<WriteHeaderError> for WriteNpyError {
    fn from(err: WriteHeaderError) -> Self {
        match err {
            WriteHeaderError::Io(err) => Self::Io(err),
            WriteHeaderError::Format(err) => Self::FormatHeader(err),
        }
    }
}

impl From<WriteDataError> for WriteNpyError {
    fn from(err: WriteDataError) -> Self {
        match err {
            WriteDataError::Io(err) => Self::Io(err),
        }
    }
}

/// An array element type that can be read from an `.npy` or `.npz` file.
pub trait ReadableElement: Sized {
    /// Reads to the end of the `reader`, creating a `Vec` of length `len`.
    ///
    /// This method should return `Err(_)` in at least the following cases:
    ///
    /// * if the `type_desc` does not match `Self`
    /// * if the `reader` has fewer elements than `len`
    /// * if the `reader` has extra bytes after reading `len` elements
    fn read_to_end_exact_vec<R: io::Read>(
        reader: R,
        type_desc: &PyValue,
        len: usize,
    ) -> Result<Vec<Self>, ReadDataError>;
}

/// Extension trait for reading an array from `.npy` files.
///
/// # Example
///
/// ```no_run
/// use mmnpz::ReadNpyExt;
/// use ndarray::Array2;
/// use std::fs::File;
/// # use mmnpz::ReadNpyError;
///
/// let reader = File::open("array.npy")?;
/// let arr = Array2::<i32>::read_npy(reader)?;
/// # Ok::<_, ReadNpyError>(())
/// ```
pub trait ReadNpyExt: Sized {
    /// Reads the array from `reader` in [`.npy`
    /// format](https://numpy.org/doc/stable/reference/generated/numpy.lib.format.html).
    ///
    /// This function is the Rust equivalent of
    /// [`numpy.load`](https://numpy.org/doc/stable/reference/generated/numpy.load.html)
    /// for `.npy` files.
    fn read_npy<R: io::Read>(reader: R) -> Result<Self, ReadNpyError>;
}

/// An error reading array data.
#[derive(Debug, Error)]
pub enum ReadDataError {
    /// An error caused by I/O.
    #[error("I/O error: {0}")]
    Io(io::Error),
    /// An error parsing the booleans.
    #[error("error parsing data: {0}")]
    ParseBool(#[from] ParseBoolError),
    /// The type descriptor does not match the element type.
    #[error("incorrect descriptor ({0}) for this type")]
    WrongDescriptor(PyValue),
    /// The file does not contain all the data described in the header.
    #[error("reached EOF before reading all data")]
    MissingData,
    /// Extra bytes are present between the end of the data and the end of the
    /// file.
    #[error("file had {0} extra bytes before EOF")]
    ExtraBytes(usize),
}

impl From<io::Error> for ReadDataError {
    /// Performs the conversion.
    ///
    /// If the error kind is `UnexpectedEof`, the `MissingData` variant is
    /// returned. Otherwise, the `Io` variant is returned.
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Self::MissingData,
            _ => Self::Io(err),
        }
    }
}

/// An error reading a `.npy` file.
#[derive(Debug, Error)]
pub enum ReadNpyError {
    /// An error caused by I/O.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// An error parsing the file header.
    #[error("error parsing header: {0}")]
    ParseHeader(#[from] ParseHeaderError),
    /// An error parsing the booleans.
    #[error("error parsing data: {0}")]
    ParseBool(ParseBoolError),
    /// Overflow while computing the length of the array (in units of bytes or
    /// the number of elements) from the shape described in the file header.
    #[error("overflow computing length from shape")]
    LengthOverflow,
    /// An error caused by incorrect `Dimension` type.
    #[error("ndim {1} of array did not match Dimension type with NDIM = {0:?}")]
    WrongNdim(Option<usize>, usize),
    /// The type descriptor does not match the element type.
    #[error("incorrect descriptor ({0}) for this type")]
    WrongDescriptor(PyValue),
    /// The file does not contain all the data described in the header.
    #[error("reached EOF before reading all data")]
    MissingData,
    /// Extra bytes are present between the end of the data and the end of the
    /// file.
    #[error("file had {0} extra bytes before EOF")]
    ExtraBytes(usize),
}

impl From<ReadHeaderError> for ReadNpyError {
    fn from(err: ReadHeaderError) -> Self {
        match err {
            ReadHeaderError::Io(err) => Self::Io(err),
            ReadHeaderError::Parse(err) => Self::ParseHeader(err),
        }
    }
}

impl From<ReadDataError> for ReadNpyError {
    fn from(err: ReadDataError) -> Self {
        match err {
            ReadDataError::Io(err) => Self::Io(err),
            ReadDataError::WrongDescriptor(desc) => Self::WrongDescriptor(desc),
            ReadDataError::MissingData => Self::MissingData,
            ReadDataError::ExtraBytes(nbytes) => Self::ExtraBytes(nbytes),
            ReadDataError::ParseBool(err) => Self::ParseBool(err),
        }
    }
}

/// An array element type that can be viewed (without copying) in an `.npy`
/// file.
pub trait ViewElement: Sized {
    /// Casts `bytes` into a slice of elements of length `len`.
    ///
    /// Returns `Err(_)` in at least the following cases:
    ///
    ///   * if the `type_desc` does not match `Self` with native endianness
    ///   * if the `bytes` slice is misaligned for elements of type `Self`
    ///   * if the `bytes` slice is too short for `len` elements
    ///   * if the `bytes` slice has extra bytes after `len` elements
    ///
    /// May panic if `len * size_of::<Self>()` overflows.
    fn bytes_as_slice<'a>(
        bytes: &'a [u8],
        type_desc: &PyValue,
        len: usize,
    ) -> Result<&'a [Self], ViewDataError>;
}

/// An array element type that can be mutably viewed (without copying) in an
/// `.npy` file.
pub trait ViewMutElement: Sized {
    /// Casts `bytes` into a mutable slice of elements of length `len`.
    ///
    /// Returns `Err(_)` in at least the following cases:
    ///
    ///   * if the `type_desc` does not match `Self` with native endianness
    ///   * if the `bytes` slice is misaligned for elements of type `Self`
    ///   * if the `bytes` slice is too short for `len` elements
    ///   * if the `bytes` slice has extra bytes after `len` elements
    ///
    /// May panic if `len * size_of::<Self>()` overflows.
    fn bytes_as_mut_slice<'a>(
        bytes: &'a mut [u8],
        type_desc: &PyValue,
        len: usize,
    ) -> Result<&'a mut [Self], ViewDataError>;
}

/// Extension trait for creating a view from a buffer containing an `.npy` file.
///
/// The primary use-case for this is viewing a memory-mapped `.npy` file, or
/// one stored member of a memory-mapped `.npz` archive.
///
/// # Notes
///
/// - For types for which not all bit patterns are valid, such as `bool`, the
///   implementation iterates over all of the elements when creating the view to
///   ensure they have a valid bit pattern.
///
/// - The data in the buffer must be properly aligned for the element type.
///   Mappings are page-aligned and the `.npy` header is padded so that its
///   length is a multiple of 64 bytes, so this is only a concern for buffers
///   that do not start on an element boundary.
pub trait ViewNpyExt<'a>: Sized {
    /// Creates an `ArrayView` from a buffer containing an `.npy` file.
    fn view_npy(buf: &'a [u8]) -> Result<Self, ViewNpyError>;
}

/// Extension trait for creating a mutable view from a mutable buffer
/// containing an `.npy` file.
///
/// The primary use-case for this is modifying a memory-mapped `.npy` file.
/// Modifying the elements in the view will modify the file. Modifying the
/// shape/strides of the view will *not* modify the shape/strides of the array
/// in the file.
///
/// Alignment and bit-pattern notes on [`ViewNpyExt`] apply here too.
pub trait ViewMutNpyExt<'a>: Sized {
    /// Creates an `ArrayViewMut` from a mutable buffer containing an `.npy`
    /// file.
    fn view_mut_npy(buf: &'a mut [u8]) -> Result<Self, ViewNpyError>;
}

/// An error viewing array data.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ViewDataError {
    /// The type descriptor does not match the element type.
    #[error("incorrect descriptor ({0}) for this type")]
    WrongDescriptor(PyValue),
    /// The type descriptor does not match the native endianness.
    #[error("descriptor does not match native endianness")]
    NonNativeEndian,
    /// The start of the data is not properly aligned for the element type.
    #[error("start of data is not properly aligned for the element type")]
    Misaligned,
    /// The file does not contain all the data described in the header.
    #[error("missing {0} bytes of data specified in header")]
    MissingBytes(usize),
    /// Extra bytes are present between the end of the data and the end of the
    /// file.
    #[error("file had {0} extra bytes before EOF")]
    ExtraBytes(usize),
    /// An error parsing the booleans.
    #[error("invalid data for element type: {0}")]
    ParseBool(#[from] ParseBoolError),
}

/// An error viewing a `.npy` file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ViewNpyError {
    /// An error caused by I/O.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// An error parsing the file header.
    #[error("error parsing header: {0}")]
    ParseHeader(#[from] ParseHeaderError),
    /// An error parsing the booleans.
    #[error("invalid data for element type: {0}")]
    ParseBool(ParseBoolError),
    /// Overflow while computing the length of the array (in units of bytes or
    /// the number of elements) from the shape described in the file header.
    #[error("overflow computing length from shape")]
    LengthOverflow,
    /// An error caused by incorrect `Dimension` type.
    #[error("ndim {1} of array did not match Dimension type with NDIM = {0:?}")]
    WrongNdim(Option<usize>, usize),
    /// The type descriptor does not match the element type.
    #[error("incorrect descriptor ({0}) for this type")]
    WrongDescriptor(PyValue),
    /// The type descriptor does not match the native endianness.
    #[error("descriptor does not match native endianness")]
    NonNativeEndian,
    /// The start of the data is not properly aligned for the element type.
    #[error("start of data is not properly aligned for the element type")]
    MisalignedData,
    /// The file does not contain all the data described in the header.
    #[error("missing {0} bytes of data specified in header")]
    MissingBytes(usize),
    /// Extra bytes are present between the end of the data and the end of the
    /// file.
    #[error("file had {0} extra bytes before EOF")]
    ExtraBytes(usize),
}

impl From<ReadHeaderError> for ViewNpyError {
    fn from(err: ReadHeaderError) -> Self {
        match err {
            ReadHeaderError::Io(err) => Self::Io(err),
            ReadHeaderError::Parse(err) => Self::ParseHeader(err),
        }
    }
}

impl From<ViewDataError> for ViewNpyError {
    fn from(err: ViewDataError) -> Self {
        match err {
            ViewDataError::WrongDescriptor(desc) => Self::WrongDescriptor(desc),
            ViewDataError::NonNativeEndian => Self::NonNativeEndian,
            ViewDataError::Misaligned => Self::MisalignedData,
            ViewDataError::MissingBytes(nbytes) => Self::MissingBytes(nbytes),
            ViewDataError::ExtraBytes(nbytes) => Self::ExtraBytes(nbytes),
            ViewDataError::ParseBool(err) => Self::ParseBool(err),
        }
    }
}
