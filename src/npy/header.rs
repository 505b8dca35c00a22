use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use num_traits::ToPrimitive;
use py_literal::{
    FormatError as PyValueFormatError, ParseError as PyValueParseError, Value as PyValue,
};
use std::{convert::TryFrom, io};
use thiserror::Error;

/// Magic string to indicate npy format.
const MAGIC_STRING: &[u8] = b"\x93NUMPY";

/// The total header length (including magic string, version number, header
/// length value, array format description, padding, and final newline) must be
/// evenly divisible by this value.
///
/// Keeping this a multiple of the largest element alignment means the payload
/// of a page-aligned mapping starts on an element boundary.
const HEADER_DIVISOR: usize = 64;

/// An error parsing the header of an npy-format payload.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseHeaderError {
    /// The start of the payload does not match the magic string.
    #[error("start does not match magic string")]
    MagicString,
    /// The version number is not recognized.
    #[error("unknown version number: {major}.{minor}")]
    Version {
        /// Major version number.
        major: u8,
        /// Minor version number.
        minor: u8,
    },
    /// Indicates that the `HEADER_LEN` doesn't fit in `usize`.
    #[error("HEADER_LEN {0} does not fit in `usize`")]
    HeaderLengthOverflow(u32),
    /// The array format string contains non-ASCII characters. This is an
    /// error for format versions 1.0 and 2.0.
    #[error("non-ascii in array format string; not allowed in versions 1.0 and 2.0")]
    NonAscii,
    /// Error parsing the array format string as UTF-8. Only applies to
    /// format version 3.0.
    #[error("error parsing array format string as UTF-8: {0}")]
    Utf8Parse(#[from] std::str::Utf8Error),
    /// An unknown key was found in the metadata dictionary.
    #[error("unknown key: {0}")]
    UnknownKey(PyValue),
    /// A required key was missing from the metadata dictionary.
    #[error("missing key: {0}")]
    MissingKey(&'static str),
    /// An illegal value was found for a key in the metadata dictionary.
    #[error("illegal value for key {key}: {value}")]
    IllegalValue {
        /// The key for which the value was illegal.
        key: &'static str,
        /// The illegal value.
        value: PyValue,
    },
    /// Error parsing the metadata dictionary.
    #[error("error parsing metadata dict: {0}")]
    DictParse(#[from] PyValueParseError),
    /// The metadata is not a dictionary.
    #[error("metadata is not a dict: {0}")]
    MetaNotDict(PyValue),
    /// The header is missing a newline at the end.
    #[error("newline missing at end of header")]
    MissingNewline,
}

/// An error reading a header.
#[derive(Debug, Error)]
pub enum ReadHeaderError {
    /// An error caused by I/O.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// An error parsing the header.
    #[error("error parsing header: {0}")]
    Parse(#[from] ParseHeaderError),
}

/// An error formatting a header.
#[derive(Debug, Error)]
pub enum FormatHeaderError {
    /// An error formatting the metadata dictionary.
    #[error("error formatting Python value: {0}")]
    PyValue(#[from] PyValueFormatError),
    /// The total header length overflows `usize`, or `HEADER_LEN` exceeds the
    /// maximum encodable value.
    #[error("the header is too long")]
    HeaderTooLong,
}

/// An error writing a header.
#[derive(Debug, Error)]
pub enum WriteHeaderError {
    /// An error caused by I/O.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// An error formatting the header.
    #[error("error formatting header: {0}")]
    Format(#[from] FormatHeaderError),
}

#[derive(Clone, Copy)]
#[allow(non_camel_case_types)]
#[non_exhaustive]
enum Version {
    V1_0,
    V2_0,
    V3_0,
}

impl Version {
    /// Number of bytes taken up by version number (1 byte for major version, 1
    /// byte for minor version).
    const VERSION_NUM_BYTES: usize = 2;

    fn from_array(bytes: [u8; Self::VERSION_NUM_BYTES]) -> Result<Self, ParseHeaderError> {
        match bytes {
            [0x01, 0x00] => Ok(Version::V1_0),
            [0x02, 0x00] => Ok(Version::V2_0),
            [0x03, 0x00] => Ok(Version::V3_0),
            [major, minor] => Err(ParseHeaderError::Version { major, minor }),
        }
    }

    /// Major version number.
    const fn major_version(self) -> u8 {
        match self {
            Version::V1_0 => 1,
            Version::V2_0 => 2,
            Version::V3_0 => 3,
        }
    }

    /// Minor version number.
    const fn minor_version(self) -> u8 {
        match self {
            Version::V1_0 | Version::V2_0 | Version::V3_0 => 0,
        }
    }

    /// Number of bytes in representation of header length.
    const fn header_len_num_bytes(self) -> usize {
        match self {
            Version::V1_0 => 2,
            Version::V2_0 | Version::V3_0 => 4,
        }
    }

    /// Read header length.
    fn read_header_len<R: io::Read>(self, mut reader: R) -> Result<usize, ReadHeaderError> {
        match self {
            Version::V1_0 => Ok(usize::from(reader.read_u16::<LittleEndian>()?)),
            Version::V2_0 | Version::V3_0 => {
                let header_len: u32 = reader.read_u32::<LittleEndian>()?;
                Ok(usize::try_from(header_len)
                    .map_err(|_| ParseHeaderError::HeaderLengthOverflow(header_len))?)
            }
        }
    }

    /// Format header length as bytes for writing to file.
    ///
    /// Returns `None` if the value of `header_len` is too large for this npy
    /// version.
    fn format_header_len(self, header_len: usize) -> Option<Vec<u8>> {
        match self {
            Version::V1_0 => {
                let header_len = u16::try_from(header_len).ok()?;
                let mut out = vec![0; self.header_len_num_bytes()];
                LittleEndian::write_u16(&mut out, header_len);
                Some(out)
            }
            Version::V2_0 | Version::V3_0 => {
                let header_len: u32 = u32::try_from(header_len).ok()?;
                let mut out = vec![0; self.header_len_num_bytes()];
                LittleEndian::write_u32(&mut out, header_len);
                Some(out)
            }
        }
    }

    /// Computes the total header length, formatted `HEADER_LEN` value, and
    /// padding length for this npy version.
    ///
    /// `unpadded_arr_format` is the Python literal describing the array
    /// format, formatted as an ASCII string without any padding.
    ///
    /// Returns `None` if the total header length overflows `usize` or if the
    /// value of `HEADER_LEN` is too large for this npy version.
    fn compute_lengths(self, unpadded_arr_format: &[u8]) -> Option<HeaderLengthInfo> {
        /// Length of a '\n' char in bytes.
        const NEWLINE_LEN: usize = b"\n".len();

        let prefix_len =
            MAGIC_STRING.len() + Version::VERSION_NUM_BYTES + self.header_len_num_bytes();
        let unpadded_total_len = prefix_len
            .checked_add(unpadded_arr_format.len())?
            .checked_add(NEWLINE_LEN)?;
        let padding_len = HEADER_DIVISOR - unpadded_total_len % HEADER_DIVISOR;
        let total_len = unpadded_total_len.checked_add(padding_len)?;
        let header_len = total_len - prefix_len;
        let formatted_header_len = self.format_header_len(header_len)?;
        Some(HeaderLengthInfo { total_len, formatted_header_len })
    }
}

struct HeaderLengthInfo {
    /// Total header length (including magic string, version number, header
    /// length value, array format description, padding, and final newline).
    total_len: usize,
    /// Formatted `HEADER_LEN` value. (This is the number of bytes in the array
    /// format description, padding, and final newline.)
    formatted_header_len: Vec<u8>,
}

/// The array metadata carried at the start of every npy-format payload:
/// element type descriptor, memory order, and shape.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Header {
    pub type_descriptor: PyValue,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
}

impl Header {
    fn from_py_value(value: PyValue) -> Result<Self, ParseHeaderError> {
        let PyValue::Dict(dict) = value else {
            return Err(ParseHeaderError::MetaNotDict(value));
        };
        let mut type_descriptor = None;
        let mut fortran_order = None;
        let mut shape = None;
        for (key, value) in dict {
            match &key {
                PyValue::String(k) if k == "descr" => {
                    type_descriptor = Some(value);
                }
                PyValue::String(k) if k == "fortran_order" => {
                    if let PyValue::Boolean(b) = value {
                        fortran_order = Some(b);
                    } else {
                        return Err(ParseHeaderError::IllegalValue { key: "fortran_order", value });
                    }
                }
                PyValue::String(k) if k == "shape" => {
                    fn parse_shape(value: &PyValue) -> Option<Vec<usize>> {
                        value
                            .as_tuple()?
                            .iter()
                            .map(|elem| elem.as_integer()?.to_usize())
                            .collect()
                    }
                    if let Some(s) = parse_shape(&value) {
                        shape = Some(s);
                    } else {
                        return Err(ParseHeaderError::IllegalValue { key: "shape", value });
                    }
                }
                _ => return Err(ParseHeaderError::UnknownKey(key)),
            }
        }
        let type_descriptor = type_descriptor.ok_or(ParseHeaderError::MissingKey("descr"))?;
        let fortran_order = fortran_order.ok_or(ParseHeaderError::MissingKey("fortran_order"))?;
        let shape = shape.ok_or(ParseHeaderError::MissingKey("shape"))?;
        Ok(Self { type_descriptor, fortran_order, shape })
    }

    pub(crate) fn from_reader<R: io::Read>(mut reader: R) -> Result<Self, ReadHeaderError> {
        // Check for magic string
        {
            let mut buf = [0; MAGIC_STRING.len()];
            reader.read_exact(&mut buf)?;
            if buf != MAGIC_STRING {
                Err(ParseHeaderError::MagicString)?;
            }
        }

        // Get version number
        let mut buf = [0; Version::VERSION_NUM_BYTES];
        reader.read_exact(&mut buf)?;
        let version = Version::from_array(buf)?;

        // Get `HEADER_LEN`
        let header_len = version.read_header_len(&mut reader)?;

        // Parse the dictionary describing the array's format
        let mut buf = vec![0; header_len];
        reader.read_exact(&mut buf)?;
        let without_newline = match buf.split_last() {
            Some((&b'\n', rest)) => rest,
            Some(_) | None => Err(ParseHeaderError::MissingNewline)?,
        };
        let header_str = match version {
            Version::V1_0 | Version::V2_0 => {
                if without_newline.is_ascii() {
                    // ASCII strings are always valid UTF-8
                    unsafe { std::str::from_utf8_unchecked(without_newline) }
                } else {
                    Err(ParseHeaderError::NonAscii)?
                }
            }
            Version::V3_0 => {
                std::str::from_utf8(without_newline).map_err(ParseHeaderError::from)?
            }
        };
        let arr_format = header_str.parse().map_err(ParseHeaderError::from)?;
        Ok(Self::from_py_value(arr_format)?)
    }

    fn to_py_value(&self) -> PyValue {
        PyValue::Dict(vec![
            (
                PyValue::String("descr".to_string()),
                self.type_descriptor.clone(),
            ),
            (
                PyValue::String("fortran_order".to_string()),
                PyValue::Boolean(self.fortran_order),
            ),
            (
                PyValue::String("shape".to_string()),
                PyValue::Tuple(
                    self.shape
                        .iter()
                        .map(|&elem| PyValue::Integer(elem.into()))
                        .collect(),
                ),
            ),
        ])
    }

    fn to_bytes(&self) -> Result<Vec<u8>, FormatHeaderError> {
        // Metadata describing array's format as ASCII string
        let mut arr_format = Vec::new();
        self.to_py_value().write_ascii(&mut arr_format)?;

        // Determine appropriate version based on header length, and compute
        // length information.
        let (version, length_info) = [Version::V1_0, Version::V2_0]
            .iter()
            .find_map(|&version| Some((version, version.compute_lengths(&arr_format)?)))
            .ok_or(FormatHeaderError::HeaderTooLong)?;

        // Write the header
        let mut out = Vec::with_capacity(length_info.total_len);
        out.extend_from_slice(MAGIC_STRING);
        out.push(version.major_version());
        out.push(version.minor_version());
        out.extend_from_slice(&length_info.formatted_header_len);
        out.extend_from_slice(&arr_format);
        out.resize(length_info.total_len - 1, b' ');
        out.push(b'\n');

        // Verify the length of the header
        debug_assert_eq!(out.len(), length_info.total_len);
        debug_assert_eq!(out.len() % HEADER_DIVISOR, 0);

        Ok(out)
    }

    pub(crate) fn write<W: io::Write>(&self, mut writer: W) -> Result<(), WriteHeaderError> {
        writer.write_all(&self.to_bytes()?)?;
        Ok(())
    }
}
