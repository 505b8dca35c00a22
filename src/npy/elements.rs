use super::{
    ReadDataError, ReadableElement, ViewDataError, ViewElement, ViewMutElement, WritableElement,
    WriteDataError,
};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use py_literal::Value as PyValue;
use std::{io, mem, slice};
use thiserror::Error;

/// An error parsing a `bool` from file data.
#[derive(Debug, Error)]
#[error("invalid byte {0:#04x} for bool")]
pub struct ParseBoolError(u8);

/// Byte order declared by a type descriptor.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

impl Endian {
    const NATIVE: Endian = if cfg!(target_endian = "little") {
        Endian::Little
    } else {
        Endian::Big
    };

    const fn symbol(self) -> char {
        match self {
            Endian::Little => '<',
            Endian::Big => '>',
        }
    }
}

/// The descriptor string for `code` in native byte order, e.g. `"<i4"` for
/// `"i4"` on a little-endian target.
fn native_descriptor(code: &str) -> String {
    format!("{}{}", Endian::NATIVE.symbol(), code)
}

/// Determines the byte order declared by `type_desc` for a multi-byte element
/// with the given type code.
fn descriptor_endian(type_desc: &PyValue, code: &str) -> Result<Endian, ReadDataError> {
    match type_desc {
        PyValue::String(s) if s.len() == code.len() + 1 && s.as_bytes()[1..] == *code.as_bytes() => {
            match s.as_bytes()[0] {
                b'<' => Ok(Endian::Little),
                b'>' => Ok(Endian::Big),
                _ => Err(ReadDataError::WrongDescriptor(type_desc.clone())),
            }
        }
        _ => Err(ReadDataError::WrongDescriptor(type_desc.clone())),
    }
}

/// Checks that `type_desc` matches a multi-byte element with the given type
/// code in native byte order (required for zero-copy views).
fn check_native_descriptor(type_desc: &PyValue, code: &str) -> Result<(), ViewDataError> {
    match descriptor_endian(type_desc, code) {
        Ok(endian) if endian == Endian::NATIVE => Ok(()),
        Ok(_) => Err(ViewDataError::NonNativeEndian),
        Err(_) => Err(ViewDataError::WrongDescriptor(type_desc.clone())),
    }
}

/// Checks that `type_desc` is exactly the given single-byte descriptor.
fn check_exact_descriptor(type_desc: &PyValue, desc: &str) -> Result<(), ReadDataError> {
    match type_desc {
        PyValue::String(s) if s == desc => Ok(()),
        _ => Err(ReadDataError::WrongDescriptor(type_desc.clone())),
    }
}

/// Verifies that `reader` is exhausted.
fn expect_end<R: io::Read>(mut reader: R) -> Result<(), ReadDataError> {
    let mut extra = Vec::new();
    let n = reader.read_to_end(&mut extra)?;
    if n == 0 {
        Ok(())
    } else {
        Err(ReadDataError::ExtraBytes(n))
    }
}

/// Views `slice` as raw bytes in memory order.
fn bytes_of<T>(slice: &[T]) -> &[u8] {
    // All element types here have no padding and no invalid byte patterns to
    // leak.
    unsafe { slice::from_raw_parts(slice.as_ptr().cast(), mem::size_of_val(slice)) }
}

/// Checks alignment and exact length, then reinterprets `bytes` as a slice of
/// `len` elements.
///
/// # Safety
///
/// Every byte pattern of `T` must be a valid `T`.
unsafe fn cast_slice<T>(bytes: &[u8], len: usize) -> Result<&[T], ViewDataError> {
    check_cast::<T>(bytes, len)?;
    Ok(slice::from_raw_parts(bytes.as_ptr().cast(), len))
}

/// Mutable variant of [`cast_slice`].
///
/// # Safety
///
/// Every byte pattern of `T` must be a valid `T`.
unsafe fn cast_slice_mut<T>(bytes: &mut [u8], len: usize) -> Result<&mut [T], ViewDataError> {
    check_cast::<T>(bytes, len)?;
    Ok(slice::from_raw_parts_mut(bytes.as_mut_ptr().cast(), len))
}

fn check_cast<T>(bytes: &[u8], len: usize) -> Result<(), ViewDataError> {
    if bytes.as_ptr().align_offset(mem::align_of::<T>()) != 0 {
        return Err(ViewDataError::Misaligned);
    }
    let needed = len * mem::size_of::<T>();
    if bytes.len() < needed {
        Err(ViewDataError::MissingBytes(needed - bytes.len()))
    } else if bytes.len() > needed {
        Err(ViewDataError::ExtraBytes(bytes.len() - needed))
    } else {
        Ok(())
    }
}

macro_rules! impl_writable_primitive {
    ($elem:ty, $desc:expr) => {
        impl WritableElement for $elem {
            fn type_descriptor() -> PyValue {
                PyValue::String($desc)
            }

            fn write<W: io::Write>(&self, mut writer: W) -> Result<(), WriteDataError> {
                writer.write_all(&self.to_ne_bytes())?;
                Ok(())
            }

            fn write_slice<W: io::Write>(slice: &[Self], mut writer: W) -> Result<(), WriteDataError> {
                writer.write_all(bytes_of(slice))?;
                Ok(())
            }
        }
    };
}

macro_rules! impl_multi_byte {
    ($elem:ty, $code:expr, $read_into:ident) => {
        impl_writable_primitive!($elem, native_descriptor($code));

        impl ReadableElement for $elem {
            fn read_to_end_exact_vec<R: io::Read>(
                mut reader: R,
                type_desc: &PyValue,
                len: usize,
            ) -> Result<Vec<Self>, ReadDataError> {
                let endian = descriptor_endian(type_desc, $code)?;
                let mut out = vec![<$elem>::default(); len];
                match endian {
                    Endian::Little => reader.$read_into::<LittleEndian>(&mut out)?,
                    Endian::Big => reader.$read_into::<BigEndian>(&mut out)?,
                }
                expect_end(reader)?;
                Ok(out)
            }
        }

        impl ViewElement for $elem {
            fn bytes_as_slice<'a>(
                bytes: &'a [u8],
                type_desc: &PyValue,
                len: usize,
            ) -> Result<&'a [Self], ViewDataError> {
                check_native_descriptor(type_desc, $code)?;
                unsafe { cast_slice(bytes, len) }
            }
        }

        impl ViewMutElement for $elem {
            fn bytes_as_mut_slice<'a>(
                bytes: &'a mut [u8],
                type_desc: &PyValue,
                len: usize,
            ) -> Result<&'a mut [Self], ViewDataError> {
                check_native_descriptor(type_desc, $code)?;
                unsafe { cast_slice_mut(bytes, len) }
            }
        }
    };
}

macro_rules! impl_single_byte {
    ($elem:ty, $desc:expr) => {
        impl_writable_primitive!($elem, $desc.to_string());

        impl ReadableElement for $elem {
            fn read_to_end_exact_vec<R: io::Read>(
                mut reader: R,
                type_desc: &PyValue,
                len: usize,
            ) -> Result<Vec<Self>, ReadDataError> {
                check_exact_descriptor(type_desc, $desc)?;
                let mut out = vec![<$elem>::default(); len];
                reader.read_exact(bytes_of_mut(&mut out))?;
                expect_end(reader)?;
                Ok(out)
            }
        }

        impl ViewElement for $elem {
            fn bytes_as_slice<'a>(
                bytes: &'a [u8],
                type_desc: &PyValue,
                len: usize,
            ) -> Result<&'a [Self], ViewDataError> {
                check_exact_descriptor(type_desc, $desc)
                    .map_err(|_| ViewDataError::WrongDescriptor(type_desc.clone()))?;
                unsafe { cast_slice(bytes, len) }
            }
        }

        impl ViewMutElement for $elem {
            fn bytes_as_mut_slice<'a>(
                bytes: &'a mut [u8],
                type_desc: &PyValue,
                len: usize,
            ) -> Result<&'a mut [Self], ViewDataError> {
                check_exact_descriptor(type_desc, $desc)
                    .map_err(|_| ViewDataError::WrongDescriptor(type_desc.clone()))?;
                unsafe { cast_slice_mut(bytes, len) }
            }
        }
    };
}

/// Mutable raw-bytes view of a slice of plain elements.
fn bytes_of_mut<T>(slice: &mut [T]) -> &mut [u8] {
    unsafe { slice::from_raw_parts_mut(slice.as_mut_ptr().cast(), mem::size_of_val(slice)) }
}

impl_single_byte!(i8, "|i1");
impl_single_byte!(u8, "|u1");

impl_multi_byte!(i16, "i2", read_i16_into);
impl_multi_byte!(i32, "i4", read_i32_into);
impl_multi_byte!(i64, "i8", read_i64_into);
impl_multi_byte!(u16, "u2", read_u16_into);
impl_multi_byte!(u32, "u4", read_u32_into);
impl_multi_byte!(u64, "u8", read_u64_into);
impl_multi_byte!(f32, "f4", read_f32_into);
impl_multi_byte!(f64, "f8", read_f64_into);

impl WritableElement for bool {
    fn type_descriptor() -> PyValue {
        PyValue::String("|b1".to_string())
    }

    fn write<W: io::Write>(&self, mut writer: W) -> Result<(), WriteDataError> {
        writer.write_all(&[u8::from(*self)])?;
        Ok(())
    }

    fn write_slice<W: io::Write>(slice: &[Self], mut writer: W) -> Result<(), WriteDataError> {
        // `bool` is one byte with the values 0 and 1.
        writer.write_all(bytes_of(slice))?;
        Ok(())
    }
}

impl ReadableElement for bool {
    fn read_to_end_exact_vec<R: io::Read>(
        mut reader: R,
        type_desc: &PyValue,
        len: usize,
    ) -> Result<Vec<Self>, ReadDataError> {
        check_exact_descriptor(type_desc, "|b1")?;
        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes)?;
        expect_end(reader)?;
        for &byte in &bytes {
            if byte > 1 {
                return Err(ReadDataError::ParseBool(ParseBoolError(byte)));
            }
        }
        Ok(bytes.into_iter().map(|byte| byte == 1).collect())
    }
}

fn check_bool_bytes(bytes: &[u8]) -> Result<(), ViewDataError> {
    for &byte in bytes {
        if byte > 1 {
            return Err(ViewDataError::ParseBool(ParseBoolError(byte)));
        }
    }
    Ok(())
}

impl ViewElement for bool {
    fn bytes_as_slice<'a>(
        bytes: &'a [u8],
        type_desc: &PyValue,
        len: usize,
    ) -> Result<&'a [Self], ViewDataError> {
        check_exact_descriptor(type_desc, "|b1")
            .map_err(|_| ViewDataError::WrongDescriptor(type_desc.clone()))?;
        check_bool_bytes(bytes)?;
        // Every remaining byte is 0 or 1, a valid `bool` pattern.
        unsafe { cast_slice(bytes, len) }
    }
}

impl ViewMutElement for bool {
    fn bytes_as_mut_slice<'a>(
        bytes: &'a mut [u8],
        type_desc: &PyValue,
        len: usize,
    ) -> Result<&'a mut [Self], ViewDataError> {
        check_exact_descriptor(type_desc, "|b1")
            .map_err(|_| ViewDataError::WrongDescriptor(type_desc.clone()))?;
        check_bool_bytes(bytes)?;
        unsafe { cast_slice_mut(bytes, len) }
    }
}

#[cfg(feature = "num-complex")]
mod complex {
    use super::*;
    use num_complex::Complex;

    macro_rules! impl_complex {
        ($float:ty, $code:expr, $read_into:ident) => {
            impl WritableElement for Complex<$float> {
                fn type_descriptor() -> PyValue {
                    PyValue::String(native_descriptor($code))
                }

                fn write<W: io::Write>(&self, mut writer: W) -> Result<(), WriteDataError> {
                    writer.write_all(&self.re.to_ne_bytes())?;
                    writer.write_all(&self.im.to_ne_bytes())?;
                    Ok(())
                }

                fn write_slice<W: io::Write>(
                    slice: &[Self],
                    mut writer: W,
                ) -> Result<(), WriteDataError> {
                    // `Complex<T>` is `repr(C)` with fields `re`, `im`.
                    writer.write_all(bytes_of(slice))?;
                    Ok(())
                }
            }

            impl ReadableElement for Complex<$float> {
                fn read_to_end_exact_vec<R: io::Read>(
                    mut reader: R,
                    type_desc: &PyValue,
                    len: usize,
                ) -> Result<Vec<Self>, ReadDataError> {
                    let endian = descriptor_endian(type_desc, $code)?;
                    let mut parts = vec![<$float>::default(); len.checked_mul(2).unwrap()];
                    match endian {
                        Endian::Little => reader.$read_into::<LittleEndian>(&mut parts)?,
                        Endian::Big => reader.$read_into::<BigEndian>(&mut parts)?,
                    }
                    expect_end(reader)?;
                    Ok(parts
                        .chunks_exact(2)
                        .map(|pair| Complex::new(pair[0], pair[1]))
                        .collect())
                }
            }

            impl ViewElement for Complex<$float> {
                fn bytes_as_slice<'a>(
                    bytes: &'a [u8],
                    type_desc: &PyValue,
                    len: usize,
                ) -> Result<&'a [Self], ViewDataError> {
                    check_native_descriptor(type_desc, $code)?;
                    unsafe { cast_slice(bytes, len) }
                }
            }

            impl ViewMutElement for Complex<$float> {
                fn bytes_as_mut_slice<'a>(
                    bytes: &'a mut [u8],
                    type_desc: &PyValue,
                    len: usize,
                ) -> Result<&'a mut [Self], ViewDataError> {
                    check_native_descriptor(type_desc, $code)?;
                    unsafe { cast_slice_mut(bytes, len) }
                }
            }
        };
    }

    impl_complex!(f32, "c8", read_f32_into);
    impl_complex!(f64, "c16", read_f64_into);
}
