#![doc = include_str!("../README.md")]
//! ## Operate .npz Archives
//!
//! - Random access over a memory mapping: [`NpzArchive`]
//!   - [`by_name`](NpzArchive::by_name) / [`by_index`](NpzArchive::by_index)
//!     bind members as [`ndarray::CowArray`]s, borrowing the mapping for
//!     stored members and owning a decompressed buffer for deflated ones
//!   - [`by_name_mut`](NpzArchive::by_name_mut) binds a stored member as a
//!     mutable view that writes through to the file
//!   - [`bytes_by_name`](NpzArchive::bytes_by_name) exposes the raw `.npy`
//!     bytes for callers that bring their own parser
//! - Writing: [`NpzWriter`], which aligns stored members so the archives it
//!   produces can later be mapped and viewed without copying
//!
//! ## Operate .npy Files
//!
//! - Reading
//!   - [`ReadNpyExt`] extension trait
//!   - [`read_npy`] convenience function
//! - Writing
//!   - [`WriteNpyExt`] extension trait
//!   - [`write_npy`] convenience function
//! - Readonly viewing (primarily for use with memory-mapped files)
//!   - [`ViewNpyExt`] extension trait
//! - Mutable viewing (primarily for use with memory-mapped files)
//!   - [`ViewMutNpyExt`] extension trait
//!
//! ## Limitations
//!
//! - Parsing of `.npy` headers is currently limited to files where the `descr`
//!   field of the [header dictionary] is a Python string literal of the form
//!   `'string'`, `"string"`, `'''string'''`, or `"""string"""`.
//!
//! - The element traits ([`WritableElement`], [`ReadableElement`],
//!   [`ViewElement`], and [`ViewMutElement`]) are currently implemented only
//!   for fixed-size integers up to 64 bits, floating point numbers, complex
//!   floating point numbers (if enabled with the crate feature), and [`bool`].
//!
//! - Archive members compressed with any method other than deflate are
//!   reported as unsupported rather than decompressed.
//!
//! [header dictionary]: https://docs.scipy.org/doc/numpy/reference/generated/numpy.lib.format.html#format-version-1-0
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs)]

mod npy;
mod npz;

#[cfg(feature = "ndarray")]
mod impl_ndarray;

pub use crate::{
    npy::{
        read_npy, write_npy, ReadDataError, ReadNpyError, ReadNpyExt, ReadableElement,
        ViewDataError, ViewElement, ViewMutElement, ViewMutNpyExt, ViewNpyError, ViewNpyExt,
        WritableElement, WriteDataError, WriteNpyError, WriteNpyExt,
    },
    npz::{NpzArchive, NpzWriter, ReadNpzError, WriteNpzError},
};
