use crate::npy::header::Header;
use crate::npz::{NpzArchive, NpzWriter, ReadNpzError, WriteNpzError};
use crate::{
    ReadNpyError, ReadNpyExt, ReadableElement, ViewElement, ViewMutElement, ViewMutNpyExt,
    ViewNpyError, ViewNpyExt, WritableElement, WriteNpyError, WriteNpyExt,
};
use ndarray::{prelude::*, CowArray, Data, DataOwned, IntoDimension as _};
use std::borrow::Cow;
use std::io::{self, Seek, Write};
use std::mem;

impl<A, S, D> WriteNpyExt for ArrayBase<S, D>
where
    A: WritableElement,
    S: Data<Elem = A>,
    D: Dimension,
{
    fn write_npy<W: io::Write>(&self, mut writer: W) -> Result<(), WriteNpyError> {
        let write_contiguous = |mut writer: W, fortran_order: bool| {
            Header {
                type_descriptor: A::type_descriptor(),
                fortran_order,
                shape: self.shape().to_owned(),
            }
            .write(&mut writer)?;
            A::write_slice(self.as_slice_memory_order().unwrap(), &mut writer)?;
            writer.flush()?;
            Ok(())
        };
        if self.is_standard_layout() {
            write_contiguous(writer, false)
        } else if self.view().reversed_axes().is_standard_layout() {
            write_contiguous(writer, true)
        } else {
            Header {
                type_descriptor: A::type_descriptor(),
                fortran_order: false,
                shape: self.shape().to_owned(),
            }
            .write(&mut writer)?;
            for elem in self.iter() {
                elem.write(&mut writer)?;
            }
            writer.flush()?;
            Ok(())
        }
    }
}

impl<A, S, D> ReadNpyExt for ArrayBase<S, D>
where
    A: ReadableElement,
    S: DataOwned<Elem = A>,
    D: Dimension,
{
    fn read_npy<R: io::Read>(mut reader: R) -> Result<Self, ReadNpyError> {
        let header = Header::from_reader(&mut reader)?;
        let shape = header.shape.into_dimension();
        let ndim = shape.ndim();
        let len = shape_length_checked::<A>(&shape).ok_or(ReadNpyError::LengthOverflow)?;
        let data = A::read_to_end_exact_vec(&mut reader, &header.type_descriptor, len)?;
        ArrayBase::from_shape_vec(shape.set_f(header.fortran_order), data)
            .unwrap()
            .into_dimensionality()
            .map_err(|_| ReadNpyError::WrongNdim(D::NDIM, ndim))
    }
}

impl<'a, A, D> ViewNpyExt<'a> for ArrayView<'a, A, D>
where
    A: ViewElement,
    D: Dimension,
{
    fn view_npy(buf: &'a [u8]) -> Result<Self, ViewNpyError> {
        let mut reader = buf;
        let header = Header::from_reader(&mut reader)?;
        let shape = header.shape.into_dimension();
        let ndim = shape.ndim();
        let len = shape_length_checked::<A>(&shape).ok_or(ViewNpyError::LengthOverflow)?;
        let data = A::bytes_as_slice(reader, &header.type_descriptor, len)?;
        ArrayView::from_shape(shape.set_f(header.fortran_order), data)
            .unwrap()
            .into_dimensionality()
            .map_err(|_| ViewNpyError::WrongNdim(D::NDIM, ndim))
    }
}

impl<'a, A, D> ViewMutNpyExt<'a> for ArrayViewMut<'a, A, D>
where
    A: ViewMutElement,
    D: Dimension,
{
    fn view_mut_npy(buf: &'a mut [u8]) -> Result<Self, ViewNpyError> {
        let mut reader = &*buf;
        let header = Header::from_reader(&mut reader)?;
        let shape = header.shape.into_dimension();
        let ndim = shape.ndim();
        let len = shape_length_checked::<A>(&shape).ok_or(ViewNpyError::LengthOverflow)?;
        let mid = buf.len() - reader.len();
        let data = A::bytes_as_mut_slice(&mut buf[mid..], &header.type_descriptor, len)?;
        ArrayViewMut::from_shape(shape.set_f(header.fortran_order), data)
            .unwrap()
            .into_dimensionality()
            .map_err(|_| ViewNpyError::WrongNdim(D::NDIM, ndim))
    }
}

impl NpzArchive {
    /// Returns the member for `name` as an array.
    ///
    /// Stored members are bound as zero-copy views borrowing the mapping and
    /// returned as `CowArray::Borrowed`; deflated members are decompressed,
    /// verified, and returned as `CowArray::Owned`. The `Cow` tag therefore
    /// records whether the data aliases the file.
    ///
    /// A borrowed result requires the stored payload to use native
    /// endianness and to start on an element boundary; otherwise the access
    /// fails with the corresponding [`ViewNpyError`] instead of copying
    /// behind the caller's back. Archives written by [`NpzWriter`] or by
    /// `numpy.savez` against an aligning zip implementation satisfy both.
    pub fn by_name<'a, A, D>(&'a self, name: &str) -> Result<CowArray<'a, A, D>, ReadNpzError>
    where
        A: ViewElement + ReadableElement,
        D: Dimension,
    {
        cow_array(self.bytes_by_name(name)?)
    }

    /// Returns the member at `index` in central-directory order as an array,
    /// as [`by_name`](Self::by_name) would.
    pub fn by_index<'a, A, D>(&'a self, index: usize) -> Result<CowArray<'a, A, D>, ReadNpzError>
    where
        A: ViewElement + ReadableElement,
        D: Dimension,
    {
        cow_array(self.bytes_by_index(index)?)
    }

    /// Returns the stored member for `name` as a mutable array view aliasing
    /// the read-write mapping.
    ///
    /// Writing through the view modifies the file in place. The view is
    /// exclusive: the borrow checker keeps any other access to the archive,
    /// including `close`, out while it lives.
    pub fn by_name_mut<'a, A, D>(
        &'a mut self,
        name: &str,
    ) -> Result<ArrayViewMut<'a, A, D>, ReadNpzError>
    where
        A: ViewMutElement,
        D: Dimension,
    {
        let bytes = self.bytes_by_name_mut(name)?;
        Ok(ArrayViewMut::view_mut_npy(bytes)?)
    }
}

fn cow_array<A, D>(bytes: Cow<'_, [u8]>) -> Result<CowArray<'_, A, D>, ReadNpzError>
where
    A: ViewElement + ReadableElement,
    D: Dimension,
{
    match bytes {
        Cow::Borrowed(buf) => Ok(ArrayView::view_npy(buf)?.into()),
        Cow::Owned(buf) => Ok(Array::read_npy(&buf[..])?.into()),
    }
}

impl<W: Write + Seek> NpzWriter<W> {
    /// Adds a member holding `array` in `.npy` format.
    ///
    /// The member is formatted into a buffer first so the container layer
    /// knows its exact length up front; zip64 extensions are reserved for
    /// members of 4 GiB and beyond.
    pub fn add_array<A, S, D>(
        &mut self,
        name: &str,
        array: &ArrayBase<S, D>,
    ) -> Result<(), WriteNpzError>
    where
        A: WritableElement,
        S: Data<Elem = A>,
        D: Dimension,
    {
        let mut buf = Vec::with_capacity(array.len() * mem::size_of::<A>() + 128);
        array.write_npy(&mut buf)?;
        self.add_bytes(name, &buf)
    }
}

/// Computes the length associated with the shape (i.e. the product of the axis
/// lengths), where the element type is `A`.
///
/// Returns `None` if the number of elements or the length in bytes would
/// overflow `isize`.
fn shape_length_checked<A>(shape: &IxDyn) -> Option<usize> {
    const MAX: usize = isize::MAX as usize;
    let len = shape.size_checked()?;
    (len.checked_mul(mem::size_of::<A>())? < MAX).then_some(len)
}
