//! Bounds-checked little-endian reads and writes.
//!
//! Every multi-byte quantity in the bytecode blob (decrypted operands as well as the
//! unencrypted switch tables) is little-endian. These helpers never panic: reads past the end
//! of the buffer return [`crate::Error::OutOfBounds`].

use crate::{Error::OutOfBounds, Result};

/// A fixed-size integer that can be read from and written to little-endian bytes.
pub trait LeIO: Sized + Copy {
    /// Byte array representation of the type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Decodes the value from little-endian bytes.
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Encodes the value as little-endian bytes.
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_le_io {
    ($($ty:ty),*) => {
        $(
            impl LeIO for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_le_io!(u8, u16, u32, u64, i8, i16, i32, i64);

/// Reads a `T` from the start of `data`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `data` is too short.
pub fn read_le<T: LeIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Reads a `T` at `offset` and advances `offset` past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes remain.
///
/// # Examples
///
/// ```rust
/// use vmscope::utils::io::read_le_at;
///
/// let data = [0x03, 0x00, 0xFE, 0xFF, 0xFF, 0xFF];
/// let mut offset = 0;
/// assert_eq!(read_le_at::<u16>(&data, &mut offset)?, 3);
/// assert_eq!(read_le_at::<i32>(&data, &mut offset)?, -2);
/// assert_eq!(offset, 6);
/// # Ok::<(), vmscope::Error>(())
/// ```
pub fn read_le_at<T: LeIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let end = offset.checked_add(type_len).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;
    Ok(T::from_le_bytes(read))
}

/// Appends `value` to `buffer` in little-endian order.
pub fn write_le<T: LeIO>(buffer: &mut Vec<u8>, value: T) {
    buffer.extend_from_slice(value.to_le_bytes().as_ref());
}
