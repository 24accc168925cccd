//! Element descriptors and the datatype tag mapping.
//!
//! Every typed operation moves elements as raw bytes, so the only thing the
//! communicator needs from an element type is its size in bytes. That is what
//! [`Element`] describes. Reductions additionally need to know how to combine
//! elements, which requires a [`DataType`] tag: only types implementing the
//! sealed [`Reducible`] trait can be reduced.
//!
//! # Reducible types
//!
//! | Rust Type      | Tag                  |
//! |----------------|----------------------|
//! | `f64`          | [`DataType::Double`] |
//! | `f32`          | [`DataType::Float`]  |
//! | `i32`          | [`DataType::Int`]    |
//! | `u32`          | [`DataType::UInt`]   |
//! | `usize`        | [`DataType::SizeT`]  |
//! | `i8`           | [`DataType::Char`]   |
//! | `u8`           | [`DataType::UChar`]  |
//! | `ValueLoc<T>`  | tag of `T`, paired   |

use crate::error::{Error, Result};
use crate::ReduceOp;
use std::mem::size_of;

/// Datatype tags understood by substrate reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DataType {
    /// 64-bit floating point
    Double = 0,
    /// 32-bit floating point
    Float = 1,
    /// 32-bit signed integer
    Int = 2,
    /// 32-bit unsigned integer
    UInt = 3,
    /// Pointer-width unsigned integer
    SizeT = 4,
    /// Signed character
    Char = 5,
    /// Unsigned character
    UChar = 6,
    /// Raw signed byte
    Byte = 7,
    /// Raw unsigned byte
    UByte = 8,
}

impl DataType {
    /// Width of one element of this type in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::Double => 8,
            DataType::Float | DataType::Int | DataType::UInt => 4,
            DataType::SizeT => size_of::<usize>(),
            DataType::Char | DataType::UChar | DataType::Byte | DataType::UByte => 1,
        }
    }

    /// Width of one reduction unit under `op`.
    ///
    /// Location operators work on `(value, location)` pairs of this type.
    pub const fn unit_size(self, op: ReduceOp) -> usize {
        if op.is_loc() {
            2 * self.size()
        } else {
            self.size()
        }
    }
}

/// Element types that can travel as raw bytes.
///
/// # Safety
///
/// Implementors must be plain data: no padding bytes, no pointers or
/// references, and every bit pattern of `size_of::<Self>()` bytes must be a
/// valid value. Received bytes are written straight into the element storage.
pub unsafe trait Element: Copy + Default + 'static {}

macro_rules! impl_element {
    ($($ty:ty),*) => {
        $(unsafe impl Element for $ty {})*
    };
}

impl_element!(f32, f64, i8, i16, i32, i64, i128, u8, u16, u32, u64, u128, isize, usize);

unsafe impl<T: Element, const N: usize> Element for [T; N] where [T; N]: Default {}

mod sealed {
    pub trait Sealed {}
}

/// Element types with a substrate-native datatype tag.
///
/// This is a **sealed trait**: the tag must match the element layout exactly,
/// so the mapping cannot be extended from outside the crate.
pub trait Reducible: Element + sealed::Sealed {
    /// Tag of the scalar component.
    const DATATYPE: DataType;
    /// Whether an element is a `(value, location)` pair.
    const PAIRED: bool;
}

macro_rules! impl_reducible {
    ($ty:ty, $tag:expr) => {
        impl sealed::Sealed for $ty {}
        impl Reducible for $ty {
            const DATATYPE: DataType = $tag;
            const PAIRED: bool = false;
        }
    };
}

impl_reducible!(f64, DataType::Double);
impl_reducible!(f32, DataType::Float);
impl_reducible!(i32, DataType::Int);
impl_reducible!(u32, DataType::UInt);
impl_reducible!(usize, DataType::SizeT);
impl_reducible!(i8, DataType::Char);
impl_reducible!(u8, DataType::UChar);

/// A value tagged with the location it came from, for
/// [`ReduceOp::MinLoc`] and [`ReduceOp::MaxLoc`].
///
/// Both fields share one type, like `MPI_2INT` and `MPI_2DOUBLE_PRECISION`.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
#[repr(C)]
pub struct ValueLoc<T> {
    /// The compared value
    pub value: T,
    /// Where the value came from, usually a rank or an index
    pub loc: T,
}

impl<T> ValueLoc<T> {
    /// Pair `value` with `loc`.
    pub fn new(value: T, loc: T) -> Self {
        ValueLoc { value, loc }
    }
}

// Two fields of the same size and alignment leave no padding under repr(C).
macro_rules! impl_value_loc {
    ($($ty:ty),*) => {
        $(
            unsafe impl Element for ValueLoc<$ty> {}
            impl sealed::Sealed for ValueLoc<$ty> {}
            impl Reducible for ValueLoc<$ty> {
                const DATATYPE: DataType = <$ty as Reducible>::DATATYPE;
                const PAIRED: bool = true;
            }
        )*
    };
}

impl_value_loc!(f64, f32, i32, u32, usize, i8, u8);

/// Check that elements of `T` can be reduced with `op`.
///
/// Location operators need paired elements and every other operator needs
/// plain scalars; anything else has no substrate-native equivalent.
pub fn resolve<T: Reducible>(op: ReduceOp) -> Result<DataType> {
    if T::PAIRED != op.is_loc() {
        return Err(Error::NotSupported(format!(
            "{op:?} over {}{:?} elements",
            if T::PAIRED { "paired " } else { "" },
            T::DATATYPE
        )));
    }
    Ok(T::DATATYPE)
}

/// View a slice of elements as its raw bytes.
pub fn as_bytes<T: Element>(data: &[T]) -> &[u8] {
    // SAFETY: `Element` types are padding-free plain data.
    unsafe { std::slice::from_raw_parts(data.as_ptr().cast::<u8>(), std::mem::size_of_val(data)) }
}

/// View a mutable slice of elements as its raw bytes.
pub fn as_bytes_mut<T: Element>(data: &mut [T]) -> &mut [u8] {
    // SAFETY: every bit pattern is a valid `Element`.
    unsafe {
        std::slice::from_raw_parts_mut(data.as_mut_ptr().cast::<u8>(), std::mem::size_of_val(data))
    }
}

/// View a single element as its raw bytes.
pub fn value_bytes<T: Element>(value: &T) -> &[u8] {
    as_bytes(std::slice::from_ref(value))
}

/// View a single element as its raw bytes, mutably.
pub fn value_bytes_mut<T: Element>(value: &mut T) -> &mut [u8] {
    as_bytes_mut(std::slice::from_mut(value))
}

/// Decode a byte buffer into a vector of elements.
///
/// Fails if the buffer does not hold a whole number of elements.
pub fn from_bytes<T: Element>(bytes: &[u8]) -> Result<Vec<T>> {
    let width = size_of::<T>();
    if width == 0 {
        return Ok(Vec::new());
    }
    if bytes.len() % width != 0 {
        return Err(Error::InvalidBuffer(format!(
            "{} bytes is not a whole number of {width}-byte elements",
            bytes.len()
        )));
    }
    let mut out = vec![T::default(); bytes.len() / width];
    as_bytes_mut(&mut out).copy_from_slice(bytes);
    Ok(out)
}
