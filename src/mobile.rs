//! Mobile objects: values that travel as a flat byte buffer of self-reported
//! size.
//!
//! A [`MobileObject`] owns a [`PackBuffer`]. [`pack`](MobileObject::pack)
//! fills it and reports its size, [`unpack`](MobileObject::unpack) rebuilds
//! the object from bytes produced by a peer. The wire format is whatever the
//! object writes; lengths always travel separately.
//!
//! Any serde type becomes a mobile object by wrapping it in [`Mobile`], which
//! packs with bincode.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ops::{Deref, DerefMut};

/// The pack buffer of a mobile object.
///
/// Holds at most one owned allocation, released exactly once by
/// [`destroy`](Self::destroy) or on drop.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackBuffer {
    data: Option<Box<[u8]>>,
}

impl PackBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        PackBuffer::default()
    }

    /// Allocate a zeroed buffer of `size` bytes, replacing any previous one.
    pub fn prepare(&mut self, size: usize) -> &mut [u8] {
        self.data.insert(vec![0u8; size].into_boxed_slice())
    }

    /// Take ownership of `bytes` as the buffer contents.
    pub fn fill(&mut self, bytes: Vec<u8>) {
        self.data = Some(bytes.into_boxed_slice());
    }

    /// The buffer contents; empty if nothing is allocated.
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    /// The buffer contents, mutably; empty if nothing is allocated.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or_default()
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an allocation is currently held.
    pub fn is_owned(&self) -> bool {
        self.data.is_some()
    }

    /// Release the allocation. Releasing an empty buffer is a no-op.
    pub fn destroy(&mut self) {
        self.data = None;
    }
}

/// A value that can be transferred as a flat byte buffer.
///
/// Implementors hold a [`PackBuffer`] and expose it through the two
/// accessors; the provided methods work on top of them.
///
/// # Example
///
/// ```
/// use rankcomm::{MobileObject, PackBuffer, Result};
///
/// #[derive(Default)]
/// struct Samples {
///     values: Vec<u32>,
///     buffer: PackBuffer,
/// }
///
/// impl MobileObject for Samples {
///     fn pack_buffer(&self) -> &PackBuffer {
///         &self.buffer
///     }
///
///     fn pack_buffer_mut(&mut self) -> &mut PackBuffer {
///         &mut self.buffer
///     }
///
///     fn pack(&mut self) -> Result<usize> {
///         let bytes: Vec<u8> = self.values.iter().flat_map(|v| v.to_le_bytes()).collect();
///         let size = bytes.len();
///         self.buffer.fill(bytes);
///         Ok(size)
///     }
///
///     fn unpack(&mut self, bytes: &[u8]) -> Result<()> {
///         self.values = bytes
///             .chunks_exact(4)
///             .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
///             .collect();
///         Ok(())
///     }
/// }
/// ```
pub trait MobileObject {
    /// The pack buffer.
    fn pack_buffer(&self) -> &PackBuffer;

    /// The pack buffer, mutably.
    fn pack_buffer_mut(&mut self) -> &mut PackBuffer;

    /// Write the packed representation into the pack buffer and return its
    /// size in bytes.
    fn pack(&mut self) -> Result<usize>;

    /// Rebuild this object from a packed representation.
    fn unpack(&mut self, bytes: &[u8]) -> Result<()>;

    /// The packed bytes from the last [`pack`](Self::pack).
    fn buffer(&self) -> &[u8] {
        self.pack_buffer().as_slice()
    }

    /// Size of the packed bytes.
    fn buffer_size(&self) -> usize {
        self.pack_buffer().len()
    }

    /// Release the pack buffer.
    fn release_buffer(&mut self) {
        self.pack_buffer_mut().destroy();
    }
}

/// Adapter that makes any serde value a [`MobileObject`].
///
/// Dereferences to the wrapped value.
#[derive(Debug, Default, Clone)]
pub struct Mobile<T> {
    value: T,
    buffer: PackBuffer,
}

impl<T> Mobile<T> {
    /// Wrap `value`.
    pub fn new(value: T) -> Self {
        Mobile {
            value,
            buffer: PackBuffer::new(),
        }
    }

    /// Unwrap the value.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> From<T> for Mobile<T> {
    fn from(value: T) -> Self {
        Mobile::new(value)
    }
}

impl<T> Deref for Mobile<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Mobile<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Serialize + DeserializeOwned> MobileObject for Mobile<T> {
    fn pack_buffer(&self) -> &PackBuffer {
        &self.buffer
    }

    fn pack_buffer_mut(&mut self) -> &mut PackBuffer {
        &mut self.buffer
    }

    fn pack(&mut self) -> Result<usize> {
        let bytes = bincode::serialize(&self.value)?;
        let size = bytes.len();
        self.buffer.fill(bytes);
        Ok(size)
    }

    fn unpack(&mut self, bytes: &[u8]) -> Result<()> {
        self.value = bincode::deserialize(bytes)?;
        Ok(())
    }
}
