//! Message status information.
//!
//! This module provides the [`Status`] struct returned by receive operations,
//! describing where a message came from and how large it was.

/// Information about a received message.
///
/// Returned by [`Communicator::recv`](crate::Communicator::recv) and carried
/// by every [`Received`](crate::Received) payload. With wildcard receives
/// ([`ANY_SOURCE`](crate::ANY_SOURCE), [`ANY_TAG`](crate::ANY_TAG)) this is
/// the only way to learn the actual sender and tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Source rank of the message.
    pub source: i32,
    /// Tag of the message.
    pub tag: i32,
    /// Size of the message in bytes.
    pub bytes: usize,
}

impl Status {
    /// Number of whole `T` elements in the message.
    pub fn count<T>(&self) -> usize {
        match std::mem::size_of::<T>() {
            0 => 0,
            width => self.bytes / width,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_divides_by_element_width() {
        let status = Status {
            source: 1,
            tag: 7,
            bytes: 24,
        };
        assert_eq!(status.count::<f64>(), 3);
        assert_eq!(status.count::<u8>(), 24);
        assert_eq!(status.count::<()>(), 0);
    }
}
