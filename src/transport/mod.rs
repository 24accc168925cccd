//! The communication substrate seam.
//!
//! A [`Transport`] is one rank's endpoint in one process group. It moves raw
//! bytes: point-to-point, non-blocking, and the collective primitives the
//! [`Communicator`](crate::Communicator) builds on. Only reductions know about
//! element types, through a [`DataType`] tag.
//!
//! Delivery, ordering per (sender, tag) and flow control are the substrate's
//! job. The crate ships [`LocalTransport`], which runs every rank as a thread
//! of the current process.

mod local;

pub use local::LocalTransport;
pub(crate) use local::Fabric;

use crate::datatype::DataType;
use crate::error::{Error, Result};
use crate::status::Status;
use crate::ReduceOp;

/// Wildcard source for receives.
pub const ANY_SOURCE: i32 = -1;

/// Wildcard tag for receives.
pub const ANY_TAG: i32 = -1;

/// Color that leaves a rank out of every group produced by a split.
pub const UNDEFINED: i32 = -1;

/// Handle of an in-flight substrate operation.
pub type RawRequest = u64;

/// The outcome of a completed substrate operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Envelope of the received message; for sends, the destination and tag.
    pub status: Status,
    /// Received bytes. Always empty for sends.
    pub payload: Vec<u8>,
}

/// One rank's endpoint in a process group.
///
/// Every collective method must be called by every rank of the group, in the
/// same order, with consistent sizes. Buffers that are only significant at
/// the root may be empty elsewhere.
pub trait Transport {
    /// Rank of this endpoint within its group.
    fn rank(&self) -> i32;

    /// Number of ranks in the group.
    fn size(&self) -> i32;

    /// Blocking send of `buf` to `dest`.
    fn send(&self, buf: &[u8], dest: i32, tag: i32) -> Result<()>;

    /// Blocking receive into `buf`. The message may be shorter than `buf`.
    fn recv(&self, buf: &mut [u8], source: i32, tag: i32) -> Result<Status>;

    /// Issue a send without waiting for it.
    fn isend(&self, buf: &[u8], dest: i32, tag: i32) -> Result<RawRequest>;

    /// Post a receive of at most `capacity` bytes without waiting for it.
    fn irecv(&self, capacity: usize, source: i32, tag: i32) -> Result<RawRequest>;

    /// Block until `request` completes.
    fn wait(&self, request: RawRequest) -> Result<Delivery>;

    /// Whether `request` has completed, without blocking.
    fn test(&self, request: RawRequest) -> Result<bool>;

    /// Forget `request` without waiting. A posted receive is withdrawn; a
    /// message it already matched is dropped.
    fn request_free(&self, request: RawRequest);

    /// Block until every rank of the group has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Replace `buf` on every rank with the root's `buf`. Lengths must agree.
    fn broadcast(&self, buf: &mut [u8], root: i32) -> Result<()>;

    /// Collect `counts[i]` bytes from every rank `i` into `recv` at `displs[i]`
    /// on the root.
    ///
    /// `recv`, `counts` and `displs` are only read on the root and may be
    /// empty elsewhere.
    fn gatherv(
        &self,
        send: &[u8],
        recv: &mut [u8],
        counts: &[usize],
        displs: &[usize],
        root: i32,
    ) -> Result<()>;

    /// Like [`gatherv`](Self::gatherv), with the result on every rank.
    fn all_gatherv(
        &self,
        send: &[u8],
        recv: &mut [u8],
        counts: &[usize],
        displs: &[usize],
    ) -> Result<()>;

    /// Send `counts[i]` bytes at `displs[i]` of the root's `send` to rank `i`.
    fn scatterv(
        &self,
        send: &[u8],
        counts: &[usize],
        displs: &[usize],
        recv: &mut [u8],
        root: i32,
    ) -> Result<()>;

    /// Elementwise reduction of every rank's `send` into the root's `recv`.
    fn reduce(
        &self,
        send: &[u8],
        recv: &mut [u8],
        datatype: DataType,
        op: ReduceOp,
        root: i32,
    ) -> Result<()>;

    /// Elementwise reduction with the result on every rank.
    fn all_reduce(&self, send: &[u8], recv: &mut [u8], datatype: DataType, op: ReduceOp)
        -> Result<()>;

    /// Partition the group by `color`, ordering each part by `key`.
    ///
    /// Returns `None` on ranks that passed [`UNDEFINED`] (any negative color).
    fn split(&self, color: i32, key: i32) -> Result<Option<Box<dyn Transport>>>;

    /// A new endpoint over the same group with an isolated message space.
    fn duplicate(&self) -> Result<Box<dyn Transport>>;

    /// Tear down this endpoint. Releasing twice is a no-op.
    fn release(&self) -> Result<()>;

    /// Fixed-size gather: every rank contributes `send.len()` bytes.
    fn gather(&self, send: &[u8], recv: &mut [u8], root: i32) -> Result<()> {
        let (counts, displs) = uniform_layout(send.len(), self.size());
        if self.rank() == root && recv.len() < send.len() * counts.len() {
            return Err(Error::InvalidBuffer(format!(
                "gather needs {} bytes at the root, got {}",
                send.len() * counts.len(),
                recv.len()
            )));
        }
        self.gatherv(send, recv, &counts, &displs, root)
    }

    /// Fixed-size gather with the result on every rank.
    fn all_gather(&self, send: &[u8], recv: &mut [u8]) -> Result<()> {
        let (counts, displs) = uniform_layout(send.len(), self.size());
        if recv.len() < send.len() * counts.len() {
            return Err(Error::InvalidBuffer(format!(
                "all_gather needs {} bytes, got {}",
                send.len() * counts.len(),
                recv.len()
            )));
        }
        self.all_gatherv(send, recv, &counts, &displs)
    }
}

fn uniform_layout(bytes: usize, size: i32) -> (Vec<usize>, Vec<usize>) {
    let size = size.max(0) as usize;
    let counts = vec![bytes; size];
    let displs = (0..size).map(|i| i * bytes).collect();
    (counts, displs)
}
