//! Typed collectives on [`Communicator`].
//!
//! Every collective must be called by every rank of the group, in the same
//! order, with the same element type. Element counts may differ per rank only
//! in the `v` variants, which compute byte offsets as a prefix sum of
//! `count[i] * size_of::<T>()`.
//!
//! Buffer and count-table mismatches are contract violations: peers may
//! already be blocked in the collective, so they abort the process instead of
//! returning an error.

use crate::comm::Communicator;
use crate::datatype::{
    as_bytes, as_bytes_mut, resolve, value_bytes, value_bytes_mut, DataType, Element, Reducible,
};
use crate::error::{enforce, Error, Result};
use crate::ReduceOp;
use log::debug;
use std::mem::size_of;

/// Byte sizes and displacements for per-rank element `counts` of `width`
/// bytes each. Displacements are the exclusive prefix sum of the sizes.
pub fn layout(counts: &[usize], width: usize) -> (Vec<usize>, Vec<usize>) {
    let sizes: Vec<usize> = counts.iter().map(|&c| c * width).collect();
    let displs = sizes
        .iter()
        .scan(0, |offset, &size| {
            let displ = *offset;
            *offset += size;
            Some(displ)
        })
        .collect();
    (sizes, displs)
}

/// A count table must have one entry per rank.
pub(crate) fn check_table(counts: &[usize], size: i32) -> Result<()> {
    if counts.len() != size as usize {
        return Err(Error::InvalidCount(counts.len() as i64));
    }
    Ok(())
}

/// The table entry for `rank` must match what the rank contributes.
pub(crate) fn check_contribution(counts: &[usize], rank: i32, len: usize) -> Result<()> {
    match counts.get(rank as usize) {
        Some(&count) if count == len => Ok(()),
        _ => Err(Error::InvalidCount(len as i64)),
    }
}

/// A scatter source must hold every slice of the table.
pub(crate) fn check_source(counts: &[usize], len: usize) -> Result<()> {
    let needed: usize = counts.iter().sum();
    if len < needed {
        return Err(Error::InvalidBuffer(format!(
            "scatter source holds {len} elements, count table needs {needed}"
        )));
    }
    Ok(())
}

/// A byte reduction buffer must hold whole reduction units.
pub(crate) fn check_units(len: usize, datatype: DataType, op: ReduceOp) -> Result<()> {
    let unit = datatype.unit_size(op);
    if len % unit != 0 {
        return Err(Error::InvalidBuffer(format!(
            "{len} bytes is not a whole number of {unit}-byte {datatype:?} units"
        )));
    }
    Ok(())
}

impl Communicator {
    // ========================================================================
    // Broadcast
    // ========================================================================

    /// Replace `value` on every rank with the root's value.
    pub fn broadcast<T: Element>(&self, value: &mut T, root: i32) -> Result<()> {
        let done = self
            .handle()
            .and_then(|h| h.broadcast(value_bytes_mut(value), root));
        self.record(done)
    }

    /// Broadcast a fixed-length slice. Every rank must pass the same length.
    pub fn broadcast_slice<T: Element>(&self, data: &mut [T], root: i32) -> Result<()> {
        let done = self
            .handle()
            .and_then(|h| h.broadcast(as_bytes_mut(data), root));
        self.record(done)
    }

    /// Broadcast a sequence, resizing it on non-root ranks.
    ///
    /// The root's length travels first so receivers can size their buffers.
    pub fn broadcast_vec<T: Element>(&self, data: &mut Vec<T>, root: i32) -> Result<()> {
        let mut len = data.len();
        self.broadcast(&mut len, root)?;
        if self.rank() != root {
            data.clear();
            data.resize(len, T::default());
        }
        self.broadcast_slice(data.as_mut_slice(), root)
    }

    /// Broadcast a string from the root.
    ///
    /// `value` is left unchanged if the broadcast fails.
    pub fn broadcast_string(&self, value: &mut String, root: i32) -> Result<()> {
        let mut bytes = value.as_bytes().to_vec();
        self.broadcast_vec(&mut bytes, root)?;
        *value = String::from_utf8(bytes)
            .map_err(|e| Error::InvalidBuffer(format!("broadcast string: {e}")))?;
        Ok(())
    }

    // ========================================================================
    // Fixed-size gather
    // ========================================================================

    /// Gather one value per rank, in rank order, at the root.
    ///
    /// Non-root ranks get an empty vector.
    pub fn gather<T: Element>(&self, value: &T, root: i32) -> Result<Vec<T>> {
        self.gather_vec(std::slice::from_ref(value), root)
    }

    /// Gather `send.len()` elements per rank at the root. Every rank must
    /// contribute the same number of elements.
    pub fn gather_vec<T: Element>(&self, send: &[T], root: i32) -> Result<Vec<T>> {
        let mut recv = if self.rank() == root {
            vec![T::default(); send.len() * self.size() as usize]
        } else {
            Vec::new()
        };
        let done = self
            .handle()
            .and_then(|h| h.gather(as_bytes(send), as_bytes_mut(&mut recv), root));
        self.record(done)?;
        Ok(recv)
    }

    /// Gather one value per rank, in rank order, on every rank.
    pub fn all_gather<T: Element>(&self, value: &T) -> Result<Vec<T>> {
        self.all_gather_vec(std::slice::from_ref(value))
    }

    /// Gather `send.len()` elements per rank on every rank.
    pub fn all_gather_vec<T: Element>(&self, send: &[T]) -> Result<Vec<T>> {
        let mut recv = vec![T::default(); send.len() * self.size() as usize];
        let done = self
            .handle()
            .and_then(|h| h.all_gather(as_bytes(send), as_bytes_mut(&mut recv)));
        self.record(done)?;
        Ok(recv)
    }

    // ========================================================================
    // Variable-size gather and scatter
    // ========================================================================

    /// Gather a variable number of elements per rank at the root.
    ///
    /// `counts[i]` is the number of elements rank `i` contributes and is only
    /// significant at the root. If `counts` is empty on every rank, the
    /// counts are first gathered to the root and left in `counts` there.
    pub fn gatherv<T: Element>(
        &self,
        send: &[T],
        counts: &mut Vec<usize>,
        root: i32,
    ) -> Result<Vec<T>> {
        debug!(rank = self.rank(), root, count = send.len(); "gatherv");
        if counts.is_empty() {
            *counts = self.gather(&send.len(), root)?;
        }
        self.gatherv_known(send, counts, root)
    }

    /// Variable-size gather with a count table already known at the root.
    pub(crate) fn gatherv_known<T: Element>(
        &self,
        send: &[T],
        counts: &[usize],
        root: i32,
    ) -> Result<Vec<T>> {
        if self.rank() != root {
            let done = self
                .handle()
                .and_then(|h| h.gatherv(as_bytes(send), &mut [], &[], &[], root));
            self.record(done)?;
            return Ok(Vec::new());
        }
        enforce(check_table(counts, self.size()));
        enforce(check_contribution(counts, self.rank(), send.len()));
        let (sizes, displs) = layout(counts, size_of::<T>());
        let mut recv = vec![T::default(); counts.iter().sum()];
        let done = self.handle().and_then(|h| {
            h.gatherv(as_bytes(send), as_bytes_mut(&mut recv), &sizes, &displs, root)
        });
        self.record(done)?;
        Ok(recv)
    }

    /// Gather a variable number of elements per rank on every rank.
    ///
    /// If `counts` is empty, the counts are exchanged first and left in it.
    /// The result holds each rank's contribution in ascending rank order.
    pub fn all_gatherv<T: Element>(&self, send: &[T], counts: &mut Vec<usize>) -> Result<Vec<T>> {
        debug!(rank = self.rank(), count = send.len(); "all_gatherv");
        if counts.is_empty() {
            *counts = self.all_gather(&send.len())?;
        }
        enforce(check_table(counts, self.size()));
        enforce(check_contribution(counts, self.rank(), send.len()));
        let (sizes, displs) = layout(counts, size_of::<T>());
        let mut recv = vec![T::default(); counts.iter().sum()];
        let done = self.handle().and_then(|h| {
            h.all_gatherv(as_bytes(send), as_bytes_mut(&mut recv), &sizes, &displs)
        });
        self.record(done)?;
        Ok(recv)
    }

    /// Scatter slices of the root's `send` to every rank.
    ///
    /// `counts[i]` (significant at the root) is the number of elements rank
    /// `i` receives. The table is broadcast first, so on return `counts`
    /// holds the root's table on every rank.
    pub fn scatterv<T: Element>(
        &self,
        send: &[T],
        counts: &mut Vec<usize>,
        root: i32,
    ) -> Result<Vec<T>> {
        debug!(rank = self.rank(), root; "scatterv");
        self.broadcast_vec(counts, root)?;
        enforce(check_table(counts, self.size()));
        if self.rank() == root {
            enforce(check_source(counts, send.len()));
        }
        let (sizes, displs) = layout(counts, size_of::<T>());
        let mut recv = vec![T::default(); counts[self.rank() as usize]];
        let done = self.handle().and_then(|h| {
            h.scatterv(as_bytes(send), &sizes, &displs, as_bytes_mut(&mut recv), root)
        });
        self.record(done)?;
        Ok(recv)
    }

    // ========================================================================
    // Reductions
    // ========================================================================

    /// Elementwise reduction of every rank's `send` at the root.
    ///
    /// Non-root ranks get an empty vector. Location operators
    /// ([`ReduceOp::MinLoc`], [`ReduceOp::MaxLoc`]) require
    /// [`ValueLoc`](crate::ValueLoc) elements; every other operator requires
    /// plain scalars.
    pub fn reduce<T: Reducible>(&self, send: &[T], op: ReduceOp, root: i32) -> Result<Vec<T>> {
        let datatype = enforce(resolve::<T>(op));
        let mut recv = if self.rank() == root {
            vec![T::default(); send.len()]
        } else {
            Vec::new()
        };
        let done = self.handle().and_then(|h| {
            h.reduce(as_bytes(send), as_bytes_mut(&mut recv), datatype, op, root)
        });
        self.record(done)?;
        Ok(recv)
    }

    /// Reduce a single value at the root. Non-root ranks get `None`.
    pub fn reduce_scalar<T: Reducible>(&self, value: T, op: ReduceOp, root: i32) -> Result<Option<T>> {
        Ok(self.reduce(&[value], op, root)?.first().copied())
    }

    /// Elementwise reduction with the result on every rank.
    pub fn all_reduce<T: Reducible>(&self, send: &[T], op: ReduceOp) -> Result<Vec<T>> {
        let datatype = enforce(resolve::<T>(op));
        let mut recv = vec![T::default(); send.len()];
        let done = self.handle().and_then(|h| {
            h.all_reduce(as_bytes(send), as_bytes_mut(&mut recv), datatype, op)
        });
        self.record(done)?;
        Ok(recv)
    }

    /// Reduce a single value with the result on every rank.
    pub fn all_reduce_scalar<T: Reducible>(&self, value: T, op: ReduceOp) -> Result<T> {
        let mut result = T::default();
        let datatype = enforce(resolve::<T>(op));
        let done = self.handle().and_then(|h| {
            h.all_reduce(value_bytes(&value), value_bytes_mut(&mut result), datatype, op)
        });
        self.record(done)?;
        Ok(result)
    }

    /// Reduce raw bytes described by an explicit datatype tag.
    ///
    /// `send` must hold whole units of `datatype` (pairs of it for location
    /// operators). `recv` is only significant at the root.
    pub fn reduce_bytes(
        &self,
        send: &[u8],
        recv: &mut [u8],
        datatype: DataType,
        op: ReduceOp,
        root: i32,
    ) -> Result<()> {
        enforce(check_units(send.len(), datatype, op));
        let done = self
            .handle()
            .and_then(|h| h.reduce(send, recv, datatype, op, root));
        self.record(done)
    }

    /// Reduce raw bytes with the result on every rank.
    pub fn all_reduce_bytes(
        &self,
        send: &[u8],
        recv: &mut [u8],
        datatype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        enforce(check_units(send.len(), datatype, op));
        let done = self
            .handle()
            .and_then(|h| h.all_reduce(send, recv, datatype, op));
        self.record(done)
    }

    // ========================================================================
    // Derived collectives
    // ========================================================================

    /// The sorted, duplicate-free union of every rank's `input`, identical on
    /// every rank.
    pub fn union<T: Element + Ord>(&self, input: &[T]) -> Result<Vec<T>> {
        let mut all = self.all_gatherv(input, &mut Vec::new())?;
        all.sort_unstable();
        all.dedup();
        Ok(all)
    }

    /// Agree on the application error codes of every rank.
    ///
    /// Reduces each rank's [`error_code`](Self::error_code) with `op`; with
    /// [`ReduceOp::Max`] a nonzero result means some rank set an error.
    pub fn check(&self, op: ReduceOp) -> Result<i32> {
        self.all_reduce_scalar(self.error_code(), op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn layout_is_prefix_sum() {
        let (sizes, displs) = layout(&[2, 0, 3, 1], 8);
        assert_eq!(sizes, vec![16, 0, 24, 8]);
        assert_eq!(displs, vec![0, 16, 16, 40]);
    }

    #[test]
    fn table_checks() {
        assert!(check_table(&[1, 2], 2).is_ok());
        assert!(matches!(check_table(&[1], 2), Err(Error::InvalidCount(1))));
        assert!(check_contribution(&[1, 2], 1, 2).is_ok());
        assert!(check_contribution(&[1, 2], 1, 3).is_err());
        assert!(check_contribution(&[1], 4, 1).is_err());
        assert!(check_source(&[1, 2], 3).is_ok());
        assert!(check_source(&[1, 2], 2).is_err());
    }

    #[test]
    fn byte_reductions_need_whole_units() {
        assert!(check_units(16, DataType::Double, ReduceOp::Sum).is_ok());
        assert!(check_units(8, DataType::Double, ReduceOp::MinLoc).is_err());
        assert!(check_units(6, DataType::Int, ReduceOp::Max).is_err());
    }

    #[test]
    fn failed_string_broadcast_keeps_the_value() {
        use crate::transport::{Fabric, LocalTransport};

        let mut comm = Communicator::from_transport(LocalTransport::world(Fabric::new(1), 0));
        let mut name = String::from("mesh-7");
        assert!(matches!(
            comm.broadcast_string(&mut name, 3),
            Err(Error::InvalidRank(3))
        ));
        assert_eq!(name, "mesh-7");

        comm.broadcast_string(&mut name, 0).unwrap();
        assert_eq!(name, "mesh-7");

        comm.finalize().unwrap();
        assert!(matches!(
            comm.broadcast_string(&mut name, 0),
            Err(Error::Finalized)
        ));
        assert_eq!(name, "mesh-7");
    }

    proptest! {
        #[test]
        fn layout_slots_tile_the_buffer(counts in prop::collection::vec(0usize..50, 1..16), width in 1usize..16) {
            let (sizes, displs) = layout(&counts, width);
            let total: usize = counts.iter().sum::<usize>() * width;
            for i in 1..counts.len() {
                prop_assert_eq!(displs[i], displs[i - 1] + sizes[i - 1]);
            }
            let last = counts.len() - 1;
            prop_assert_eq!(displs[last] + sizes[last], total);
        }
    }
}
