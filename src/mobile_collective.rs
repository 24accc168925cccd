//! Collectives over [`MobileObject`]s.
//!
//! Packed sizes differ per object and per rank, so every transfer runs in two
//! phases. Sizes are exchanged first with a fixed-size collective (skipped
//! when the caller already supplies the per-rank count table), then the
//! concatenated payloads move with the variable-length primitive and each
//! receiver unpacks its slices. Pack buffers are released once the payload
//! phase is done.
//!
//! Packing runs before anything moves, so the ranks agree on its outcome
//! first. A rank whose pack failed returns its own error and every other
//! rank returns [`Error::PeerFailed`]; no rank is left waiting.

use crate::collective::layout;
use crate::comm::Communicator;
use crate::error::{Error, Result, SUCCESS};
use crate::mobile::MobileObject;
use crate::ReduceOp;
use log::{debug, warn};

/// Pack `mo` and check the reported size against its buffer.
fn pack_checked<M: MobileObject>(mo: &mut M) -> Result<usize> {
    let size = mo.pack()?;
    if size > mo.buffer_size() {
        return Err(Error::InvalidBuffer(format!(
            "packed size {size} exceeds a {} byte pack buffer",
            mo.buffer_size()
        )));
    }
    Ok(size)
}

/// Pack every object. Returns the packed sizes and the concatenated bytes.
fn pack_all<M: MobileObject>(mos: &mut [M]) -> Result<(Vec<usize>, Vec<u8>)> {
    let mut sizes = Vec::with_capacity(mos.len());
    let mut payload = Vec::new();
    for mo in mos.iter_mut() {
        let size = pack_checked(mo)?;
        payload.extend_from_slice(&mo.buffer()[..size]);
        sizes.push(size);
        mo.release_buffer();
    }
    Ok((sizes, payload))
}

/// Rebuild one object per entry of `sizes` from consecutive slices of `bytes`.
fn unpack_all<M: MobileObject + Default>(sizes: &[usize], bytes: &[u8]) -> Result<Vec<M>> {
    let (_, displs) = layout(sizes, 1);
    sizes
        .iter()
        .zip(displs)
        .map(|(&size, displ)| {
            let mut mo = M::default();
            mo.unpack(&bytes[displ..displ + size])?;
            Ok(mo)
        })
        .collect()
}

/// Sum consecutive runs of `sizes`, one run of `counts[i]` entries per rank.
fn per_rank_totals(sizes: &[usize], counts: &[usize]) -> Vec<usize> {
    let mut rest = sizes;
    counts
        .iter()
        .map(|&count| {
            let (run, tail) = rest.split_at(count.min(rest.len()));
            rest = tail;
            run.iter().sum()
        })
        .collect()
}

impl Communicator {
    /// Agree on the outcome of a local step every rank has taken.
    ///
    /// Collective: the largest error code wins.
    fn agree<T>(&self, local: Result<T>) -> Result<T> {
        let code = local.as_ref().map_or_else(Error::code, |_| SUCCESS);
        let worst = self.all_reduce_scalar(code, ReduceOp::Max)?;
        match local {
            Ok(_) if worst != SUCCESS => {
                warn!(rank = self.rank(), code = worst; "peer failed to pack");
                Err(Error::PeerFailed(worst))
            }
            outcome => outcome,
        }
    }

    /// Replace `mo` on every rank with the root's object.
    pub fn broadcast_mo<M: MobileObject>(&self, mo: &mut M, root: i32) -> Result<()> {
        let packed = if self.rank() == root { pack_checked(mo) } else { Ok(0) };
        let mut size = self.agree(packed)?;
        self.broadcast(&mut size, root)?;
        debug!(rank = self.rank(), root, bytes = size; "broadcast_mo");
        if self.rank() == root {
            self.broadcast_slice(&mut mo.pack_buffer_mut().as_mut_slice()[..size], root)?;
        } else {
            let mut bytes = vec![0u8; size];
            self.broadcast_slice(&mut bytes, root)?;
            mo.unpack(&bytes)?;
        }
        mo.release_buffer();
        Ok(())
    }

    /// Replace `mos` on every rank with the root's objects.
    ///
    /// Non-root ranks are resized to the root's length with default objects
    /// before unpacking.
    pub fn broadcast_mo_vec<M: MobileObject + Default>(&self, mos: &mut Vec<M>, root: i32) -> Result<()> {
        let packed = if self.rank() == root {
            pack_all(mos)
        } else {
            Ok((Vec::new(), Vec::new()))
        };
        let (mut sizes, mut payload) = self.agree(packed)?;
        self.broadcast_vec(&mut sizes, root)?;
        self.broadcast_vec(&mut payload, root)?;
        debug!(rank = self.rank(), root, objects = sizes.len(), bytes = payload.len(); "broadcast_mo_vec");
        if self.rank() != root {
            *mos = unpack_all(&sizes, &payload)?;
        }
        Ok(())
    }

    /// Gather one object per rank at the root, in rank order.
    ///
    /// Non-root ranks get an empty vector.
    pub fn gather_mo<M: MobileObject + Default>(&self, mo: &mut M, root: i32) -> Result<Vec<M>> {
        let (_, payload) = self.agree(pack_all(std::slice::from_mut(mo)))?;
        let mut sizes = Vec::new();
        let bytes = self.gatherv(&payload, &mut sizes, root)?;
        if self.rank() != root {
            return Ok(Vec::new());
        }
        unpack_all(&sizes, &bytes)
    }

    /// Gather a variable number of objects per rank at the root.
    ///
    /// `counts[i]` is the number of objects rank `i` contributes, significant
    /// at the root. If it is empty on every rank it is gathered first.
    /// Non-root ranks get an empty vector.
    pub fn gather_mo_vec<M: MobileObject + Default>(
        &self,
        mos: &mut [M],
        counts: &mut Vec<usize>,
        root: i32,
    ) -> Result<Vec<M>> {
        let (sizes, payload) = self.agree(pack_all(mos))?;
        let all_sizes = self.gatherv(&sizes, counts, root)?;
        let byte_counts = if self.rank() == root {
            per_rank_totals(&all_sizes, counts)
        } else {
            Vec::new()
        };
        let bytes = self.gatherv_known(&payload, &byte_counts, root)?;
        if self.rank() != root {
            return Ok(Vec::new());
        }
        unpack_all(&all_sizes, &bytes)
    }

    /// Gather one object per rank on every rank, in rank order.
    pub fn all_gather_mo<M: MobileObject + Default>(&self, mo: &mut M) -> Result<Vec<M>> {
        let (_, payload) = self.agree(pack_all(std::slice::from_mut(mo)))?;
        let mut sizes = Vec::new();
        let bytes = self.all_gatherv(&payload, &mut sizes)?;
        unpack_all(&sizes, &bytes)
    }

    /// Gather a variable number of objects per rank on every rank.
    ///
    /// `counts[i]` is the number of objects rank `i` contributes; if empty it
    /// is exchanged first and left in `counts`.
    pub fn all_gather_mo_vec<M: MobileObject + Default>(
        &self,
        mos: &mut [M],
        counts: &mut Vec<usize>,
    ) -> Result<Vec<M>> {
        let (sizes, payload) = self.agree(pack_all(mos))?;
        let all_sizes = self.all_gatherv(&sizes, counts)?;
        let mut byte_counts = per_rank_totals(&all_sizes, counts);
        let bytes = self.all_gatherv(&payload, &mut byte_counts)?;
        unpack_all(&all_sizes, &bytes)
    }
}
