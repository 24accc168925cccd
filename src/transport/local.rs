//! In-process substrate: every rank is a thread sharing one fabric.
//!
//! Messages are matched the way MPI matches them. A receive is posted in
//! order; an arriving message goes to the earliest posted receive that
//! accepts its source and tag, or waits in the unexpected queue until one is
//! posted. Sends are eager and never block.
//!
//! Collectives are linear: contributions travel to the root over point-to-
//! point messages on a hidden context, so they can never be matched by user
//! receives, and are tagged with a per-endpoint collective sequence number.

use super::{Delivery, RawRequest, Transport, ANY_SOURCE, ANY_TAG};
use crate::datatype::DataType;
use crate::error::{Error, Result};
use crate::reduce;
use crate::status::Status;
use crate::ReduceOp;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Context of the world group. Every group owns a pair of contexts: an even
/// one for user traffic and the following odd one for collectives.
const WORLD_CONTEXT: u64 = 0;

/// Split color reserved for duplicated groups.
const DUP_COLOR: i32 = i32::MIN;

struct Envelope {
    source: i32,
    tag: i32,
    payload: Vec<u8>,
}

struct Posted {
    ticket: u64,
    source: i32,
    tag: i32,
    capacity: usize,
}

impl Posted {
    fn accepts(&self, envelope: &Envelope) -> bool {
        (self.source == ANY_SOURCE || self.source == envelope.source)
            && (self.tag == ANY_TAG || self.tag == envelope.tag)
    }
}

#[derive(Default)]
struct Mailbox {
    unexpected: VecDeque<Envelope>,
    posted: VecDeque<Posted>,
}

enum Completion {
    Sent { dest: i32, tag: i32, bytes: usize },
    Received { envelope: Envelope, capacity: usize },
}

#[derive(Default)]
struct State {
    /// Keyed by (context, world rank of the receiver).
    mailboxes: HashMap<(u64, usize), Mailbox>,
    /// Tickets of posted receives and where they are posted.
    posted_at: HashMap<u64, (u64, usize)>,
    completed: HashMap<u64, Completion>,
    /// Contexts agreed for (parent context, sequence, color).
    contexts: HashMap<(u64, u64, i32), u64>,
    next_context: u64,
    next_ticket: u64,
}

/// Shared state of one in-process universe.
pub(crate) struct Fabric {
    size: usize,
    state: Mutex<State>,
    arrivals: Condvar,
    released: Vec<AtomicBool>,
    aborted: AtomicBool,
}

impl Fabric {
    pub(crate) fn new(size: usize) -> Arc<Self> {
        Arc::new(Fabric {
            size,
            state: Mutex::new(State {
                next_context: WORLD_CONTEXT + 2,
                ..State::default()
            }),
            arrivals: Condvar::new(),
            released: (0..size).map(|_| AtomicBool::new(false)).collect(),
            aborted: AtomicBool::new(false),
        })
    }

    /// Tear the whole group down after a rank failure. Every blocked and
    /// future operation fails with [`Error::Aborted`].
    pub(crate) fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            debug!("aborting fabric");
        }
        let _state = self.state.lock();
        self.arrivals.notify_all();
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Whether every world endpoint has been released.
    pub(crate) fn all_released(&self) -> bool {
        self.released.iter().all(|r| r.load(Ordering::SeqCst))
    }

    fn context_for(&self, parent: u64, sequence: u64, color: i32) -> u64 {
        let mut state = self.state.lock();
        if let Some(&context) = state.contexts.get(&(parent, sequence, color)) {
            return context;
        }
        let context = state.next_context;
        state.next_context += 2;
        state.contexts.insert((parent, sequence, color), context);
        context
    }

    fn deliver(&self, context: u64, dest_world: usize, envelope: Envelope) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let mailbox = state.mailboxes.entry((context, dest_world)).or_default();
        match mailbox.posted.iter().position(|p| p.accepts(&envelope)) {
            Some(index) => {
                if let Some(posted) = mailbox.posted.remove(index) {
                    state.posted_at.remove(&posted.ticket);
                    state.completed.insert(
                        posted.ticket,
                        Completion::Received {
                            envelope,
                            capacity: posted.capacity,
                        },
                    );
                }
            }
            None => mailbox.unexpected.push_back(envelope),
        }
        self.arrivals.notify_all();
    }

    fn complete_send(&self, dest: i32, tag: i32, bytes: usize) -> u64 {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state
            .completed
            .insert(ticket, Completion::Sent { dest, tag, bytes });
        ticket
    }

    fn post(&self, context: u64, world: usize, source: i32, tag: i32, capacity: usize) -> u64 {
        let mut state = self.state.lock();
        let state = &mut *state;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let posted = Posted {
            ticket,
            source,
            tag,
            capacity,
        };
        let mailbox = state.mailboxes.entry((context, world)).or_default();
        match mailbox.unexpected.iter().position(|e| posted.accepts(e)) {
            Some(index) => {
                if let Some(envelope) = mailbox.unexpected.remove(index) {
                    state
                        .completed
                        .insert(ticket, Completion::Received { envelope, capacity });
                }
            }
            None => {
                mailbox.posted.push_back(posted);
                state.posted_at.insert(ticket, (context, world));
            }
        }
        ticket
    }

    fn wait(&self, ticket: u64) -> Result<Delivery> {
        let mut state = self.state.lock();
        loop {
            if let Some(completion) = state.completed.remove(&ticket) {
                return match completion {
                    Completion::Sent { dest, tag, bytes } => Ok(Delivery {
                        status: Status {
                            source: dest,
                            tag,
                            bytes,
                        },
                        payload: Vec::new(),
                    }),
                    Completion::Received { envelope, capacity } => {
                        if envelope.payload.len() > capacity {
                            return Err(Error::Truncated {
                                capacity,
                                actual: envelope.payload.len(),
                            });
                        }
                        Ok(Delivery {
                            status: Status {
                                source: envelope.source,
                                tag: envelope.tag,
                                bytes: envelope.payload.len(),
                            },
                            payload: envelope.payload,
                        })
                    }
                };
            }
            if !state.posted_at.contains_key(&ticket) {
                return Err(Error::InvalidRequest(ticket));
            }
            if self.is_aborted() {
                return Err(Error::Aborted);
            }
            self.arrivals.wait(&mut state);
        }
    }

    fn test(&self, ticket: u64) -> Result<bool> {
        let state = self.state.lock();
        if state.completed.contains_key(&ticket) {
            Ok(true)
        } else if state.posted_at.contains_key(&ticket) {
            Ok(false)
        } else {
            Err(Error::InvalidRequest(ticket))
        }
    }

    fn forget(&self, ticket: u64) {
        let mut state = self.state.lock();
        state.completed.remove(&ticket);
        if let Some(key) = state.posted_at.remove(&ticket) {
            if let Some(mailbox) = state.mailboxes.get_mut(&key) {
                mailbox.posted.retain(|p| p.ticket != ticket);
            }
        }
    }
}

/// One rank's endpoint in a group of the in-process fabric.
///
/// World endpoints are created by [`Universe::run`](crate::Universe::run);
/// derived endpoints come from [`split`](Transport::split) and
/// [`duplicate`](Transport::duplicate).
pub struct LocalTransport {
    fabric: Arc<Fabric>,
    context: u64,
    rank: i32,
    /// World rank of every group member, indexed by group rank.
    members: Arc<[usize]>,
    /// Number of live derived endpoints on this rank, shared with the world
    /// endpoint so it cannot be released while they exist.
    open_derived: Arc<AtomicUsize>,
    derived: bool,
    released: Cell<bool>,
    sequence: Cell<u64>,
}

impl LocalTransport {
    pub(crate) fn world(fabric: Arc<Fabric>, rank: usize) -> Self {
        let members: Arc<[usize]> = (0..fabric.size).collect();
        LocalTransport {
            fabric,
            context: WORLD_CONTEXT,
            rank: rank as i32,
            members,
            open_derived: Arc::new(AtomicUsize::new(0)),
            derived: false,
            released: Cell::new(false),
            sequence: Cell::new(0),
        }
    }

    fn derive(&self, context: u64, rank: usize, members: Arc<[usize]>) -> Self {
        self.open_derived.fetch_add(1, Ordering::SeqCst);
        LocalTransport {
            fabric: Arc::clone(&self.fabric),
            context,
            rank: rank as i32,
            members,
            open_derived: Arc::clone(&self.open_derived),
            derived: true,
            released: Cell::new(false),
            sequence: Cell::new(0),
        }
    }

    fn world_rank(&self) -> usize {
        self.members[self.rank as usize]
    }

    fn ensure_live(&self) -> Result<()> {
        if self.fabric.is_aborted() {
            return Err(Error::Aborted);
        }
        if self.released.get() || self.fabric.released[self.world_rank()].load(Ordering::SeqCst) {
            return Err(Error::Finalized);
        }
        Ok(())
    }

    fn check_peer(&self, rank: i32) -> Result<usize> {
        if rank < 0 || rank as usize >= self.members.len() {
            return Err(Error::InvalidRank(rank));
        }
        Ok(rank as usize)
    }

    fn check_source(&self, source: i32) -> Result<()> {
        if source != ANY_SOURCE {
            self.check_peer(source)?;
        }
        Ok(())
    }

    fn next_sequence(&self) -> u64 {
        let sequence = self.sequence.get();
        self.sequence.set(sequence + 1);
        sequence
    }

    fn collective_tag(&self) -> i32 {
        (self.next_sequence() % i32::MAX as u64) as i32
    }

    fn post_to(&self, context: u64, dest: usize, tag: i32, payload: Vec<u8>) {
        trace!(context, source = self.rank, dest, tag, bytes = payload.len(); "post");
        self.fabric.deliver(
            context,
            self.members[dest],
            Envelope {
                source: self.rank,
                tag,
                payload,
            },
        );
    }

    fn take_from(&self, context: u64, source: i32, tag: i32, capacity: usize) -> Result<Delivery> {
        let ticket = self
            .fabric
            .post(context, self.world_rank(), source, tag, capacity);
        let delivery = self.fabric.wait(ticket);
        if delivery.is_err() {
            self.fabric.forget(ticket);
        }
        delivery
    }

    /// Receive exactly `into.len()` bytes of collective traffic.
    fn take_exact(&self, source: usize, tag: i32, into: &mut [u8]) -> Result<()> {
        let delivery = self.take_from(self.context + 1, source as i32, tag, into.len())?;
        if delivery.payload.len() != into.len() {
            return Err(Error::InvalidCount(delivery.payload.len() as i64));
        }
        into.copy_from_slice(&delivery.payload);
        Ok(())
    }

    fn check_layout(&self, counts: &[usize], displs: &[usize], buffer: usize) -> Result<()> {
        if counts.len() != self.members.len() || displs.len() != self.members.len() {
            return Err(Error::InvalidCount(counts.len() as i64));
        }
        for (&count, &displ) in counts.iter().zip(displs) {
            if displ + count > buffer {
                return Err(Error::InvalidBuffer(format!(
                    "slot {displ}..{} exceeds a {buffer} byte buffer",
                    displ + count
                )));
            }
        }
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.members.len() as i32
    }

    fn send(&self, buf: &[u8], dest: i32, tag: i32) -> Result<()> {
        self.ensure_live()?;
        let dest = self.check_peer(dest)?;
        if tag < 0 {
            return Err(Error::InvalidTag(tag));
        }
        self.post_to(self.context, dest, tag, buf.to_vec());
        Ok(())
    }

    fn recv(&self, buf: &mut [u8], source: i32, tag: i32) -> Result<Status> {
        self.ensure_live()?;
        self.check_source(source)?;
        let delivery = self.take_from(self.context, source, tag, buf.len())?;
        buf[..delivery.payload.len()].copy_from_slice(&delivery.payload);
        trace!(context = self.context, rank = self.rank, source = delivery.status.source, tag = delivery.status.tag; "recv");
        Ok(delivery.status)
    }

    fn isend(&self, buf: &[u8], dest: i32, tag: i32) -> Result<RawRequest> {
        self.send(buf, dest, tag)?;
        Ok(self.fabric.complete_send(dest, tag, buf.len()))
    }

    fn irecv(&self, capacity: usize, source: i32, tag: i32) -> Result<RawRequest> {
        self.ensure_live()?;
        self.check_source(source)?;
        Ok(self
            .fabric
            .post(self.context, self.world_rank(), source, tag, capacity))
    }

    fn wait(&self, request: RawRequest) -> Result<Delivery> {
        self.fabric.wait(request)
    }

    fn test(&self, request: RawRequest) -> Result<bool> {
        self.fabric.test(request)
    }

    fn request_free(&self, request: RawRequest) {
        self.fabric.forget(request);
    }

    fn barrier(&self) -> Result<()> {
        self.ensure_live()?;
        let tag = self.collective_tag();
        let coll = self.context + 1;
        if self.rank == 0 {
            for peer in 1..self.members.len() {
                self.take_exact(peer, tag, &mut [])?;
            }
            for peer in 1..self.members.len() {
                self.post_to(coll, peer, tag, Vec::new());
            }
        } else {
            self.post_to(coll, 0, tag, Vec::new());
            self.take_exact(0, tag, &mut [])?;
        }
        Ok(())
    }

    fn broadcast(&self, buf: &mut [u8], root: i32) -> Result<()> {
        self.ensure_live()?;
        let root = self.check_peer(root)?;
        let tag = self.collective_tag();
        if self.rank as usize == root {
            for peer in (0..self.members.len()).filter(|&p| p != root) {
                self.post_to(self.context + 1, peer, tag, buf.to_vec());
            }
            Ok(())
        } else {
            self.take_exact(root, tag, buf)
        }
    }

    fn gatherv(
        &self,
        send: &[u8],
        recv: &mut [u8],
        counts: &[usize],
        displs: &[usize],
        root: i32,
    ) -> Result<()> {
        self.ensure_live()?;
        let root = self.check_peer(root)?;
        let tag = self.collective_tag();
        if self.rank as usize != root {
            self.post_to(self.context + 1, root, tag, send.to_vec());
            return Ok(());
        }
        self.check_layout(counts, displs, recv.len())?;
        for peer in 0..self.members.len() {
            let slot = &mut recv[displs[peer]..displs[peer] + counts[peer]];
            if peer == root {
                if send.len() != slot.len() {
                    return Err(Error::InvalidCount(send.len() as i64));
                }
                slot.copy_from_slice(send);
            } else {
                self.take_exact(peer, tag, slot)?;
            }
        }
        Ok(())
    }

    fn all_gatherv(
        &self,
        send: &[u8],
        recv: &mut [u8],
        counts: &[usize],
        displs: &[usize],
    ) -> Result<()> {
        self.check_layout(counts, displs, recv.len())?;
        self.gatherv(send, recv, counts, displs, 0)?;
        self.broadcast(recv, 0)
    }

    fn scatterv(
        &self,
        send: &[u8],
        counts: &[usize],
        displs: &[usize],
        recv: &mut [u8],
        root: i32,
    ) -> Result<()> {
        self.ensure_live()?;
        let root = self.check_peer(root)?;
        let tag = self.collective_tag();
        if self.rank as usize != root {
            return self.take_exact(root, tag, recv);
        }
        self.check_layout(counts, displs, send.len())?;
        for peer in 0..self.members.len() {
            let slice = &send[displs[peer]..displs[peer] + counts[peer]];
            if peer == root {
                if recv.len() != slice.len() {
                    return Err(Error::InvalidCount(recv.len() as i64));
                }
                recv.copy_from_slice(slice);
            } else {
                self.post_to(self.context + 1, peer, tag, slice.to_vec());
            }
        }
        Ok(())
    }

    fn reduce(
        &self,
        send: &[u8],
        recv: &mut [u8],
        datatype: DataType,
        op: ReduceOp,
        root: i32,
    ) -> Result<()> {
        self.ensure_live()?;
        let root = self.check_peer(root)?;
        let tag = self.collective_tag();
        if self.rank as usize != root {
            self.post_to(self.context + 1, root, tag, send.to_vec());
            return Ok(());
        }
        if recv.len() != send.len() {
            return Err(Error::InvalidBuffer(format!(
                "reduce result needs {} bytes, got {}",
                send.len(),
                recv.len()
            )));
        }
        let mut contributions = Vec::with_capacity(self.members.len());
        for peer in 0..self.members.len() {
            if peer == root {
                contributions.push(send.to_vec());
            } else {
                let mut incoming = vec![0u8; send.len()];
                self.take_exact(peer, tag, &mut incoming)?;
                contributions.push(incoming);
            }
        }
        let mut contributions = contributions.into_iter();
        if let Some(first) = contributions.next() {
            recv.copy_from_slice(&first);
        }
        for incoming in contributions {
            reduce::combine(datatype, op, recv, &incoming)?;
        }
        Ok(())
    }

    fn all_reduce(
        &self,
        send: &[u8],
        recv: &mut [u8],
        datatype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        if recv.len() != send.len() {
            return Err(Error::InvalidBuffer(format!(
                "all_reduce result needs {} bytes, got {}",
                send.len(),
                recv.len()
            )));
        }
        self.reduce(send, recv, datatype, op, 0)?;
        self.broadcast(recv, 0)
    }

    fn split(&self, color: i32, key: i32) -> Result<Option<Box<dyn Transport>>> {
        self.ensure_live()?;
        let sequence = self.sequence.get();
        let mine: Vec<u8> = color
            .to_ne_bytes()
            .into_iter()
            .chain(key.to_ne_bytes())
            .collect();
        let mut table = vec![0u8; mine.len() * self.members.len()];
        self.all_gather(&mine, &mut table)?;

        if color < 0 {
            debug!(rank = self.rank, color; "split: left out");
            return Ok(None);
        }

        let mut group: Vec<(i32, usize)> = table
            .chunks_exact(8)
            .enumerate()
            .filter_map(|(rank, entry)| {
                let c = i32::from_ne_bytes([entry[0], entry[1], entry[2], entry[3]]);
                let k = i32::from_ne_bytes([entry[4], entry[5], entry[6], entry[7]]);
                (c == color).then_some((k, rank))
            })
            .collect();
        group.sort_unstable();

        let new_rank = group
            .iter()
            .position(|&(_, rank)| rank == self.rank as usize)
            .ok_or_else(|| Error::Internal("split lost the calling rank".into()))?;
        let members: Arc<[usize]> = group.iter().map(|&(_, rank)| self.members[rank]).collect();
        let context = self.fabric.context_for(self.context, sequence, color);
        debug!(rank = self.rank, color, key, new_rank, size = members.len(), context; "split");
        Ok(Some(Box::new(self.derive(context, new_rank, members))))
    }

    fn duplicate(&self) -> Result<Box<dyn Transport>> {
        self.ensure_live()?;
        // Every rank advances its sequence here, so all agree on the context.
        let sequence = self.next_sequence();
        let context = self.fabric.context_for(self.context, sequence, DUP_COLOR);
        debug!(rank = self.rank, context; "duplicate");
        Ok(Box::new(self.derive(
            context,
            self.rank as usize,
            Arc::clone(&self.members),
        )))
    }

    fn release(&self) -> Result<()> {
        if self.released.get() {
            return Ok(());
        }
        if self.derived {
            self.open_derived.fetch_sub(1, Ordering::SeqCst);
        } else {
            let open = self.open_derived.load(Ordering::SeqCst);
            if open > 0 {
                return Err(Error::OpenHandles(open));
            }
            self.fabric.released[self.world_rank()].store(true, Ordering::SeqCst);
        }
        self.released.set(true);
        debug!(rank = self.rank, context = self.context, derived = self.derived; "released endpoint");
        Ok(())
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        // Derived endpoints dropped without release still stop counting as open.
        if self.derived && !self.released.get() {
            self.open_derived.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
