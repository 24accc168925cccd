//! The group context: one rank's view of a fixed process group.
//!
//! This module holds the lifecycle, point-to-point and request-ledger side of
//! [`Communicator`]. Collectives live in [`crate::collective`] and mobile
//! object transfers in [`crate::mobile_collective`].

use crate::datatype::{as_bytes, as_bytes_mut, Element};
use crate::error::{Error, Result, SUCCESS};
use crate::persistent::{PersistentRequest, Shape};
use crate::request::{Operation, Received, Request, RequestId, RequestLedger, Side};
use crate::status::Status;
use crate::transport::Transport;
use log::{debug, warn};
use std::cell::Cell;
use std::fmt;
use std::mem::size_of;
use std::rc::Rc;

/// A group context.
///
/// A communicator either owns its substrate endpoint (created by a
/// [`Universe`](crate::Universe), a split or a duplicate) or wraps one owned
/// by another communicator. Only an owner releases the endpoint, on
/// [`finalize`](Self::finalize) or drop.
///
/// Communicators are neither `Send` nor `Sync`: each rank drives its own.
///
/// # Example
///
/// ```no_run
/// use rankcomm::{LaunchConfig, Universe};
///
/// let universe = Universe::new(LaunchConfig::default().with_ranks(4)).unwrap();
/// universe
///     .run(|world| println!("I am rank {} of {}", world.rank(), world.size()))
///     .unwrap();
/// ```
pub struct Communicator {
    handle: Option<Rc<dyn Transport>>,
    rank: i32,
    size: i32,
    own_comm: bool,
    finalized: bool,
    /// Application error code shared through `check`
    error: i32,
    /// Return code of the most recent operation
    rc: Cell<i32>,
    ledger: RequestLedger,
}

impl Communicator {
    /// An uninitialized communicator. Every operation fails with
    /// [`Error::NotInitialized`] until [`initialize`](Self::initialize) is called.
    pub fn new() -> Self {
        Communicator {
            handle: None,
            rank: 0,
            size: 0,
            own_comm: false,
            finalized: false,
            error: SUCCESS,
            rc: Cell::new(SUCCESS),
            ledger: RequestLedger::default(),
        }
    }

    /// Adopt a substrate endpoint. The communicator owns it.
    pub fn from_transport(transport: impl Transport + 'static) -> Self {
        Self::from_boxed(Box::new(transport))
    }

    /// Adopt a boxed substrate endpoint. The communicator owns it.
    pub fn from_boxed(transport: Box<dyn Transport>) -> Self {
        let mut comm = Communicator::new();
        comm.attach(Rc::from(transport), true);
        comm
    }

    /// A communicator over the same endpoint as `other` that does not own it.
    pub fn wrap(other: &Communicator) -> Result<Self> {
        let mut comm = Communicator::new();
        comm.initialize(other)?;
        Ok(comm)
    }

    fn attach(&mut self, handle: Rc<dyn Transport>, own: bool) {
        self.rank = handle.rank();
        self.size = handle.size();
        self.own_comm = own;
        self.handle = Some(handle);
        debug!(rank = self.rank, size = self.size, owned = own; "communicator initialized");
    }

    /// Wrap the endpoint of `parent` without owning it.
    ///
    /// Initializing an already initialized communicator is a no-op.
    pub fn initialize(&mut self, parent: &Communicator) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let handle = Rc::clone(parent.handle()?);
        self.finalized = false;
        self.attach(handle, false);
        Ok(())
    }

    /// Adopt `transport` and own it.
    ///
    /// Initializing an already initialized communicator is a no-op and
    /// `transport` is dropped.
    pub fn initialize_with(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        self.finalized = false;
        self.attach(Rc::from(transport), true);
        Ok(())
    }

    pub(crate) fn handle(&self) -> Result<&Rc<dyn Transport>> {
        if self.finalized {
            return Err(Error::Finalized);
        }
        self.handle.as_ref().ok_or(Error::NotInitialized)
    }

    /// The substrate endpoint (for advanced use).
    pub fn transport(&self) -> Result<&dyn Transport> {
        self.handle().map(|h| h.as_ref())
    }

    /// Remember the return code of `result` for [`last_code`](Self::last_code).
    pub(crate) fn record<T>(&self, result: Result<T>) -> Result<T> {
        self.rc.set(match &result {
            Ok(_) => SUCCESS,
            Err(err) => err.code(),
        });
        result
    }

    /// Whether the communicator is attached to a live endpoint.
    pub fn is_initialized(&self) -> bool {
        self.handle.is_some() && !self.finalized
    }

    /// Whether this communicator releases its endpoint on finalize.
    pub fn owns_handle(&self) -> bool {
        self.own_comm
    }

    /// Rank of the calling process in this group.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Number of processes in this group.
    pub fn size(&self) -> i32 {
        self.size
    }

    /// Integer return code of the most recent operation, 0 on success.
    pub fn last_code(&self) -> i32 {
        self.rc.get()
    }

    /// Set the local application error code.
    pub fn set_err(&mut self, code: i32) -> i32 {
        self.error = code;
        code
    }

    /// Reset the local application error code.
    pub fn clear_err(&mut self) {
        self.error = SUCCESS;
    }

    /// The local application error code.
    pub fn error_code(&self) -> i32 {
        self.error
    }

    /// Partition this group by `color`, ordering each part by `key`.
    ///
    /// Returns `None` on ranks that pass a negative color
    /// ([`UNDEFINED`](crate::UNDEFINED)). The new communicator owns its endpoint.
    pub fn split(&self, color: i32, key: i32) -> Result<Option<Communicator>> {
        let split = self.handle().and_then(|h| h.split(color, key));
        Ok(self.record(split)?.map(Communicator::from_boxed))
    }

    /// An owned copy of this group with its own message space.
    pub fn duplicate(&self) -> Result<Communicator> {
        let dup = self.handle().and_then(|h| h.duplicate());
        Ok(Communicator::from_boxed(self.record(dup)?))
    }

    /// Detach from the endpoint, releasing it if this communicator owns it.
    ///
    /// Open requests are abandoned. Calling this more than once is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::OpenHandles`] if this owns a world endpoint and communicators
    /// derived from it are still alive. The communicator stays usable.
    pub fn finalize(&mut self) -> Result<()> {
        let Some(handle) = self.handle.as_ref() else {
            return Ok(());
        };
        if self.finalized {
            return Ok(());
        }
        if self.own_comm {
            self.record(handle.release())?;
        }
        let abandoned = self.ledger.clear();
        if abandoned > 0 {
            warn!(rank = self.rank, abandoned; "finalize abandoned open requests");
        }
        debug!(rank = self.rank, owned = self.own_comm; "communicator finalized");
        self.finalized = true;
        self.handle = None;
        Ok(())
    }

    /// Block until every rank of the group has entered the barrier.
    pub fn barrier(&self) -> Result<()> {
        let barrier = self.handle().and_then(|h| h.barrier());
        self.record(barrier)
    }

    fn check_peer(&self, rank: i32) -> Result<()> {
        if rank < 0 || rank >= self.size {
            return Err(Error::InvalidRank(rank));
        }
        Ok(())
    }

    // ========================================================================
    // Blocking point-to-point
    // ========================================================================

    /// Send raw bytes to `dest`.
    pub fn send_bytes(&self, buf: &[u8], dest: i32, tag: i32) -> Result<()> {
        let sent = self.handle().and_then(|h| h.send(buf, dest, tag));
        self.record(sent)
    }

    /// Receive raw bytes into `buf`.
    ///
    /// Use [`ANY_SOURCE`](crate::ANY_SOURCE) and [`ANY_TAG`](crate::ANY_TAG) as
    /// wildcards. The message may be shorter than `buf`; the returned
    /// [`Status`] carries its actual size.
    pub fn recv_bytes(&self, buf: &mut [u8], source: i32, tag: i32) -> Result<Status> {
        let received = self.handle().and_then(|h| h.recv(buf, source, tag));
        self.record(received)
    }

    /// Send a slice of elements to `dest`.
    pub fn send<T: Element>(&self, data: &[T], dest: i32, tag: i32) -> Result<()> {
        self.send_bytes(as_bytes(data), dest, tag)
    }

    /// Receive elements into `data`.
    pub fn recv<T: Element>(&self, data: &mut [T], source: i32, tag: i32) -> Result<Status> {
        self.recv_bytes(as_bytes_mut(data), source, tag)
    }

    // ========================================================================
    // Non-blocking point-to-point
    // ========================================================================

    /// Issue a send of raw bytes and register it in the request ledger.
    ///
    /// The bytes are captured at issue time, so `buf` may be reused at once.
    pub fn asend_bytes(&mut self, buf: &[u8], dest: i32, tag: i32) -> Result<RequestId> {
        let handle = Rc::clone(self.handle()?);
        let raw = self.record(handle.isend(buf, dest, tag))?;
        let op = Operation::OneShot(Request::new(raw, handle));
        Ok(self.ledger.register(Side::Send, tag, op))
    }

    /// Issue a send of a slice of elements.
    pub fn asend<T: Element>(&mut self, data: &[T], dest: i32, tag: i32) -> Result<RequestId> {
        self.asend_bytes(as_bytes(data), dest, tag)
    }

    /// Post a receive of at most `capacity` bytes and register it in the
    /// request ledger. Complete it with [`wait_recv`](Self::wait_recv).
    pub fn arecv_bytes(&mut self, capacity: usize, source: i32, tag: i32) -> Result<RequestId> {
        let handle = Rc::clone(self.handle()?);
        let raw = self.record(handle.irecv(capacity, source, tag))?;
        let op = Operation::OneShot(Request::new(raw, handle));
        Ok(self.ledger.register(Side::Recv, tag, op))
    }

    /// Post a receive of at most `count` elements of `T`.
    pub fn arecv<T: Element>(&mut self, count: usize, source: i32, tag: i32) -> Result<RequestId> {
        self.arecv_bytes(count * size_of::<T>(), source, tag)
    }

    /// Wait for the receive `id` and return what arrived.
    ///
    /// One-shot receives leave the ledger; persistent ones stay registered.
    pub fn wait_recv(&mut self, id: RequestId) -> Result<Received> {
        let delivery = self.ledger.complete(Side::Recv, id);
        self.record(delivery).map(|d| Received::new(id, d))
    }

    /// Wait for the send `id`.
    pub fn wait_send(&mut self, id: RequestId) -> Result<Status> {
        let delivery = self.ledger.complete(Side::Send, id);
        self.record(delivery).map(|d| d.status)
    }

    /// Whether the receive `id` has completed, without blocking.
    pub fn test_recv(&mut self, id: RequestId) -> Result<bool> {
        let done = self.ledger.test(Side::Recv, id);
        self.record(done)
    }

    /// Whether the send `id` has completed, without blocking.
    pub fn test_send(&mut self, id: RequestId) -> Result<bool> {
        let done = self.ledger.test(Side::Send, id);
        self.record(done)
    }

    /// Wait for every request in the ledger.
    ///
    /// One-shot requests leave the ledger. Persistent registrations are not
    /// cleared: they stay for the next [`send_all`](Self::send_all) or
    /// [`recv_all`](Self::recv_all) until [`clear_requests`](Self::clear_requests)
    /// drops them, so the ledger is only empty afterwards if nothing
    /// persistent was registered. Returns the completed receives in issue
    /// order. Every request is completed even if one fails; the first failure
    /// is returned.
    pub fn wait_all(&mut self) -> Result<Vec<Received>> {
        let (received, failure) = self.ledger.complete_all();
        match failure {
            Some(err) => self.record(Err(err)),
            None => self.record(Ok(received)),
        }
    }

    /// Abandon every open request without waiting.
    ///
    /// Messages already matched by abandoned receives are lost. Returns how
    /// many requests were dropped.
    pub fn clear_requests(&mut self) -> usize {
        let cleared = self.ledger.clear();
        debug!(rank = self.rank, cleared; "cleared requests");
        cleared
    }

    /// Number of requests in the ledger, sends plus receives.
    pub fn n_open_requests(&self) -> usize {
        self.ledger.len()
    }

    /// Application tag the request `id` was registered with.
    pub fn request_tag(&self, id: RequestId) -> Option<i32> {
        self.ledger
            .tag(Side::Send, id)
            .or_else(|| self.ledger.tag(Side::Recv, id))
    }

    // ========================================================================
    // Persistent point-to-point
    // ========================================================================

    /// Register a persistent send of `data` to `dest`.
    ///
    /// The payload is captured now and can be replaced between starts with
    /// [`update_send`](Self::update_send).
    pub fn set_send<T: Element>(&mut self, data: &[T], dest: i32, tag: i32) -> Result<RequestId> {
        let handle = Rc::clone(self.handle()?);
        self.record(self.check_peer(dest))?;
        if tag < 0 {
            return self.record(Err(Error::InvalidTag(tag)));
        }
        let shape = Shape::Send {
            payload: as_bytes(data).to_vec(),
            dest,
        };
        let op = Operation::Persistent(PersistentRequest::new(shape, tag, handle));
        Ok(self.ledger.register(Side::Send, tag, op))
    }

    /// Register a persistent receive of up to `count` elements of `T`.
    pub fn set_recv<T: Element>(&mut self, count: usize, source: i32, tag: i32) -> Result<RequestId> {
        let handle = Rc::clone(self.handle()?);
        if source != crate::ANY_SOURCE {
            self.record(self.check_peer(source))?;
        }
        let shape = Shape::Recv {
            capacity: count * size_of::<T>(),
            source,
        };
        let op = Operation::Persistent(PersistentRequest::new(shape, tag, handle));
        Ok(self.ledger.register(Side::Recv, tag, op))
    }

    /// Replace the payload of the persistent send `id`.
    ///
    /// The new payload must have the registered byte size.
    pub fn update_send<T: Element>(&mut self, id: RequestId, data: &[T]) -> Result<()> {
        let updated = self
            .ledger
            .entry_mut(Side::Send, id)
            .and_then(|e| e.persistent_mut())
            .and_then(|r| r.update(as_bytes(data)));
        self.record(updated)
    }

    /// Start the persistent send `id`.
    pub fn start_send(&mut self, id: RequestId) -> Result<()> {
        let started = self
            .ledger
            .entry_mut(Side::Send, id)
            .and_then(|e| e.persistent_mut())
            .and_then(|r| r.start());
        self.record(started)
    }

    /// Start the persistent receive `id`.
    pub fn start_recv(&mut self, id: RequestId) -> Result<()> {
        let started = self
            .ledger
            .entry_mut(Side::Recv, id)
            .and_then(|e| e.persistent_mut())
            .and_then(|r| r.start());
        self.record(started)
    }

    /// Start every registered persistent send. Returns how many were started.
    pub fn send_all(&mut self) -> Result<usize> {
        let started = PersistentRequest::start_all(self.ledger.persistent_mut(Side::Send));
        self.record(started)
    }

    /// Start every registered persistent receive. Returns how many were started.
    pub fn recv_all(&mut self) -> Result<usize> {
        let started = PersistentRequest::start_all(self.ledger.persistent_mut(Side::Recv));
        self.record(started)
    }
}

impl Default for Communicator {
    fn default() -> Self {
        Communicator::new()
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("initialized", &self.is_initialized())
            .field("own_comm", &self.own_comm)
            .field("open_requests", &self.ledger.len())
            .finish()
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        if let Err(err) = self.finalize() {
            warn!(rank = self.rank, code = err.code(); "finalize on drop failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Fabric, LocalTransport, ANY_SOURCE};
    use std::sync::Arc;

    fn single() -> Communicator {
        Communicator::from_transport(LocalTransport::world(Fabric::new(1), 0))
    }

    fn pair() -> (Communicator, Communicator) {
        let fabric = Fabric::new(2);
        (
            Communicator::from_transport(LocalTransport::world(Arc::clone(&fabric), 0)),
            Communicator::from_transport(LocalTransport::world(fabric, 1)),
        )
    }

    #[test]
    fn uninitialized_operations_fail() {
        let comm = Communicator::new();
        assert!(!comm.is_initialized());
        assert!(matches!(comm.barrier(), Err(Error::NotInitialized)));
        assert_eq!(comm.last_code(), crate::error::codes::NOT_INITIALIZED);
        assert!(matches!(comm.split(0, 0), Err(Error::NotInitialized)));
    }

    #[test]
    fn initialize_is_idempotent() {
        let world = single();
        let mut comm = Communicator::new();
        comm.initialize(&world).unwrap();
        comm.initialize(&world).unwrap();
        assert!(comm.is_initialized());
        assert!(!comm.owns_handle());
        assert!(world.owns_handle());

        let mut adopted = Communicator::new();
        adopted
            .initialize_with(Box::new(LocalTransport::world(Fabric::new(1), 0)))
            .unwrap();
        assert!(adopted.owns_handle());
        assert!(adopted.initialize(&world).is_ok());
        assert!(adopted.owns_handle());
    }

    #[test]
    fn wrapped_communicator_never_releases() {
        let world = single();
        let mut view = Communicator::wrap(&world).unwrap();
        view.finalize().unwrap();
        view.finalize().unwrap();
        assert!(!view.is_initialized());
        // The owner is untouched.
        world.barrier().unwrap();
    }

    #[test]
    fn finalize_refuses_with_live_derived_communicators() {
        let mut world = single();
        let dup = world.duplicate().unwrap();
        assert!(matches!(world.finalize(), Err(Error::OpenHandles(1))));
        assert!(world.is_initialized());
        drop(dup);
        world.finalize().unwrap();
        assert!(matches!(world.barrier(), Err(Error::Finalized)));
    }

    #[test]
    fn ledger_counts_open_requests() {
        let (mut a, mut b) = pair();
        let s1 = a.asend(&[1i32, 2], 1, 7).unwrap();
        let s2 = a.asend_bytes(&[9], 1, 8).unwrap();
        assert_eq!(a.n_open_requests(), 2);
        assert_eq!(a.request_tag(s2), Some(8));

        let r = b.arecv::<i32>(2, 0, 7).unwrap();
        assert_eq!(b.n_open_requests(), 1);
        let got = b.wait_recv(r).unwrap();
        assert_eq!(got.status.tag, 7);
        assert_eq!(got.into_vec::<i32>().unwrap(), vec![1, 2]);
        assert_eq!(b.n_open_requests(), 0);

        a.wait_send(s1).unwrap();
        assert_eq!(a.n_open_requests(), 1);
        assert!(a.wait_all().unwrap().is_empty());
        assert_eq!(a.n_open_requests(), 0);

        let mut byte = [0u8; 1];
        b.recv_bytes(&mut byte, 0, 8).unwrap();
        assert_eq!(byte[0], 9);
    }

    #[test]
    fn waiting_twice_is_invalid_request() {
        let (mut a, _b) = pair();
        let id = a.asend(&[1u8], 1, 0).unwrap();
        a.wait_send(id).unwrap();
        assert!(matches!(a.wait_send(id), Err(Error::InvalidRequest(_))));
        assert_eq!(a.last_code(), crate::error::codes::REQUEST);
    }

    #[test]
    fn wait_all_returns_receives_in_issue_order() {
        let (a, mut b) = pair();
        let first = b.arecv::<u8>(1, ANY_SOURCE, 2).unwrap();
        let second = b.arecv::<u8>(1, ANY_SOURCE, 1).unwrap();
        a.send(&[1u8], 1, 1).unwrap();
        a.send(&[2u8], 1, 2).unwrap();
        let received = b.wait_all().unwrap();
        let ids: Vec<_> = received.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(received[0].bytes(), &[2]);
        assert_eq!(received[1].bytes(), &[1]);
    }

    #[test]
    fn clear_requests_abandons_everything() {
        let (mut a, _b) = pair();
        a.arecv::<u8>(4, 1, 0).unwrap();
        a.set_recv::<u8>(4, 1, 1).unwrap();
        a.set_send(&[0u8; 4], 1, 1).unwrap();
        assert_eq!(a.n_open_requests(), 3);
        assert_eq!(a.clear_requests(), 3);
        assert_eq!(a.n_open_requests(), 0);
    }

    #[test]
    fn persistent_requests_survive_completion() {
        let (mut a, mut b) = pair();
        let send = a.set_send(&[0u16; 3], 1, 5).unwrap();
        let recv = b.set_recv::<u16>(3, 0, 5).unwrap();
        for round in 1u16..=3 {
            a.update_send(send, &[round; 3]).unwrap();
            b.recv_all().unwrap();
            assert_eq!(a.send_all().unwrap(), 1);
            let got = b.wait_recv(recv).unwrap().into_vec::<u16>().unwrap();
            assert_eq!(got, vec![round; 3]);
            a.wait_send(send).unwrap();
        }
        assert_eq!(a.n_open_requests(), 1);
        assert_eq!(b.n_open_requests(), 1);
        assert!(a.update_send(send, &[1u16]).is_err());
    }

    #[test]
    fn persistent_registration_checks_peer_and_tag() {
        let (mut a, _b) = pair();
        assert!(matches!(a.set_send(&[1u8], 5, 0), Err(Error::InvalidRank(5))));
        assert!(matches!(a.set_send(&[1u8], 1, -2), Err(Error::InvalidTag(-2))));
        assert!(matches!(a.set_recv::<u8>(1, 2, 0), Err(Error::InvalidRank(2))));
        let one_shot = a.asend(&[1u8], 1, 0).unwrap();
        assert!(matches!(a.start_send(one_shot), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn error_code_is_local_state() {
        let mut comm = single();
        assert_eq!(comm.error_code(), SUCCESS);
        assert_eq!(comm.set_err(3), 3);
        assert_eq!(comm.error_code(), 3);
        comm.clear_err();
        assert_eq!(comm.error_code(), SUCCESS);
    }
}
