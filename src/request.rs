//! Non-blocking requests and the ledger that tracks them.
//!
//! Every non-blocking send or receive issued through a
//! [`Communicator`](crate::Communicator) gets exactly one ledger entry, tagged
//! with its application tag, until it is waited on or the ledger is cleared.

use crate::datatype::{from_bytes, Element};
use crate::error::{Error, Result};
use crate::persistent::PersistentRequest;
use crate::status::Status;
use crate::transport::{Delivery, RawRequest, Transport};
use std::fmt;
use std::rc::Rc;

/// Identifies a ledger entry of a communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    /// The raw numeric id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A completed receive: the envelope plus the bytes that arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Ledger entry the receive was registered under.
    pub id: RequestId,
    /// Where the message came from and how large it was.
    pub status: Status,
    payload: Vec<u8>,
}

impl Received {
    pub(crate) fn new(id: RequestId, delivery: Delivery) -> Self {
        Received {
            id,
            status: delivery.status,
            payload: delivery.payload,
        }
    }

    /// The raw received bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Take the raw received bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.payload
    }

    /// Decode the payload as a sequence of `T`.
    pub fn into_vec<T: Element>(self) -> Result<Vec<T>> {
        from_bytes(&self.payload)
    }
}

/// A handle to a one-shot non-blocking operation.
///
/// Dropping an unfinished request abandons it: a posted receive is withdrawn
/// and a message it already matched is lost.
pub(crate) struct Request {
    handle: RawRequest,
    transport: Rc<dyn Transport>,
    completed: bool,
}

impl Request {
    pub(crate) fn new(handle: RawRequest, transport: Rc<dyn Transport>) -> Self {
        Request {
            handle,
            transport,
            completed: false,
        }
    }

    /// Wait for this operation to complete.
    pub(crate) fn wait(mut self) -> Result<Delivery> {
        self.completed = true;
        self.transport.wait(self.handle)
    }

    /// Test if this operation has completed without blocking.
    pub(crate) fn test(&mut self) -> Result<bool> {
        if self.completed {
            return Ok(true);
        }
        self.transport.test(self.handle)
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if !self.completed {
            self.transport.request_free(self.handle);
        }
    }
}

pub(crate) enum Operation {
    OneShot(Request),
    Persistent(PersistentRequest),
}

pub(crate) struct LedgerEntry {
    pub(crate) id: RequestId,
    pub(crate) tag: i32,
    pub(crate) op: Operation,
}

impl LedgerEntry {
    pub(crate) fn persistent_mut(&mut self) -> Result<&mut PersistentRequest> {
        match &mut self.op {
            Operation::Persistent(request) => Ok(request),
            Operation::OneShot(_) => Err(Error::InvalidRequest(self.id.0)),
        }
    }
}

/// Which side of the ledger an entry lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Send,
    Recv,
}

/// Pending send and receive requests of one communicator, in issue order.
#[derive(Default)]
pub(crate) struct RequestLedger {
    sends: Vec<LedgerEntry>,
    recvs: Vec<LedgerEntry>,
    next_id: u64,
}

impl RequestLedger {
    pub(crate) fn register(&mut self, side: Side, tag: i32, op: Operation) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.side_mut(side).push(LedgerEntry { id, tag, op });
        id
    }

    fn side_mut(&mut self, side: Side) -> &mut Vec<LedgerEntry> {
        match side {
            Side::Send => &mut self.sends,
            Side::Recv => &mut self.recvs,
        }
    }

    fn side(&self, side: Side) -> &[LedgerEntry] {
        match side {
            Side::Send => &self.sends,
            Side::Recv => &self.recvs,
        }
    }

    pub(crate) fn entry_mut(&mut self, side: Side, id: RequestId) -> Result<&mut LedgerEntry> {
        self.side_mut(side)
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(Error::InvalidRequest(id.0))
    }

    /// Tag an entry was registered with.
    pub(crate) fn tag(&self, side: Side, id: RequestId) -> Option<i32> {
        self.side(side).iter().find(|e| e.id == id).map(|e| e.tag)
    }

    /// Complete the entry `id`. One-shot entries leave the ledger; persistent
    /// ones stay registered for the next start.
    pub(crate) fn complete(&mut self, side: Side, id: RequestId) -> Result<Delivery> {
        let entries = self.side_mut(side);
        let index = entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(Error::InvalidRequest(id.0))?;
        let entry = entries.remove(index);
        match entry.op {
            Operation::OneShot(request) => request.wait(),
            Operation::Persistent(mut request) => {
                let outcome = request.wait();
                entries.insert(
                    index,
                    LedgerEntry {
                        op: Operation::Persistent(request),
                        ..entry
                    },
                );
                outcome?.ok_or(Error::InvalidRequest(id.0))
            }
        }
    }

    /// Complete every entry, dropping one-shot entries from the ledger.
    ///
    /// Returns the deliveries of completed receives in issue order, and the
    /// first error hit on the way. Every entry is completed even after an
    /// error.
    pub(crate) fn complete_all(&mut self) -> (Vec<Received>, Option<Error>) {
        let mut first_error = None;
        let mut received = Vec::new();
        for side in [Side::Send, Side::Recv] {
            let entries = std::mem::take(self.side_mut(side));
            let mut kept = Vec::new();
            for LedgerEntry { id, tag, op } in entries {
                let outcome = match op {
                    Operation::OneShot(request) => request.wait().map(Some),
                    Operation::Persistent(mut request) => {
                        let outcome = request.wait();
                        kept.push(LedgerEntry {
                            id,
                            tag,
                            op: Operation::Persistent(request),
                        });
                        outcome
                    }
                };
                match outcome {
                    Ok(Some(delivery)) if side == Side::Recv => {
                        received.push(Received::new(id, delivery))
                    }
                    Ok(_) => {}
                    Err(err) => {
                        first_error.get_or_insert(err);
                    }
                }
            }
            *self.side_mut(side) = kept;
        }
        (received, first_error)
    }

    /// Persistent requests on one side, for starting them all.
    pub(crate) fn persistent_mut(&mut self, side: Side) -> impl Iterator<Item = &mut PersistentRequest> {
        self.side_mut(side).iter_mut().filter_map(|e| match &mut e.op {
            Operation::Persistent(request) => Some(request),
            Operation::OneShot(_) => None,
        })
    }

    /// Whether a one-shot entry has completed, without blocking.
    pub(crate) fn test(&mut self, side: Side, id: RequestId) -> Result<bool> {
        match &mut self.entry_mut(side, id)?.op {
            Operation::OneShot(request) => request.test(),
            Operation::Persistent(request) => request.test(),
        }
    }

    /// Drop every entry without waiting.
    pub(crate) fn clear(&mut self) -> usize {
        let open = self.len();
        self.sends.clear();
        self.recvs.clear();
        open
    }

    pub(crate) fn len(&self) -> usize {
        self.sends.len() + self.recvs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistent::Shape;
    use crate::transport::{Fabric, LocalTransport};

    fn endpoint() -> Rc<dyn Transport> {
        Rc::new(LocalTransport::world(Fabric::new(1), 0))
    }

    fn one_shot(t: &Rc<dyn Transport>, raw: Result<RawRequest>) -> Operation {
        Operation::OneShot(Request::new(raw.unwrap(), Rc::clone(t)))
    }

    #[test]
    fn one_shot_entries_leave_on_completion() {
        let t = endpoint();
        let mut ledger = RequestLedger::default();
        let r = ledger.register(Side::Recv, 4, one_shot(&t, t.irecv(2, 0, 4)));
        let s = ledger.register(Side::Send, 4, one_shot(&t, t.isend(&[5, 6], 0, 4)));
        assert_ne!(r, s);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.tag(Side::Recv, r), Some(4));
        assert_eq!(ledger.tag(Side::Send, r), None);

        let delivery = ledger.complete(Side::Recv, r).unwrap();
        assert_eq!(delivery.payload, vec![5, 6]);
        assert_eq!(ledger.len(), 1);
        assert!(matches!(
            ledger.complete(Side::Recv, r),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn complete_all_keeps_persistent_entries() {
        let t = endpoint();
        let mut ledger = RequestLedger::default();
        let shape = Shape::Recv {
            capacity: 1,
            source: 0,
        };
        let p = ledger.register(
            Side::Recv,
            1,
            Operation::Persistent(PersistentRequest::new(shape, 1, Rc::clone(&t))),
        );
        let r = ledger.register(Side::Recv, 2, one_shot(&t, t.irecv(1, 0, 2)));
        ledger.register(Side::Send, 2, one_shot(&t, t.isend(&[9], 0, 2)));

        let (received, failure) = ledger.complete_all();
        assert!(failure.is_none());
        // The persistent receive was never started, so nothing arrives for it.
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, r);
        assert_eq!(received[0].bytes(), &[9]);
        assert_eq!(ledger.len(), 1);
        assert!(ledger.entry_mut(Side::Recv, p).is_ok());
        assert_eq!(ledger.clear(), 1);
        assert_eq!(ledger.len(), 0);
    }

    #[test]
    fn persistent_entries_stay_after_completion() {
        let t = endpoint();
        let mut ledger = RequestLedger::default();
        let shape = Shape::Send {
            payload: vec![3],
            dest: 0,
        };
        let p = ledger.register(
            Side::Send,
            5,
            Operation::Persistent(PersistentRequest::new(shape, 5, Rc::clone(&t))),
        );
        for _ in 0..2 {
            ledger.entry_mut(Side::Send, p).unwrap().persistent_mut().unwrap().start().unwrap();
            let delivery = ledger.complete(Side::Send, p).unwrap();
            assert_eq!(delivery.status.tag, 5);
            assert_eq!(ledger.len(), 1);
            let mut b = [0u8; 1];
            t.recv(&mut b, 0, 5).unwrap();
            assert_eq!(b, [3]);
        }
        // Idle again: nothing to complete.
        assert!(matches!(
            ledger.complete(Side::Send, p),
            Err(Error::InvalidRequest(_))
        ));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn one_shot_entries_are_not_persistent() {
        let t = endpoint();
        let mut ledger = RequestLedger::default();
        let r = ledger.register(Side::Recv, 0, one_shot(&t, t.irecv(1, 0, 0)));
        let entry = ledger.entry_mut(Side::Recv, r).unwrap();
        assert!(matches!(entry.persistent_mut(), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn received_decodes_typed_payloads() {
        let delivery = Delivery {
            status: Status {
                source: 0,
                tag: 0,
                bytes: 8,
            },
            payload: 7u32
                .to_ne_bytes()
                .into_iter()
                .chain(9u32.to_ne_bytes())
                .collect(),
        };
        let received = Received::new(RequestId(3), delivery);
        assert_eq!(received.id.to_string(), "#3");
        assert_eq!(received.into_vec::<u32>().unwrap(), vec![7, 9]);
    }
}
