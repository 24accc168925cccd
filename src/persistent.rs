//! Persistent point-to-point requests.
//!
//! A persistent request fixes the shape of a transfer once (buffer size,
//! peer and tag) and is then started and completed many times. This suits
//! iterative algorithms that exchange the same halo or boundary data every
//! step.
//!
//! # Example
//!
//! ```no_run
//! use rankcomm::{LaunchConfig, Universe};
//!
//! let universe = Universe::new(LaunchConfig::default().with_ranks(2)).unwrap();
//! universe
//!     .run(|mut world| {
//!         let peer = 1 - world.rank();
//!         let send = world.set_send(&[world.rank() as f64; 8], peer, 0).unwrap();
//!         let recv = world.set_recv::<f64>(8, peer, 0).unwrap();
//!
//!         for step in 0..100 {
//!             world.update_send(send, &[step as f64; 8]).unwrap();
//!             world.start_send(send).unwrap();
//!             world.start_recv(recv).unwrap();
//!             let halo: Vec<f64> = world.wait_recv(recv).unwrap().into_vec().unwrap();
//!             world.wait_send(send).unwrap();
//!             assert_eq!(halo[0], step as f64);
//!         }
//!
//!         // Registrations are dropped without waiting
//!         world.clear_requests();
//!     })
//!     .unwrap();
//! ```

use crate::error::{Error, Result};
use crate::transport::{Delivery, RawRequest, Transport};
use std::rc::Rc;

/// The fixed shape of a persistent transfer.
pub(crate) enum Shape {
    Send { payload: Vec<u8>, dest: i32 },
    Recv { capacity: usize, source: i32 },
}

/// A persistent request handle.
///
/// # Lifecycle
///
/// 1. Register with `Communicator::set_send()` or `set_recv()`
/// 2. Start with `start()`
/// 3. Wait for completion with `wait()`
/// 4. Repeat steps 2-3 as needed
/// 5. Abandon on drop
pub(crate) struct PersistentRequest {
    shape: Shape,
    tag: i32,
    transport: Rc<dyn Transport>,
    /// Substrate handle while started but not yet waited
    active: Option<RawRequest>,
}

impl PersistentRequest {
    pub(crate) fn new(shape: Shape, tag: i32, transport: Rc<dyn Transport>) -> Self {
        PersistentRequest {
            shape,
            tag,
            transport,
            active: None,
        }
    }

    /// Check if this request is currently active (started but not waited).
    pub(crate) fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Replace the payload of a persistent send. The size is part of the
    /// registered shape and cannot change.
    pub(crate) fn update(&mut self, bytes: &[u8]) -> Result<()> {
        if self.is_active() {
            return Err(Error::Internal("request is active".into()));
        }
        match &mut self.shape {
            Shape::Send { payload, .. } if payload.len() == bytes.len() => {
                payload.copy_from_slice(bytes);
                Ok(())
            }
            Shape::Send { .. } => Err(Error::InvalidCount(bytes.len() as i64)),
            Shape::Recv { .. } => Err(Error::Internal(
                "cannot update the payload of a receive".into(),
            )),
        }
    }

    /// Start the persistent operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation is already active or if the start fails.
    pub(crate) fn start(&mut self) -> Result<()> {
        if self.is_active() {
            return Err(Error::Internal("request is already active".into()));
        }
        let handle = match &self.shape {
            Shape::Send { payload, dest } => self.transport.isend(payload, *dest, self.tag)?,
            Shape::Recv { capacity, source } => {
                self.transport.irecv(*capacity, *source, self.tag)?
            }
        };
        self.active = Some(handle);
        Ok(())
    }

    /// Wait for the operation to complete.
    ///
    /// Returns `None` if the request was not started.
    pub(crate) fn wait(&mut self) -> Result<Option<Delivery>> {
        match self.active.take() {
            Some(handle) => self.transport.wait(handle).map(Some),
            None => Ok(None),
        }
    }

    /// Test if the operation has completed without blocking.
    pub(crate) fn test(&mut self) -> Result<bool> {
        match self.active {
            Some(handle) => self.transport.test(handle),
            None => Ok(true),
        }
    }

    /// Start several persistent operations.
    ///
    /// Fails without starting anything if one of them is already active.
    pub(crate) fn start_all<'a>(
        requests: impl IntoIterator<Item = &'a mut PersistentRequest>,
    ) -> Result<usize> {
        let mut requests: Vec<_> = requests.into_iter().collect();
        if requests.iter().any(|r| r.is_active()) {
            return Err(Error::Internal(
                "one or more requests already active".into(),
            ));
        }
        for request in requests.iter_mut() {
            request.start()?;
        }
        Ok(requests.len())
    }
}

impl Drop for PersistentRequest {
    fn drop(&mut self) {
        if let Some(handle) = self.active.take() {
            self.transport.request_free(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Fabric, LocalTransport};

    fn endpoints() -> (Rc<dyn Transport>, Rc<dyn Transport>) {
        let fabric = Fabric::new(2);
        (
            Rc::new(LocalTransport::world(fabric.clone(), 0)),
            Rc::new(LocalTransport::world(fabric, 1)),
        )
    }

    #[test]
    fn restart_reuses_shape() {
        let (t0, t1) = endpoints();
        let mut send = PersistentRequest::new(
            Shape::Send {
                payload: vec![1, 2],
                dest: 1,
            },
            4,
            t0,
        );
        let mut recv = PersistentRequest::new(
            Shape::Recv {
                capacity: 2,
                source: 0,
            },
            4,
            t1,
        );

        for round in 0u8..3 {
            send.update(&[round, round]).unwrap();
            recv.start().unwrap();
            send.start().unwrap();
            assert!(send.is_active());
            send.wait().unwrap();
            let delivery = recv.wait().unwrap().unwrap();
            assert_eq!(delivery.payload, vec![round, round]);
            assert!(!recv.is_active());
        }
    }

    #[test]
    fn double_start_is_rejected() {
        let (t0, _t1) = endpoints();
        let mut send = PersistentRequest::new(
            Shape::Send {
                payload: vec![],
                dest: 1,
            },
            0,
            t0,
        );
        send.start().unwrap();
        assert!(send.start().is_err());
        assert!(send.update(&[]).is_err());
    }

    #[test]
    fn wait_without_start_is_none() {
        let (_t0, t1) = endpoints();
        let mut recv = PersistentRequest::new(
            Shape::Recv {
                capacity: 1,
                source: 0,
            },
            0,
            t1,
        );
        assert!(recv.test().unwrap());
        assert!(recv.wait().unwrap().is_none());
    }

    #[test]
    fn update_checks_size() {
        let (t0, _t1) = endpoints();
        let mut send = PersistentRequest::new(
            Shape::Send {
                payload: vec![0; 4],
                dest: 1,
            },
            0,
            t0,
        );
        assert!(matches!(send.update(&[1, 2]), Err(Error::InvalidCount(2))));
    }

    #[test]
    fn start_all_starts_every_request() {
        let (t0, t1) = endpoints();
        let mut sends: Vec<_> = (0..3)
            .map(|tag| {
                PersistentRequest::new(
                    Shape::Send {
                        payload: vec![tag as u8],
                        dest: 1,
                    },
                    tag,
                    Rc::clone(&t0),
                )
            })
            .collect();
        assert_eq!(PersistentRequest::start_all(sends.iter_mut()).unwrap(), 3);
        assert!(sends.iter().all(|s| s.is_active()));
        assert!(PersistentRequest::start_all(sends.iter_mut()).is_err());

        let mut b = [0u8; 1];
        t1.recv(&mut b, 0, 2).unwrap();
        assert_eq!(b[0], 2);
    }
}
