//! Composition helpers for distributed entities.
//!
//! A distributed entity holds a [`Communicator`] and exposes it through
//! [`Parallel`], so algorithms can take `&impl Parallel` instead of a
//! concrete type.

use crate::comm::Communicator;
use crate::error::Result;

/// Access to the group context of a distributed entity.
pub trait Parallel {
    /// The group context this entity communicates through.
    fn communicator(&self) -> &Communicator;

    /// Rank of the calling process in the entity's group.
    fn rank(&self) -> i32 {
        self.communicator().rank()
    }

    /// Number of processes in the entity's group.
    fn size(&self) -> i32 {
        self.communicator().size()
    }

    /// Whether the calling process is rank 0 of the entity's group.
    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

impl Parallel for Communicator {
    fn communicator(&self) -> &Communicator {
        self
    }
}

/// A distributed entity sharing, but not owning, a parent's group.
#[derive(Debug)]
pub struct ParallelObject {
    comm: Communicator,
}

impl ParallelObject {
    /// Attach to the group of `parent` without owning it.
    pub fn new(parent: &Communicator) -> Result<Self> {
        Ok(ParallelObject {
            comm: Communicator::wrap(parent)?,
        })
    }

    /// Take ownership of `comm`, for example the result of a split.
    pub fn with_owned(comm: Communicator) -> Self {
        ParallelObject { comm }
    }

    /// The group context, mutably, for request ledger operations.
    pub fn communicator_mut(&mut self) -> &mut Communicator {
        &mut self.comm
    }
}

impl Parallel for ParallelObject {
    fn communicator(&self) -> &Communicator {
        &self.comm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Fabric, LocalTransport};

    fn sum_of_ranks(entity: &impl Parallel) -> i32 {
        entity
            .communicator()
            .all_reduce_scalar(entity.rank(), crate::ReduceOp::Sum)
            .unwrap()
    }

    #[test]
    fn parallel_object_shares_the_parent_group() {
        let world = Communicator::from_transport(LocalTransport::world(Fabric::new(1), 0));
        let mut object = ParallelObject::new(&world).unwrap();
        assert_eq!(object.rank(), 0);
        assert_eq!(object.size(), 1);
        assert!(object.is_root());
        assert!(!object.communicator().owns_handle());
        assert_eq!(sum_of_ranks(&object), 0);
        assert_eq!(sum_of_ranks(&world), 0);

        object.communicator_mut().finalize().unwrap();
        world.barrier().unwrap();
    }
}
