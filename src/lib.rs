//! # rankcomm
//!
//! Rank-oriented communication over a fixed group of cooperating ranks.
//!
//! The central type is [`Communicator`], one rank's view of a process group.
//! It provides:
//! - Blocking, non-blocking and persistent point-to-point transfers, with
//!   open non-blocking operations tracked in a request ledger
//! - Collectives over any [`Element`] type: broadcast, gather, all-gather,
//!   variable-length gather and scatter, reduce, all-reduce and union
//! - Two-phase collectives over [`MobileObject`]s, values whose packed size
//!   differs per rank
//! - Group management: split, duplicate, wrap
//!
//! Communication goes through the [`Transport`] trait. The crate ships
//! [`LocalTransport`], which runs each rank as a thread of the current
//! process; a [`Universe`] launches them.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rankcomm::{ReduceOp, Universe};
//!
//! fn main() -> Result<(), rankcomm::Error> {
//!     let (universe, _args) = Universe::from_args(std::env::args())?;
//!
//!     let sums = universe.run(|world| {
//!         let rank = world.rank();
//!
//!         let mut data = vec![0.0f64; 100];
//!         if rank == 0 {
//!             data.fill(42.0);
//!         }
//!         world.broadcast_vec(&mut data, 0)?;
//!
//!         world.all_reduce_scalar(rank, ReduceOp::Sum)
//!     })?;
//!
//!     println!("sum of ranks: {:?}", sums[0]);
//!     Ok(())
//! }
//! ```
//!
//! ## Error handling
//!
//! Every operation returns [`Result`], and every [`Error`] has an integer
//! [`code`](Error::code). A broken collective contract (a count table of the
//! wrong length, a datatype that cannot be reduced with the requested
//! operator) cannot be recovered from on one rank while its peers wait, so it
//! is logged and aborts the process.
//!
//! ## Logging
//!
//! The crate logs through the [`log`] facade. Install any logger, for example
//! `env_logger`, and set `RUST_LOG=rankcomm=debug` to trace communicator
//! lifecycles and collective entry.

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow certain pedantic lints for existing code
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::similar_names)]

mod collective;
mod comm;
mod config;
mod datatype;
mod error;
mod mobile;
mod mobile_collective;
mod parallel;
mod persistent;
mod reduce;
mod request;
mod status;
mod transport;

pub use collective::layout;
pub use comm::Communicator;
pub use config::{LaunchConfig, RANKS_VAR, SLURM_NTASKS_VAR};
pub use datatype::{DataType, Element, Reducible, ValueLoc};
pub use error::{codes, Error, Result, SUCCESS};
pub use mobile::{Mobile, MobileObject, PackBuffer};
pub use parallel::{Parallel, ParallelObject};
pub use request::{Received, RequestId};
pub use status::Status;
pub use transport::{
    Delivery, LocalTransport, RawRequest, Transport, ANY_SOURCE, ANY_TAG, UNDEFINED,
};

use log::{debug, error};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use transport::Fabric;

/// Reduction operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ReduceOp {
    /// Sum of values
    Sum = 0,
    /// Maximum value
    Max = 1,
    /// Minimum value
    Min = 2,
    /// Product of values
    Prod = 3,
    /// Minimum value and the location it came from
    MinLoc = 4,
    /// Maximum value and the location it came from
    MaxLoc = 5,
}

impl ReduceOp {
    /// Whether the operator works on `(value, location)` pairs.
    pub const fn is_loc(self) -> bool {
        matches!(self, ReduceOp::MinLoc | ReduceOp::MaxLoc)
    }
}

/// The process-scoped communication substrate.
///
/// A universe is created once at startup and launches the ranks of the world
/// group. Each [`run`](Self::run) gets a fresh world: messages and
/// communicators never leak from one run into the next.
///
/// # Example
///
/// ```no_run
/// use rankcomm::{LaunchConfig, Universe};
///
/// let universe = Universe::new(LaunchConfig::default().with_ranks(4)).expect("bad config");
/// let ranks = universe.run(|world| world.rank()).expect("a rank failed");
/// assert_eq!(ranks, vec![0, 1, 2, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct Universe {
    config: LaunchConfig,
}

impl Universe {
    /// Create a universe for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration cannot be launched.
    pub fn new(config: LaunchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Universe { config })
    }

    /// Create a universe from launch arguments, falling back to the
    /// environment. Returns the arguments left for the application.
    pub fn from_args<I, S>(args: I) -> Result<(Self, Vec<String>)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (config, rest) = LaunchConfig::from_args(args)?;
        Ok((Universe::new(config)?, rest))
    }

    /// Number of ranks in the world group.
    pub fn size(&self) -> usize {
        self.config.ranks
    }

    /// The launch configuration.
    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Run `f` on every rank of a fresh world group.
    ///
    /// Each rank runs on its own thread named `rank-<n>` and receives an
    /// owning world [`Communicator`]. Results are returned in rank order.
    ///
    /// # Errors
    ///
    /// If a rank panics the whole group is aborted: operations blocked on
    /// other ranks fail with [`Error::Aborted`], and this returns
    /// [`Error::RankFailed`] naming the first rank that failed.
    pub fn run<F, R>(&self, f: F) -> Result<Vec<R>>
    where
        F: Fn(Communicator) -> R + Sync,
        R: Send,
    {
        let ranks = self.config.ranks;
        let fabric = Fabric::new(ranks);
        let first_failed = AtomicI32::new(-1);
        debug!(ranks; "launching world");

        let outcomes = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(ranks);
            for rank in 0..ranks {
                let shared = Arc::clone(&fabric);
                let (f, first_failed) = (&f, &first_failed);
                let spawned = thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(scope, move || {
                        let _guard = AbortOnPanic {
                            fabric: &shared,
                            rank: rank as i32,
                            first_failed,
                        };
                        let world = LocalTransport::world(Arc::clone(&shared), rank);
                        f(Communicator::from_transport(world))
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        // Ranks already started would wait forever for this one.
                        fabric.abort();
                        for handle in handles {
                            let _ = handle.join();
                        }
                        return Err(Error::Internal(format!("spawning rank {rank}: {err}")));
                    }
                }
            }
            Ok(handles
                .into_iter()
                .map(|handle| handle.join())
                .collect::<Vec<_>>())
        })?;

        let mut results = Vec::with_capacity(ranks);
        for (rank, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(result) => results.push(result),
                Err(_) => {
                    let failed = match first_failed.load(Ordering::SeqCst) {
                        -1 => rank as i32,
                        failed => failed,
                    };
                    error!(rank = failed; "rank failed, world aborted");
                    return Err(Error::RankFailed(failed));
                }
            }
        }
        if !fabric.all_released() {
            debug!(ranks; "world endpoints left unreleased");
        }
        Ok(results)
    }
}

/// Aborts the fabric when its rank thread unwinds.
struct AbortOnPanic<'a> {
    fabric: &'a Fabric,
    rank: i32,
    first_failed: &'a AtomicI32,
}

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            let _ = self
                .first_failed
                .compare_exchange(-1, self.rank, Ordering::SeqCst, Ordering::SeqCst);
            self.fabric.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_operators() {
        assert!(ReduceOp::MinLoc.is_loc());
        assert!(ReduceOp::MaxLoc.is_loc());
        assert!(!ReduceOp::Sum.is_loc());
        assert!(!ReduceOp::Max.is_loc());
    }

    #[test]
    fn universe_rejects_zero_ranks() {
        let err = Universe::new(LaunchConfig::default().with_ranks(0)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn run_returns_results_in_rank_order() {
        let universe = Universe::new(LaunchConfig::default().with_ranks(3)).unwrap();
        let names = universe
            .run(|world| {
                let name = thread::current().name().map(str::to_owned);
                (world.rank(), world.size(), name)
            })
            .unwrap();
        assert_eq!(
            names,
            vec![
                (0, 3, Some("rank-0".to_owned())),
                (1, 3, Some("rank-1".to_owned())),
                (2, 3, Some("rank-2".to_owned())),
            ]
        );
    }

    #[test]
    fn panicking_rank_aborts_the_world() {
        let universe = Universe::new(LaunchConfig::default().with_ranks(3)).unwrap();
        let result = universe.run(|world| {
            if world.rank() == 1 {
                panic!("rank 1 gives up");
            }
            // Never completes: rank 1 does not join the barrier.
            world.barrier()
        });
        assert!(matches!(result, Err(Error::RankFailed(1))));
    }

    #[test]
    fn each_run_gets_a_fresh_world() {
        let universe = Universe::new(LaunchConfig::default().with_ranks(2)).unwrap();
        for _ in 0..3 {
            let sums = universe
                .run(|world| world.all_reduce_scalar(world.rank() + 1, ReduceOp::Sum))
                .unwrap();
            assert!(sums.into_iter().all(|s| s.unwrap() == 3));
        }
    }
}
