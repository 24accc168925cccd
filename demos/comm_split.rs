//! Communicator split example - split world into even/odd rank groups.
//!
//! Partitions the world by rank parity: even ranks (color 0) and odd ranks
//! (color 1). Each group then performs an independent all-reduce to verify
//! the split is correct.
//!
//! Run with: cargo run --example comm_split -- -n 4

use rankcomm::{Communicator, Error, ReduceOp, Result, Universe};

fn split_by_parity(mut world: Communicator) -> Result<()> {
    let rank = world.rank();
    let size = world.size();

    if size < 2 {
        if rank == 0 {
            eprintln!("This example requires at least 2 ranks");
        }
        return Ok(());
    }

    // The key controls ordering inside the new group; the world rank keeps
    // the original relative order.
    let color = rank % 2;
    let sub = world
        .split(color, rank)?
        .ok_or_else(|| Error::Internal("split with a defined color returned no group".into()))?;

    let group_name = if color == 0 { "even" } else { "odd" };
    println!(
        "World rank {}/{}: {} group, sub-communicator rank {}/{}",
        rank,
        size,
        group_name,
        sub.rank(),
        sub.size(),
    );

    // Each rank contributes its world rank; the group sum covers ranks of
    // the same parity only.
    let sub_sum = sub.all_reduce_scalar(rank, ReduceOp::Sum)?;
    let expected: i32 = (0..size).filter(|r| r % 2 == color).sum();
    assert_eq!(
        sub_sum, expected,
        "Rank {}: sub-communicator allreduce mismatch",
        rank
    );

    // A duplicate shares the group but not its traffic.
    let dup = sub.duplicate()?;
    assert_eq!(dup.rank(), sub.rank());

    // The world cannot be released while derived groups are open.
    assert!(matches!(world.finalize(), Err(Error::OpenHandles(2))));
    drop(dup);
    drop(sub);
    world.barrier()?;

    if rank == 0 {
        println!("\n✓ Communicator split test passed!");
    }
    world.finalize()
}

fn main() -> Result<()> {
    env_logger::init();
    let (universe, _args) = Universe::from_args(std::env::args())?;
    universe.run(split_by_parity)?.into_iter().collect()
}
