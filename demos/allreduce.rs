//! All-reduce example - collective reduction operations.
//!
//! Tests broadcast, reduce, all-reduce, gather and union.
//!
//! Run with: cargo run --example allreduce -- -n 4

use rankcomm::{Communicator, ReduceOp, Result, Universe, ValueLoc};

fn collectives(world: Communicator) -> Result<()> {
    let rank = world.rank();
    let size = world.size();

    println!("Rank {}/{}: Starting collective tests", rank, size);

    // ============================================================
    // Test 1: Broadcast
    // ============================================================
    {
        let mut data = if rank == 0 {
            vec![1.0, 2.0, 3.0, 4.0, 5.0]
        } else {
            Vec::new()
        };

        world.broadcast_vec(&mut data, 0)?;

        let expected = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(data, expected, "Broadcast failed on rank {}", rank);

        if rank == 0 {
            println!("✓ Broadcast test passed");
        }
    }

    // ============================================================
    // Test 2: Reduce (sum)
    // ============================================================
    {
        let send = vec![rank as f64 + 1.0; 3];
        let recv = world.reduce(&send, ReduceOp::Sum, 0)?;

        if rank == 0 {
            // Sum of 1 + 2 + ... + size
            let expected_sum: f64 = (1..=size).map(|x| x as f64).sum();
            assert_eq!(recv, vec![expected_sum; 3], "Reduce Sum failed");
            println!("✓ Reduce Sum test passed (sum = {})", expected_sum);
        } else {
            assert!(recv.is_empty());
        }
    }

    // ============================================================
    // Test 3: All-reduce scalar
    // ============================================================
    {
        let sum = world.all_reduce_scalar(rank as f64 + 1.0, ReduceOp::Sum)?;
        let expected: f64 = (1..=size).map(|x| x as f64).sum();
        assert!((sum - expected).abs() < 1e-10, "Allreduce scalar failed");

        let max = world.all_reduce_scalar(rank * 10, ReduceOp::Max)?;
        assert_eq!(max, (size - 1) * 10);

        if rank == 0 {
            println!("✓ Allreduce scalar test passed (sum = {}, max = {})", sum, max);
        }
    }

    // ============================================================
    // Test 4: Location reduction
    // ============================================================
    {
        // Every rank holds a load; find the busiest one.
        let load = rank as f64 * 1.5;
        let busiest =
            world.all_reduce_scalar(ValueLoc::new(load, rank as f64), ReduceOp::MaxLoc)?;
        assert_eq!(busiest.value, (size - 1) as f64 * 1.5);
        assert_eq!(busiest.loc, (size - 1) as f64);

        if rank == 0 {
            println!("✓ MaxLoc test passed (rank {} holds {})", busiest.loc, busiest.value);
        }
    }

    // ============================================================
    // Test 5: Gather and all-gather
    // ============================================================
    {
        let send = [rank as f64 * 10.0, rank as f64 * 10.0 + 1.0];
        let at_root = world.gather_vec(&send, 0)?;
        let everywhere = world.all_gather(&rank)?;

        if rank == 0 {
            for r in 0..size as usize {
                assert_eq!(at_root[2 * r], r as f64 * 10.0, "Gather failed at {}", r);
            }
            println!("✓ Gather test passed (received {} elements)", at_root.len());
        }
        assert_eq!(everywhere, (0..size).collect::<Vec<_>>());
    }

    // ============================================================
    // Test 6: Union
    // ============================================================
    {
        let ids = [rank, rank + 1, size];
        let union = world.union(&ids)?;
        assert_eq!(union, (0..=size).collect::<Vec<_>>());

        if rank == 0 {
            println!("✓ Union test passed ({} distinct ids)", union.len());
        }
    }

    world.barrier()?;

    if rank == 0 {
        println!("\n========================================");
        println!("All collective tests passed!");
        println!("========================================");
    }

    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let (universe, _args) = Universe::from_args(std::env::args())?;
    universe.run(collectives)?.into_iter().collect()
}
