//! Nonblocking operations example.
//!
//! Demonstrates overlap of communication and computation using the request
//! ledger: post receives, post sends, compute, then wait.
//!
//! Run with: cargo run --example nonblocking -- -n 4

use rankcomm::{Communicator, Result, Universe};
use std::time::Instant;

fn halo_exchange(mut world: Communicator) -> Result<()> {
    let rank = world.rank();
    let size = world.size();
    let left = (rank + size - 1) % size;
    let right = (rank + 1) % size;

    println!("Rank {}: Starting nonblocking tests", rank);

    // ============================================================
    // Test 1: Ring exchange overlapped with computation
    // ============================================================
    {
        let start_time = Instant::now();
        let from_left = world.arecv::<f64>(5, left, 0)?;
        world.asend(&[rank as f64; 5], right, 0)?;

        // Simulate some computation while communication proceeds
        let mut compute_result = 0.0;
        for i in 0..1000 {
            compute_result += (i as f64).sin();
        }

        let halo: Vec<f64> = world.wait_recv(from_left)?.into_vec()?;
        world.wait_all()?;
        let elapsed = start_time.elapsed();

        assert_eq!(halo, vec![left as f64; 5], "Ring exchange failed on rank {}", rank);
        if rank == 0 {
            println!("✓ Ring exchange passed (elapsed: {:?})", elapsed);
            println!("  (computed {} during communication)", compute_result);
        }
    }

    world.barrier()?;

    // ============================================================
    // Test 2: Multiple operations with wait_all
    // ============================================================
    {
        let from_left = world.arecv::<i64>(10, left, 1)?;
        let from_right = world.arecv::<i64>(10, right, 2)?;
        world.asend(&[rank as i64; 10], right, 1)?;
        world.asend(&[-(rank as i64); 10], left, 2)?;
        assert_eq!(world.n_open_requests(), 4);

        // Wait for all at once; completed receives come back in post order
        let received = world.wait_all()?;
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].id, from_left);
        assert_eq!(received[1].id, from_right);
        assert_eq!(world.n_open_requests(), 0);

        if rank == 0 {
            println!("✓ Multiple nonblocking operations with wait_all passed");
        }
    }

    world.barrier()?;

    // ============================================================
    // Test 3: Using test_recv() to poll for completion
    // ============================================================
    {
        let id = world.arecv::<f64>(100, left, 3)?;
        world.asend(&[42.0; 100], right, 3)?;

        // Poll until complete
        let mut polls = 0;
        while !world.test_recv(id)? {
            polls += 1;
            std::hint::spin_loop();
        }

        let data: Vec<f64> = world.wait_recv(id)?.into_vec()?;
        assert!(data.iter().all(|&x| (x - 42.0).abs() < 1e-10));
        world.wait_all()?;

        if rank == 0 {
            println!("✓ Test/poll completion test passed ({} polls)", polls);
        }
    }

    world.barrier()?;

    if rank == 0 {
        println!("\n========================================");
        println!("All nonblocking tests passed!");
        println!("========================================");
    }

    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let (universe, _args) = Universe::from_args(std::env::args())?;
    universe.run(halo_exchange)?.into_iter().collect()
}
