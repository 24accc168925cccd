//! Variable-count gather and scatter example.
//!
//! Rank `i` contributes `(i + 1)` elements, each set to `i * 10.0`. The root
//! gathers them in rank order, then scatters the same segments back.
//!
//! Run with: cargo run --example gatherv -- -n 4

use rankcomm::{layout, Communicator, Result, Universe};

fn variable_counts(world: Communicator) -> Result<()> {
    let rank = world.rank();
    let size = world.size();

    println!("Rank {}/{}: Starting gatherv example", rank, size);

    let send_count = (rank + 1) as usize;
    let send: Vec<f64> = vec![rank as f64 * 10.0; send_count];

    // ============================================================
    // Test 1: Variable-count gather to root
    // ============================================================
    //
    // An empty count table is filled in by a count exchange first.
    let mut counts = Vec::new();
    let gathered = world.gatherv(&send, &mut counts, 0)?;

    if rank == 0 {
        let (_, displs) = layout(&counts, 1);
        for r in 0..size as usize {
            let segment = &gathered[displs[r]..displs[r] + counts[r]];
            assert!(segment.iter().all(|&x| x == r as f64 * 10.0));
        }
        println!("✓ Gatherv test passed: {:?}", gathered);
    } else {
        assert!(gathered.is_empty());
    }

    // ============================================================
    // Test 2: All-gatherv
    // ============================================================
    let mut all_counts = Vec::new();
    let everywhere = world.all_gatherv(&send, &mut all_counts)?;
    let total: usize = (1..=size as usize).sum();
    assert_eq!(everywhere.len(), total);

    if rank == 0 {
        println!("✓ All-gatherv test passed (counts = {:?})", all_counts);
    }

    // ============================================================
    // Test 3: Scatterv returns each rank its own segment
    // ============================================================
    let back = world.scatterv(&gathered, &mut counts, 0)?;
    assert_eq!(back, send, "Scatterv failed on rank {}", rank);

    world.barrier()?;
    if rank == 0 {
        println!("✓ Scatterv test passed");
        println!("\nAll gatherv tests passed!");
    }

    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let (universe, _args) = Universe::from_args(std::env::args())?;
    universe.run(variable_counts)?.into_iter().collect()
}
