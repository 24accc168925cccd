//! Hello World example - basic world launch and communication.
//!
//! Run with: cargo run --example hello_world -- -n 4

use rankcomm::{Result, Universe};

fn main() -> Result<()> {
    env_logger::init();

    // Rank count comes from `-n`, RANKCOMM_RANKS or SLURM_NTASKS
    let (universe, _args) = Universe::from_args(std::env::args())?;

    let outcomes = universe.run(|world| -> Result<()> {
        // Get our rank and the total number of ranks
        let rank = world.rank();
        let size = world.size();
        let thread = std::thread::current();

        println!(
            "Hello from rank {} of {} on {}",
            rank,
            size,
            thread.name().unwrap_or("unnamed")
        );

        // Synchronize before exiting
        world.barrier()?;

        if rank == 0 {
            println!("\nAll ranks reported in. Test passed!");
        }

        // The world endpoint is released when `world` is dropped
        Ok(())
    })?;

    outcomes.into_iter().collect()
}
