//! Mobile object example.
//!
//! Each rank owns a different number of mesh patches of different sizes.
//! Patches are packed with bincode through [`Mobile`] and gathered to every
//! rank in two phases: sizes first, then payload.
//!
//! Run with: cargo run --example mobile_objects -- -n 4

use rankcomm::{Communicator, Mobile, Result, Universe};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct Patch {
    owner: i32,
    cells: Vec<u32>,
}

fn exchange_patches(world: Communicator) -> Result<()> {
    let rank = world.rank();
    let size = world.size();

    // Rank k owns k + 1 patches with k cells each
    let mut mine: Vec<Mobile<Patch>> = (0..=rank)
        .map(|_| {
            Mobile::new(Patch {
                owner: rank,
                cells: (0..rank as u32).collect(),
            })
        })
        .collect();

    let mut counts = Vec::new();
    let everywhere = world.all_gather_mo_vec(&mut mine, &mut counts)?;

    assert_eq!(counts, (1..=size as usize).collect::<Vec<_>>());
    let mut offset = 0;
    for (owner, &count) in counts.iter().enumerate() {
        for patch in &everywhere[offset..offset + count] {
            assert_eq!(patch.owner, owner as i32);
            assert_eq!(patch.cells.len(), owner);
        }
        offset += count;
    }

    // Rank 0 publishes a single configuration object
    let mut settings = if rank == 0 {
        Mobile::new(Patch {
            owner: -1,
            cells: vec![3, 1, 4, 1, 5],
        })
    } else {
        Mobile::default()
    };
    world.broadcast_mo(&mut settings, 0)?;
    assert_eq!(settings.cells, vec![3, 1, 4, 1, 5]);

    if rank == 0 {
        println!(
            "✓ Mobile object test passed ({} patches from {} ranks)",
            everywhere.len(),
            size
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let (universe, _args) = Universe::from_args(std::env::args())?;
    universe.run(exchange_patches)?.into_iter().collect()
}
