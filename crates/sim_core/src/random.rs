//! Seed derivation and per-scenario random streams.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::SeedableRng;

/// splitmix64 finalizer; a bijection on `u64`.
pub fn splitmix64(state: u64) -> u64 {
    let mut z = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Seed for scenario `index` of an experiment seeded with `master`.
///
/// Depends only on its arguments, so a scenario draws the same numbers no
/// matter which other scenarios ran before it or alongside it. Distinct
/// indices always map to distinct seeds.
pub fn derive_seed(master: u64, index: usize) -> u64 {
    splitmix64(master ^ splitmix64(index as u64))
}

fn stream_seed(seed: u64, name: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    splitmix64(seed ^ hash)
}

/// The main generator of a scenario plus lazily created named streams.
#[derive(Debug)]
pub struct RandomStreams {
    seed: u64,
    main: StdRng,
    named: HashMap<String, StdRng>,
}

impl RandomStreams {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            main: StdRng::seed_from_u64(seed),
            named: HashMap::new(),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn main(&mut self) -> &mut StdRng {
        &mut self.main
    }

    /// Stream `name`, created on first use from the scenario seed and the name.
    pub fn stream(&mut self, name: &str) -> &mut StdRng {
        let seed = self.seed;
        self.named
            .entry(name.to_string())
            .or_insert_with(|| StdRng::seed_from_u64(stream_seed(seed, name)))
    }
}
