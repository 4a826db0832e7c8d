use std::collections::BTreeSet;
use std::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::coco::LocationId;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Disjoint train/test partition of every observed location.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocationSplit {
    pub train: BTreeSet<LocationId>,
    pub test: BTreeSet<LocationId>,
}

impl LocationSplit {
    /// Samples `max(1, round(test_fraction * n))` test locations from the
    /// sorted location set with a PRNG seeded by `seed`. Input order does not
    /// matter.
    pub fn split<I>(locations: I, test_fraction: f64, seed: u64) -> Result<Self>
    where
        I: IntoIterator<Item = LocationId>,
    {
        if !(0.0..=1.0).contains(&test_fraction) {
            return Err(PipelineError::InvalidFraction(test_fraction));
        }

        let sorted: Vec<LocationId> = locations.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let n = sorted.len();
        if n == 0 {
            return Ok(Self::default());
        }

        let n_test = ((test_fraction * n as f64).round() as usize).clamp(1, n);
        let mut rng = StdRng::seed_from_u64(seed);
        let picked: BTreeSet<usize> = rand::seq::index::sample(&mut rng, n, n_test).into_iter().collect();

        let mut out = Self::default();
        for (i, loc) in sorted.into_iter().enumerate() {
            if picked.contains(&i) {
                out.test.insert(loc);
            } else {
                out.train.insert(loc);
            }
        }
        Ok(out)
    }

    pub fn side(&self, location: &LocationId) -> Option<Split> {
        if self.test.contains(location) {
            Some(Split::Test)
        } else if self.train.contains(location) {
            Some(Split::Train)
        } else {
            None
        }
    }

    /// True when there are locations but none of them is left for training.
    pub fn is_degenerate(&self) -> bool {
        self.train.is_empty() && !self.test.is_empty()
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
