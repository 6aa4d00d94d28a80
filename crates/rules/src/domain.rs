use indexmap::IndexMap;
use rand::Rng;
use rewind::Builtin;

/// Where to draw random real inputs for each builtin.
#[derive(Clone, Debug)]
pub struct Domain {
    ranges: IndexMap<Builtin, (f64, f64)>,
    default: (f64, f64),
}

impl Default for Domain {
    fn default() -> Self {
        Domain {
            ranges: [
                (Builtin::Log, (0.1, 5.)),
                (Builtin::Sqrt, (0.1, 5.)),
                // derivative blows up at the ends
                (Builtin::Acos, (-0.9, 0.9)),
            ]
            .into_iter()
            .collect(),
            default: (-3., 3.),
        }
    }
}

impl Domain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, op: Builtin, lo: f64, hi: f64) -> Self {
        self.ranges.insert(op, (lo, hi));
        self
    }

    pub fn range(&self, op: Builtin) -> (f64, f64) {
        self.ranges.get(&op).copied().unwrap_or(self.default)
    }

    pub fn sample<R: Rng + ?Sized>(&self, op: Builtin, rng: &mut R) -> f64 {
        let (lo, hi) = self.range(op);
        rng.gen_range(lo..hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_samples_stay_in_range() {
        let domain = Domain::new().with(Builtin::Div, 1., 2.);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let x = domain.sample(Builtin::Acos, &mut rng);
            assert!(x.abs() < 0.9);
            let d = domain.sample(Builtin::Div, &mut rng);
            assert!((1. ..2.).contains(&d));
        }
        assert_eq!(domain.range(Builtin::Sin), (-3., 3.));
    }
}
