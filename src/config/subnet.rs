//! Subnet selection among configured candidates.

use uuid::Uuid;

/// Picks one subnet out of the configured candidates.
pub trait SubnetSelector {
    /// Returns the index of the chosen candidate. `candidates` is never
    /// empty; out-of-range answers fall back to the first candidate.
    fn select(&mut self, candidates: &[String]) -> usize;
}

/// Spreads builds over the candidates at random.
///
/// Randomness comes from a v4 [`Uuid`], the crate's only random source.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomSubnet;

impl SubnetSelector for RandomSubnet {
    fn select(&mut self, candidates: &[String]) -> usize {
        let Ok(len) = u128::try_from(candidates.len()) else {
            return 0;
        };
        Uuid::new_v4()
            .as_u128()
            .checked_rem(len)
            .and_then(|index| usize::try_from(index).ok())
            .unwrap_or(0)
    }
}

/// Always picks the first candidate.
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstSubnet;

impl SubnetSelector for FirstSubnet {
    fn select(&mut self, _candidates: &[String]) -> usize {
        0
    }
}
