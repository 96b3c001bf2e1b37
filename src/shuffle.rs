//! Randomized presentation order and its inverse.
//!
//! Statements are shown to the model in a shuffled order to wash out position
//! bias. The permutation is recorded so answers can be mapped back to canonical
//! statement order once they have been validated.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShuffleError {
    #[error("answer count {answers} does not match presented item count {expected}")]
    LengthMismatch { expected: usize, answers: usize },
    #[error("not a permutation of 0..{len}: index {index} is out of range or repeated")]
    NotAPermutation { len: usize, index: usize },
}

/// Bijection over `[0, n)`. `permutation()[i]` is the canonical index of the
/// item shown at presentation position `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationOrder {
    permutation: Vec<usize>,
}

impl PresentationOrder {
    pub fn identity(len: usize) -> Self {
        Self {
            permutation: (0..len).collect(),
        }
    }

    /// Build an order from a caller-supplied permutation, rejecting anything
    /// that is not a bijection over `[0, len)`.
    pub fn from_permutation(permutation: Vec<usize>) -> Result<Self, ShuffleError> {
        let len = permutation.len();
        let mut seen = vec![false; len];
        for &index in &permutation {
            if index >= len || seen[index] {
                return Err(ShuffleError::NotAPermutation { len, index });
            }
            seen[index] = true;
        }
        Ok(Self { permutation })
    }

    pub fn len(&self) -> usize {
        self.permutation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permutation.is_empty()
    }

    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    /// Canonical index -> presentation position.
    pub fn inverse(&self) -> Vec<usize> {
        let mut inverse = vec![0; self.permutation.len()];
        for (position, &canonical) in self.permutation.iter().enumerate() {
            inverse[canonical] = position;
        }
        inverse
    }

    /// Reorder canonical items into presentation order.
    pub fn apply<T: Clone>(&self, canonical: &[T]) -> Result<Vec<T>, ShuffleError> {
        self.check_len(canonical.len())?;
        Ok(self
            .permutation
            .iter()
            .map(|&idx| canonical[idx].clone())
            .collect())
    }

    /// Map answers given in presentation order back to canonical order:
    /// `canonical[permutation[i]] = answers[i]`.
    pub fn deshuffle<T: Clone>(&self, answers: &[T]) -> Result<Vec<T>, ShuffleError> {
        self.check_len(answers.len())?;
        let inverse = self.inverse();
        Ok(inverse.iter().map(|&pos| answers[pos].clone()).collect())
    }

    fn check_len(&self, got: usize) -> Result<(), ShuffleError> {
        if got != self.permutation.len() {
            return Err(ShuffleError::LengthMismatch {
                expected: self.permutation.len(),
                answers: got,
            });
        }
        Ok(())
    }
}

/// Seeded source of presentation orders. A fixed seed reproduces the whole
/// sequence of shuffles for a run.
#[derive(Debug, Clone)]
pub struct OrderShuffler {
    rng: StdRng,
}

impl OrderShuffler {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next_order(&mut self, len: usize) -> PresentationOrder {
        let mut permutation: Vec<usize> = (0..len).collect();
        permutation.shuffle(&mut self.rng);
        PresentationOrder { permutation }
    }

    /// Shuffle `items`, returning them in presentation order with the order used.
    pub fn shuffle<T: Clone>(&mut self, items: &[T]) -> (Vec<T>, PresentationOrder) {
        let order = self.next_order(items.len());
        let shuffled = order
            .permutation
            .iter()
            .map(|&idx| items[idx].clone())
            .collect();
        (shuffled, order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deshuffle_restores_canonical_order() {
        let mut shuffler = OrderShuffler::seeded(7);
        let items: Vec<u32> = (0..12).collect();
        for _ in 0..50 {
            let (shuffled, order) = shuffler.shuffle(&items);
            assert_eq!(order.deshuffle(&shuffled).unwrap(), items);
        }
    }

    #[test]
    fn every_permutation_of_four_round_trips() {
        let items = ["a", "b", "c", "d"];
        let mut count = 0;
        for a in 0..4 {
            for b in 0..4 {
                for c in 0..4 {
                    for d in 0..4 {
                        let Ok(order) = PresentationOrder::from_permutation(vec![a, b, c, d])
                        else {
                            continue;
                        };
                        count += 1;
                        let shown = order.apply(&items).unwrap();
                        assert_eq!(order.deshuffle(&shown).unwrap(), items);
                    }
                }
            }
        }
        assert_eq!(count, 24);
    }

    #[test]
    fn permutation_maps_position_to_canonical_index() {
        let mut shuffler = OrderShuffler::seeded(3);
        let items = vec!["p0", "p1", "p2", "p3", "p4"];
        let (shown, order) = shuffler.shuffle(&items);
        for (pos, &canonical) in order.permutation().iter().enumerate() {
            assert_eq!(shown[pos], items[canonical]);
        }
    }

    #[test]
    fn same_seed_same_sequence() {
        let mut a = OrderShuffler::seeded(1);
        let mut b = OrderShuffler::seeded(1);
        for len in [3, 8, 20] {
            assert_eq!(a.next_order(len), b.next_order(len));
        }
    }

    #[test]
    fn deshuffle_rejects_length_mismatch() {
        let order = PresentationOrder::from_permutation(vec![2, 0, 1]).unwrap();
        let err = order.deshuffle(&[1, 2]).unwrap_err();
        assert_eq!(
            err,
            ShuffleError::LengthMismatch {
                expected: 3,
                answers: 2
            }
        );
    }

    #[test]
    fn explicit_deshuffle_example() {
        // Shown: canonical 2, then 0, then 1.
        let order = PresentationOrder::from_permutation(vec![2, 0, 1]).unwrap();
        assert_eq!(order.inverse(), vec![1, 2, 0]);
        assert_eq!(order.deshuffle(&[30, 10, 20]).unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn rejects_non_bijections() {
        assert!(PresentationOrder::from_permutation(vec![0, 0, 1]).is_err());
        assert!(PresentationOrder::from_permutation(vec![0, 3, 1]).is_err());
        assert!(PresentationOrder::from_permutation(vec![]).is_ok());
    }

    #[test]
    fn empty_and_identity() {
        let mut shuffler = OrderShuffler::seeded(0);
        let (shown, order) = shuffler.shuffle::<u8>(&[]);
        assert!(shown.is_empty());
        assert!(order.is_empty());
        let id = PresentationOrder::identity(4);
        assert_eq!(id.deshuffle(&[4, 3, 2, 1]).unwrap(), vec![4, 3, 2, 1]);
    }
}
