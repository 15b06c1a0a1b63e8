//! # Feature Grid
//!
//! ## Responsibility
//! Keep the single best candidate per feature coordinate (MAP-Elites cell)
//! and draw parents from the populated cells.
//!
//! ## Guarantees
//! - Elitist: a cell's occupant is replaced only by a strictly higher score;
//!   ties keep the existing occupant (first-write-wins)
//! - Monotonic: a cell's score never decreases
//! - Deterministic: cells iterate in coordinate order, and all randomness
//!   comes from the RNG passed in by the caller
//! - Non-failing sampling: an empty grid yields an empty sample
//!
//! ## NOT Responsible For
//! - Computing coordinates (see: `features`)
//! - Cross-island movement (see: `islands`)

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::candidate::{Candidate, CandidateId, FeatureCoord};
use crate::InvariantViolation;

/// Parent selection strategy for [`FeatureGrid::sample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStrategy {
    /// Highest scores first.
    Elite,
    /// Spread across the feature space.
    Diverse,
    /// Uniform over occupants.
    Random,
}

impl SampleStrategy {
    /// Lowercase label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Elite => "elite",
            Self::Diverse => "diverse",
            Self::Random => "random",
        }
    }
}

/// Result of offering a candidate to a cell.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    /// Whether the candidate now occupies its cell.
    pub accepted: bool,
    /// Previous occupant replaced by this insert, if any.
    pub displaced: Option<CandidateId>,
}

/// Coordinate → best candidate mapping for one island.
#[derive(Debug, Clone, Default)]
pub struct FeatureGrid {
    cells: BTreeMap<FeatureCoord, Arc<Candidate>>,
}

impl FeatureGrid {
    /// Create an empty grid.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of occupied cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether no cell is occupied.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Occupant at `coord`, if any.
    pub fn get(&self, coord: &FeatureCoord) -> Option<&Arc<Candidate>> {
        self.cells.get(coord)
    }

    /// Iterate occupied cells in coordinate order.
    pub fn cells(&self) -> impl Iterator<Item = (&FeatureCoord, &Arc<Candidate>)> {
        self.cells.iter()
    }

    /// Whether [`insert`](Self::insert) would accept `candidate` right now.
    pub fn would_accept(&self, candidate: &Candidate) -> bool {
        match self.cells.get(&candidate.coordinate) {
            None => true,
            Some(occupant) => candidate.score() > occupant.score(),
        }
    }

    /// Offer a candidate to the cell at its own coordinate.
    ///
    /// Accepts iff the cell is empty or `candidate.score > occupant.score`.
    ///
    /// # Errors
    ///
    /// Returns [`InvariantViolation::ScoreRegression`] if an accepted write
    /// would lower the cell's score. This cannot happen through the
    /// acceptance rule above; reaching it means the grid was corrupted.
    pub fn insert(&mut self, candidate: Arc<Candidate>) -> Result<InsertOutcome, InvariantViolation> {
        if !self.would_accept(&candidate) {
            return Ok(InsertOutcome {
                accepted: false,
                displaced: None,
            });
        }
        let coord = candidate.coordinate.clone();
        let new_score = candidate.score();
        let previous = self.cells.insert(coord.clone(), candidate);
        match previous {
            Some(old) if old.score() > new_score => Err(InvariantViolation::ScoreRegression {
                coordinate: coord,
                previous: old.score(),
                attempted: new_score,
            }),
            Some(old) => Ok(InsertOutcome {
                accepted: true,
                displaced: Some(old.id.clone()),
            }),
            None => Ok(InsertOutcome {
                accepted: true,
                displaced: None,
            }),
        }
    }

    /// Place a candidate into `coord` unconditionally while restoring a checkpoint.
    ///
    /// # Errors
    ///
    /// - [`InvariantViolation::CoordinateMismatch`] if the candidate's own
    ///   coordinate differs from `coord`.
    /// - [`InvariantViolation::DuplicateCell`] if the cell is already filled.
    pub(crate) fn restore_cell(
        &mut self,
        coord: FeatureCoord,
        candidate: Arc<Candidate>,
    ) -> Result<(), InvariantViolation> {
        if candidate.coordinate != coord {
            return Err(InvariantViolation::CoordinateMismatch {
                id: candidate.id.clone(),
                cell: coord,
                recorded: candidate.coordinate.clone(),
            });
        }
        if self.cells.contains_key(&coord) {
            return Err(InvariantViolation::DuplicateCell(coord));
        }
        self.cells.insert(coord, candidate);
        Ok(())
    }

    /// Draw up to `count` occupants with the given strategy.
    ///
    /// - `Elite`: highest score first; equal scores ordered by id.
    /// - `Diverse`: farthest-point selection over coordinates. The first pick
    ///   is uniform; each next pick maximizes its Manhattan distance to the
    ///   nearest already-picked cell, ties going to the higher score and then
    ///   to the lower coordinate. Under-populated regions are therefore
    ///   favoured simply by being far from everything picked so far.
    /// - `Random`: uniform without replacement.
    ///
    /// Returns fewer than `count` when the grid holds fewer occupants.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        strategy: SampleStrategy,
        count: usize,
        rng: &mut R,
    ) -> Vec<Arc<Candidate>> {
        if count == 0 || self.cells.is_empty() {
            return Vec::new();
        }
        let occupants: Vec<&Arc<Candidate>> = self.cells.values().collect();
        match strategy {
            SampleStrategy::Elite => {
                let mut sorted = occupants;
                sorted.sort_by(|a, b| {
                    b.score()
                        .total_cmp(&a.score())
                        .then_with(|| a.id.cmp(&b.id))
                });
                sorted.into_iter().take(count).cloned().collect()
            }
            SampleStrategy::Random => {
                let amount = count.min(occupants.len());
                rand::seq::index::sample(rng, occupants.len(), amount)
                    .into_iter()
                    .map(|i| Arc::clone(occupants[i]))
                    .collect()
            }
            SampleStrategy::Diverse => farthest_point(&occupants, count, rng),
        }
    }

    /// Best occupant by score, ties to the lower id.
    pub fn best(&self) -> Option<&Arc<Candidate>> {
        self.cells.values().max_by(|a, b| {
            a.score()
                .total_cmp(&b.score())
                .then_with(|| b.id.cmp(&a.id))
        })
    }
}

fn farthest_point<R: Rng + ?Sized>(
    occupants: &[&Arc<Candidate>],
    count: usize,
    rng: &mut R,
) -> Vec<Arc<Candidate>> {
    let mut remaining: Vec<&Arc<Candidate>> = occupants.to_vec();
    let first = remaining.remove(rng.gen_range(0..remaining.len()));
    let mut picked = vec![first];

    while picked.len() < count && !remaining.is_empty() {
        let mut best_idx = 0;
        let mut best_key: Option<(usize, f64)> = None;
        for (idx, cand) in remaining.iter().enumerate() {
            let nearest = picked
                .iter()
                .map(|p| p.coordinate.manhattan(&cand.coordinate))
                .min()
                .unwrap_or(0);
            let key = (nearest, cand.score());
            let better = match best_key {
                None => true,
                Some((d, s)) => nearest > d || (nearest == d && key.1 > s),
            };
            if better {
                best_idx = idx;
                best_key = Some(key);
            }
        }
        picked.push(remaining.remove(best_idx));
    }

    picked.into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::tests::candidate;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(42)
    }

    #[test]
    fn test_basic_elitism_scenario() {
        let mut grid = FeatureGrid::new();
        let a = grid.insert(Arc::new(candidate("A", &[2, 3], 0.5))).unwrap();
        assert!(a.accepted);

        let b = grid.insert(Arc::new(candidate("B", &[2, 3], 0.7))).unwrap();
        assert!(b.accepted);
        assert_eq!(b.displaced, Some(CandidateId::new("A")));

        let c = grid.insert(Arc::new(candidate("C", &[2, 3], 0.6))).unwrap();
        assert!(!c.accepted);

        let occupant = grid.get(&FeatureCoord::new(vec![2, 3])).unwrap();
        assert_eq!(occupant.id.as_str(), "B");
    }

    #[test]
    fn test_tie_keeps_existing_occupant() {
        let mut grid = FeatureGrid::new();
        grid.insert(Arc::new(candidate("first", &[0], 0.5))).unwrap();
        let out = grid.insert(Arc::new(candidate("second", &[0], 0.5))).unwrap();
        assert!(!out.accepted);
        assert_eq!(grid.get(&FeatureCoord::new(vec![0])).unwrap().id.as_str(), "first");
    }

    #[test]
    fn test_cell_score_never_decreases() {
        let mut grid = FeatureGrid::new();
        let mut r = rng();
        let coord = FeatureCoord::new(vec![1, 1]);
        let mut last = f64::NEG_INFINITY;
        for i in 0..500 {
            let score: f64 = r.gen_range(-1.0..1.0);
            grid.insert(Arc::new(candidate(&format!("c{i}"), &[1, 1], score)))
                .unwrap();
            let now = grid.get(&coord).unwrap().score();
            assert!(now >= last, "score regressed from {last} to {now}");
            last = now;
        }
    }

    #[test]
    fn test_sample_empty_grid_returns_empty() {
        let grid = FeatureGrid::new();
        let mut r = rng();
        assert!(grid.sample(SampleStrategy::Elite, 3, &mut r).is_empty());
        assert!(grid.sample(SampleStrategy::Diverse, 3, &mut r).is_empty());
        assert!(grid.sample(SampleStrategy::Random, 3, &mut r).is_empty());
    }

    #[test]
    fn test_sample_elite_orders_by_score() {
        let mut grid = FeatureGrid::new();
        grid.insert(Arc::new(candidate("low", &[0, 0], 0.1))).unwrap();
        grid.insert(Arc::new(candidate("high", &[0, 1], 0.9))).unwrap();
        grid.insert(Arc::new(candidate("mid", &[1, 0], 0.5))).unwrap();
        let picked = grid.sample(SampleStrategy::Elite, 2, &mut rng());
        let ids: Vec<&str> = picked.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid"]);
    }

    #[test]
    fn test_sample_returns_fewer_when_grid_small() {
        let mut grid = FeatureGrid::new();
        grid.insert(Arc::new(candidate("only", &[0], 0.1))).unwrap();
        for strategy in [SampleStrategy::Elite, SampleStrategy::Diverse, SampleStrategy::Random] {
            assert_eq!(grid.sample(strategy, 5, &mut rng()).len(), 1);
        }
    }

    #[test]
    fn test_sample_random_has_no_duplicates() {
        let mut grid = FeatureGrid::new();
        for i in 0..10 {
            grid.insert(Arc::new(candidate(&format!("c{i}"), &[i], 0.1))).unwrap();
        }
        let picked = grid.sample(SampleStrategy::Random, 6, &mut rng());
        let mut ids: Vec<_> = picked.iter().map(|c| c.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn test_sample_diverse_spreads_coordinates() {
        let mut grid = FeatureGrid::new();
        // A dense cluster near the origin and one far-away cell.
        for i in 0..4 {
            grid.insert(Arc::new(candidate(&format!("near{i}"), &[0, i], 0.9))).unwrap();
        }
        grid.insert(Arc::new(candidate("far", &[9, 9], 0.1))).unwrap();

        let picked = grid.sample(SampleStrategy::Diverse, 2, &mut rng());
        assert_eq!(picked.len(), 2);
        // Whatever the uniform first pick was, "far" is the farthest cell from it.
        assert!(picked.iter().any(|c| c.id.as_str() == "far"));
    }

    #[test]
    fn test_sample_is_reproducible_with_same_seed() {
        let mut grid = FeatureGrid::new();
        for i in 0..8 {
            grid.insert(Arc::new(candidate(&format!("c{i}"), &[i, 8 - i], i as f64)))
                .unwrap();
        }
        for strategy in [SampleStrategy::Diverse, SampleStrategy::Random] {
            let a = grid.sample(strategy, 4, &mut ChaCha8Rng::seed_from_u64(5));
            let b = grid.sample(strategy, 4, &mut ChaCha8Rng::seed_from_u64(5));
            let ids_a: Vec<_> = a.iter().map(|c| c.id.clone()).collect();
            let ids_b: Vec<_> = b.iter().map(|c| c.id.clone()).collect();
            assert_eq!(ids_a, ids_b);
        }
    }

    #[test]
    fn test_restore_cell_rejects_mismatched_coordinate() {
        let mut grid = FeatureGrid::new();
        let err = grid
            .restore_cell(FeatureCoord::new(vec![1]), Arc::new(candidate("x", &[2], 0.1)))
            .unwrap_err();
        assert!(matches!(err, InvariantViolation::CoordinateMismatch { .. }));
    }

    #[test]
    fn test_best_returns_highest_score() {
        let mut grid = FeatureGrid::new();
        grid.insert(Arc::new(candidate("a", &[0], 0.3))).unwrap();
        grid.insert(Arc::new(candidate("b", &[1], 0.8))).unwrap();
        assert_eq!(grid.best().unwrap().id.as_str(), "b");
    }
}
