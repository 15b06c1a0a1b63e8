//! # Island Set
//!
//! ## Responsibility
//! Partition the population into `N` independent feature grids and move
//! strong candidates between them on a configured topology.
//!
//! ## Guarantees
//! - Isolation: apart from [`IslandSet::migrate`], no operation touches more
//!   than one island
//! - Copy, not move: a migrant is a fresh candidate with a new id whose
//!   `parent_id` is the original; the original stays where it was
//! - Consistent snapshot: every island's emigrants are chosen before any
//!   immigrant is inserted, so a single migration never chains a candidate
//!   across two hops
//! - Registered: accepted migrants are appended to the [`ProgramRegistry`]
//!   before they enter a grid; rejected ones are never registered
//!
//! ## NOT Responsible For
//! - Deciding when to migrate (see: `controller`)
//! - Computing coordinates (see: `features`)

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use super::grid::{FeatureGrid, InsertOutcome, SampleStrategy};
use crate::candidate::{Candidate, CandidateId, FeatureCoord};
use crate::config::Topology;
use crate::registry::ProgramRegistry;
use crate::InvariantViolation;

/// One island: a feature grid plus the ids of every candidate it owns.
#[derive(Debug, Clone, Default)]
pub struct Island {
    id: usize,
    grid: FeatureGrid,
    members: BTreeSet<CandidateId>,
}

impl Island {
    /// Island index.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The island's feature grid.
    pub fn grid(&self) -> &FeatureGrid {
        &self.grid
    }

    /// Ids of every candidate offered to this island's grid, whether or not
    /// its cell accepted it. Matches the registry entries owned by the island.
    pub fn members(&self) -> &BTreeSet<CandidateId> {
        &self.members
    }
}

/// Summary of one migration round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationReport {
    /// Copies offered to destination grids.
    pub offered: usize,
    /// `(new id, destination island)` for every accepted copy.
    pub accepted: Vec<(CandidateId, usize)>,
}

/// Fixed-size collection of islands sharing one topology.
#[derive(Debug, Clone)]
pub struct IslandSet {
    islands: Vec<Island>,
    topology: Topology,
    dimensions: usize,
}

impl IslandSet {
    /// Create `count` empty islands whose coordinates have `dimensions` components.
    pub fn new(count: usize, topology: Topology, dimensions: usize) -> Self {
        let islands = (0..count)
            .map(|id| Island {
                id,
                ..Island::default()
            })
            .collect();
        Self {
            islands,
            topology,
            dimensions,
        }
    }

    /// Number of islands.
    pub fn len(&self) -> usize {
        self.islands.len()
    }

    /// Whether the set has no islands.
    pub fn is_empty(&self) -> bool {
        self.islands.is_empty()
    }

    /// Borrow one island.
    pub fn island(&self, id: usize) -> Option<&Island> {
        self.islands.get(id)
    }

    /// All islands in index order.
    pub fn islands(&self) -> &[Island] {
        &self.islands
    }

    /// Configured topology.
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Total occupied cells across all islands.
    pub fn occupied_cells(&self) -> usize {
        self.islands.iter().map(|i| i.grid.len()).sum()
    }

    /// Island for a newly created candidate.
    ///
    /// A hint (the parent's island) wins, reduced modulo the island count.
    /// Without one, the id is hashed with FNV-1a so the same id always maps
    /// to the same island, across processes too.
    pub fn assign(&self, hint: Option<usize>, id: &CandidateId) -> usize {
        let n = self.islands.len().max(1);
        match hint {
            Some(h) => h % n,
            None => (fnv1a(id.as_str().as_bytes()) % n as u64) as usize,
        }
    }

    /// Destination islands for migrants leaving `island`.
    ///
    /// - `Ring`: the two neighbours `i-1` and `i+1` (mod N), deduplicated
    /// - `FullyConnected`: every other island
    /// - `Isolated`: none
    pub fn neighbors(&self, island: usize) -> Vec<usize> {
        let n = self.islands.len();
        if n < 2 {
            return Vec::new();
        }
        match self.topology {
            Topology::Isolated => Vec::new(),
            Topology::FullyConnected => (0..n).filter(|&j| j != island).collect(),
            Topology::Ring => {
                let next = (island + 1) % n;
                let prev = (island + n - 1) % n;
                let mut out = vec![next];
                if prev != next {
                    out.push(prev);
                }
                out
            }
        }
    }

    fn check_shape(&self, candidate: &Candidate) -> Result<(), InvariantViolation> {
        if candidate.island_id >= self.islands.len() {
            return Err(InvariantViolation::UnknownIsland {
                id: candidate.id.clone(),
                island: candidate.island_id,
                islands: self.islands.len(),
            });
        }
        if candidate.coordinate.len() != self.dimensions {
            return Err(InvariantViolation::CoordinateArity {
                id: candidate.id.clone(),
                expected: self.dimensions,
                actual: candidate.coordinate.len(),
            });
        }
        Ok(())
    }

    /// Whether the candidate's island grid would accept it.
    pub fn would_accept(&self, candidate: &Candidate) -> bool {
        self.islands
            .get(candidate.island_id)
            .is_some_and(|island| island.grid.would_accept(candidate))
    }

    /// Offer a candidate to the grid of `candidate.island_id`.
    ///
    /// # Errors
    ///
    /// - [`InvariantViolation::UnknownIsland`] for an out-of-range island id.
    /// - [`InvariantViolation::CoordinateArity`] for a coordinate of the wrong length.
    /// - Any violation raised by [`FeatureGrid::insert`].
    pub fn insert(&mut self, candidate: Arc<Candidate>) -> Result<InsertOutcome, InvariantViolation> {
        self.check_shape(&candidate)?;
        let island = &mut self.islands[candidate.island_id];
        let id = candidate.id.clone();
        let outcome = island.grid.insert(candidate)?;
        island.members.insert(id);
        Ok(outcome)
    }

    /// Sample parents from one island. Unknown islands yield nothing.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        island: usize,
        strategy: SampleStrategy,
        count: usize,
        rng: &mut R,
    ) -> Vec<Arc<Candidate>> {
        self.islands
            .get(island)
            .map(|i| i.grid.sample(strategy, count, rng))
            .unwrap_or_default()
    }

    /// Best candidate over all islands, ties to the lower id.
    pub fn best(&self) -> Option<Arc<Candidate>> {
        self.islands
            .iter()
            .filter_map(|i| i.grid.best())
            .max_by(|a, b| a.score().total_cmp(&b.score()).then_with(|| b.id.cmp(&a.id)))
            .cloned()
    }

    /// Copy each island's top `k` into its topology neighbours.
    ///
    /// Emigrants are snapshotted for all islands first. Each copy gets a
    /// fresh id from `rng`, is checked against the destination cell, and is
    /// registered then inserted only if it would be accepted.
    ///
    /// # Errors
    ///
    /// Propagates any [`InvariantViolation`] from the registry or grids.
    pub fn migrate<R: Rng + ?Sized>(
        &mut self,
        k: usize,
        registry: &ProgramRegistry,
        rng: &mut R,
    ) -> Result<MigrationReport, InvariantViolation> {
        let mut report = MigrationReport::default();
        if k == 0 || matches!(self.topology, Topology::Isolated) {
            return Ok(report);
        }

        let plan: Vec<(usize, Vec<Arc<Candidate>>)> = self
            .islands
            .iter()
            .map(|island| (island.id, island.grid.sample(SampleStrategy::Elite, k, rng)))
            .collect();

        for (source, emigrants) in plan {
            for destination in self.neighbors(source) {
                for original in &emigrants {
                    report.offered += 1;
                    let copy = original.migrant_copy(CandidateId::mint(rng), destination);
                    if !self.islands[destination].grid.would_accept(&copy) {
                        continue;
                    }
                    let copy = registry.append(copy)?;
                    let new_id = copy.id.clone();
                    self.insert(copy)?;
                    debug!(
                        from = source,
                        to = destination,
                        original = %original.id,
                        copy = %new_id,
                        "migrant accepted"
                    );
                    report.accepted.push((new_id, destination));
                }
            }
        }
        Ok(report)
    }

    /// Rebuild islands from checkpointed cells.
    ///
    /// `cells[i]` lists `(coordinate, candidate)` pairs for island `i`;
    /// membership is rebuilt from every registry entry owned by that island.
    ///
    /// # Errors
    ///
    /// - [`InvariantViolation::IslandCountMismatch`] if `cells.len()` differs
    ///   from the configured island count.
    /// - [`InvariantViolation::UnknownIsland`] if a cell holds a candidate
    ///   owned by a different island.
    /// - [`InvariantViolation::EmptyCell`] if a registered candidate's cell
    ///   on its island has no occupant.
    /// - [`InvariantViolation::ScoreRegression`] if a registered candidate
    ///   scores higher than the occupant of its cell.
    /// - Any violation raised by [`FeatureGrid::restore_cell`].
    pub(crate) fn restore(
        count: usize,
        topology: Topology,
        dimensions: usize,
        cells: Vec<Vec<(FeatureCoord, Arc<Candidate>)>>,
        registry: &ProgramRegistry,
    ) -> Result<Self, InvariantViolation> {
        if cells.len() != count {
            return Err(InvariantViolation::IslandCountMismatch {
                configured: count,
                checkpoint: cells.len(),
            });
        }
        let mut set = Self::new(count, topology, dimensions);
        for (island_id, island_cells) in cells.into_iter().enumerate() {
            for (coord, candidate) in island_cells {
                if candidate.island_id != island_id {
                    return Err(InvariantViolation::UnknownIsland {
                        id: candidate.id.clone(),
                        island: candidate.island_id,
                        islands: count,
                    });
                }
                set.check_shape(&candidate)?;
                set.islands[island_id].grid.restore_cell(coord, candidate)?;
            }
        }
        for candidate in registry.snapshot() {
            let Some(island) = set.islands.get_mut(candidate.island_id) else {
                continue;
            };
            // Each cell must hold the best score ever seen there.
            match island.grid.get(&candidate.coordinate) {
                None => {
                    return Err(InvariantViolation::EmptyCell {
                        id: candidate.id.clone(),
                        island: candidate.island_id,
                        coordinate: candidate.coordinate.clone(),
                    });
                }
                Some(occupant) if occupant.score() < candidate.score() => {
                    return Err(InvariantViolation::ScoreRegression {
                        coordinate: candidate.coordinate.clone(),
                        previous: candidate.score(),
                        attempted: occupant.score(),
                    });
                }
                Some(_) => {}
            }
            island.members.insert(candidate.id.clone());
        }
        Ok(set)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::tests::candidate;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn on_island(id: &str, island: usize, coord: &[usize], score: f64) -> Arc<Candidate> {
        let mut c = candidate(id, coord, score);
        c.island_id = island;
        Arc::new(c)
    }

    fn seeded(set: &mut IslandSet, reg: &ProgramRegistry, c: Arc<Candidate>) {
        reg.append_shared(Arc::clone(&c)).unwrap();
        set.insert(c).unwrap();
    }

    #[test]
    fn test_assign_uses_hint_modulo() {
        let set = IslandSet::new(3, Topology::Ring, 1);
        assert_eq!(set.assign(Some(1), &CandidateId::new("x")), 1);
        assert_eq!(set.assign(Some(4), &CandidateId::new("x")), 1);
    }

    #[test]
    fn test_assign_without_hint_is_stable() {
        let set = IslandSet::new(5, Topology::Ring, 1);
        let id = CandidateId::new("7f6c1e0a-stable");
        let first = set.assign(None, &id);
        for _ in 0..10 {
            assert_eq!(set.assign(None, &id), first);
        }
        assert!(first < 5);
    }

    #[test]
    fn test_ring_neighbors() {
        let set = IslandSet::new(4, Topology::Ring, 1);
        assert_eq!(set.neighbors(0), vec![1, 3]);
        assert_eq!(set.neighbors(3), vec![0, 2]);
        let pair = IslandSet::new(2, Topology::Ring, 1);
        assert_eq!(pair.neighbors(0), vec![1]);
    }

    #[test]
    fn test_fully_connected_and_isolated_neighbors() {
        let full = IslandSet::new(3, Topology::FullyConnected, 1);
        assert_eq!(full.neighbors(1), vec![0, 2]);
        let iso = IslandSet::new(3, Topology::Isolated, 1);
        assert!(iso.neighbors(1).is_empty());
        let single = IslandSet::new(1, Topology::Ring, 1);
        assert!(single.neighbors(0).is_empty());
    }

    #[test]
    fn test_insert_rejects_wrong_arity() {
        let mut set = IslandSet::new(2, Topology::Ring, 2);
        let err = set.insert(on_island("a", 0, &[1], 0.5)).unwrap_err();
        assert!(matches!(err, InvariantViolation::CoordinateArity { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn test_insert_rejects_unknown_island() {
        let mut set = IslandSet::new(2, Topology::Ring, 1);
        let err = set.insert(on_island("a", 7, &[1], 0.5)).unwrap_err();
        assert!(matches!(err, InvariantViolation::UnknownIsland { island: 7, .. }));
    }

    #[test]
    fn test_islands_are_independent() {
        let mut set = IslandSet::new(2, Topology::Ring, 1);
        set.insert(on_island("a", 0, &[3], 0.9)).unwrap();
        let out = set.insert(on_island("b", 1, &[3], 0.1)).unwrap();
        assert!(out.accepted, "same coordinate on another island is a separate cell");
        assert_eq!(set.occupied_cells(), 2);
    }

    #[test]
    fn test_migration_copies_not_moves() {
        let reg = ProgramRegistry::new();
        let mut set = IslandSet::new(2, Topology::Ring, 1);
        seeded(&mut set, &reg, on_island("star", 0, &[4], 0.9));

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let report = set.migrate(1, &reg, &mut rng).unwrap();

        assert_eq!(report.accepted.len(), 1);
        let (new_id, dest) = &report.accepted[0];
        assert_eq!(*dest, 1);
        assert_ne!(new_id.as_str(), "star");

        // Original untouched on island 0.
        let origin = set.island(0).unwrap().grid().get(&FeatureCoord::new(vec![4])).unwrap();
        assert_eq!(origin.id.as_str(), "star");

        // Copy on island 1 points back at the original.
        let copy = set.island(1).unwrap().grid().get(&FeatureCoord::new(vec![4])).unwrap();
        assert_eq!(copy.parent_id, Some(CandidateId::new("star")));
        assert_eq!(copy.island_id, 1);
        assert!(reg.contains(new_id));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_migration_skips_weaker_copies() {
        let reg = ProgramRegistry::new();
        let mut set = IslandSet::new(2, Topology::Ring, 1);
        seeded(&mut set, &reg, on_island("weak", 0, &[2], 0.2));
        seeded(&mut set, &reg, on_island("strong", 1, &[2], 0.8));

        let report = set.migrate(1, &reg, &mut ChaCha8Rng::seed_from_u64(3)).unwrap();

        // Only strong -> island 0 is accepted; weak -> island 1 is rejected and not registered.
        assert_eq!(report.offered, 2);
        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.accepted[0].1, 0);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_migration_does_not_chain_within_one_round() {
        let reg = ProgramRegistry::new();
        let mut set = IslandSet::new(3, Topology::FullyConnected, 1);
        seeded(&mut set, &reg, on_island("only", 0, &[0], 0.5));

        let report = set.migrate(1, &reg, &mut ChaCha8Rng::seed_from_u64(9)).unwrap();

        // Islands 1 and 2 were empty in the snapshot, so only island 0 emits.
        assert_eq!(report.offered, 2);
        for (id, _) in &report.accepted {
            assert_eq!(reg.get(id).unwrap().parent_id, Some(CandidateId::new("only")));
        }
    }

    #[test]
    fn test_isolated_topology_never_migrates() {
        let reg = ProgramRegistry::new();
        let mut set = IslandSet::new(3, Topology::Isolated, 1);
        seeded(&mut set, &reg, on_island("a", 0, &[0], 0.5));
        let report = set.migrate(2, &reg, &mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        assert_eq!(report, MigrationReport::default());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_restore_rebuilds_cells_and_members() {
        let reg = ProgramRegistry::new();
        let a = reg.append_shared(on_island("a", 0, &[1], 0.3)).unwrap();
        reg.append_shared(on_island("old", 1, &[2], 0.1)).unwrap();
        let b = reg.append_shared(on_island("b", 1, &[2], 0.6)).unwrap();

        let set = IslandSet::restore(
            2,
            Topology::Ring,
            1,
            vec![
                vec![(FeatureCoord::new(vec![1]), a)],
                vec![(FeatureCoord::new(vec![2]), b)],
            ],
            &reg,
        )
        .unwrap();

        assert_eq!(set.occupied_cells(), 2);
        assert_eq!(set.island(1).unwrap().members().len(), 2);
        assert_eq!(set.best().unwrap().id.as_str(), "b");
    }

    #[test]
    fn test_restore_rejects_cell_holding_a_displaced_candidate() {
        let reg = ProgramRegistry::new();
        let lo = reg.append_shared(on_island("lo", 0, &[3], 0.2)).unwrap();
        reg.append_shared(on_island("hi", 0, &[3], 0.9)).unwrap();

        let cells = vec![vec![(FeatureCoord::new(vec![3]), lo)]];
        let err = IslandSet::restore(1, Topology::Ring, 1, cells, &reg).unwrap_err();
        assert_eq!(
            err,
            InvariantViolation::ScoreRegression {
                coordinate: FeatureCoord::new(vec![3]),
                previous: 0.9,
                attempted: 0.2,
            }
        );
    }

    #[test]
    fn test_restore_rejects_registered_candidate_without_cell() {
        let reg = ProgramRegistry::new();
        reg.append_shared(on_island("orphan", 1, &[4], 0.5)).unwrap();

        let err = IslandSet::restore(2, Topology::Ring, 1, vec![vec![], vec![]], &reg).unwrap_err();
        assert!(matches!(err, InvariantViolation::EmptyCell { island: 1, .. }));
    }

    #[test]
    fn test_rejected_child_is_still_a_member() {
        let reg = ProgramRegistry::new();
        let mut set = IslandSet::new(1, Topology::Ring, 1);
        seeded(&mut set, &reg, on_island("strong", 0, &[2], 0.8));
        reg.append_shared(on_island("weak", 0, &[2], 0.3)).unwrap();
        let out = set.insert(on_island("weak", 0, &[2], 0.3)).unwrap();
        assert!(!out.accepted);

        let live: Vec<_> = set.island(0).unwrap().members().iter().cloned().collect();
        let cells = set
            .island(0)
            .unwrap()
            .grid()
            .cells()
            .map(|(k, c)| (k.clone(), Arc::clone(c)))
            .collect();
        let restored = IslandSet::restore(1, Topology::Ring, 1, vec![cells], &reg).unwrap();
        let after: Vec<_> = restored.island(0).unwrap().members().iter().cloned().collect();

        assert_eq!(live.len(), 2);
        assert_eq!(live, after);
    }

    #[test]
    fn test_restore_rejects_island_count_mismatch() {
        let reg = ProgramRegistry::new();
        let err = IslandSet::restore(3, Topology::Ring, 1, vec![vec![]], &reg).unwrap_err();
        assert!(matches!(
            err,
            InvariantViolation::IslandCountMismatch { configured: 3, checkpoint: 1 }
        ));
    }
}
