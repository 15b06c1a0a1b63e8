//! # Program Registry
//!
//! ## Responsibility
//! Authoritative, append-only store of every accepted candidate. Serves
//! lineage walks, cross-island sampling pools (global top programs), and is
//! the source of truth written into checkpoints.
//!
//! ## Guarantees
//! - Append-only: entries are never removed or replaced
//! - Unique: appending an id twice is an [`InvariantViolation`]
//! - Thread-safe: cheap to clone; clones share one `parking_lot::RwLock`, so
//!   reads run concurrently and appends are serialized
//! - Ordered: [`snapshot`](ProgramRegistry::snapshot) returns insertion order
//!
//! ## NOT Responsible For
//! - Deciding which candidates occupy grid cells (see: `archive`)
//! - Writing files (see: `checkpoint`)

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::candidate::{Candidate, CandidateId};
use crate::InvariantViolation;

#[derive(Debug, Default)]
struct Inner {
    by_id: HashMap<CandidateId, Arc<Candidate>>,
    order: Vec<Arc<Candidate>>,
}

/// Append-only candidate store.
///
/// Cheap to clone -- all clones share the same inner state via `Arc<RwLock<_>>`.
#[derive(Debug, Clone, Default)]
pub struct ProgramRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl ProgramRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from checkpointed programs, preserving their order.
    ///
    /// # Errors
    ///
    /// Returns [`InvariantViolation::DuplicateId`] if any id repeats.
    pub fn from_programs(programs: Vec<Candidate>) -> Result<Self, InvariantViolation> {
        let registry = Self::new();
        for candidate in programs {
            registry.append(candidate)?;
        }
        Ok(registry)
    }

    /// Append a candidate.
    ///
    /// # Errors
    ///
    /// Returns [`InvariantViolation::DuplicateId`] if the id is already registered.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn append(&self, candidate: Candidate) -> Result<Arc<Candidate>, InvariantViolation> {
        self.append_shared(Arc::new(candidate))
    }

    /// Append an already shared candidate.
    ///
    /// # Errors
    ///
    /// Returns [`InvariantViolation::DuplicateId`] if the id is already registered.
    pub fn append_shared(&self, candidate: Arc<Candidate>) -> Result<Arc<Candidate>, InvariantViolation> {
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&candidate.id) {
            return Err(InvariantViolation::DuplicateId(candidate.id.clone()));
        }
        inner.by_id.insert(candidate.id.clone(), Arc::clone(&candidate));
        inner.order.push(Arc::clone(&candidate));
        Ok(candidate)
    }

    /// Look up a candidate by id.
    pub fn get(&self, id: &CandidateId) -> Option<Arc<Candidate>> {
        self.inner.read().by_id.get(id).cloned()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &CandidateId) -> bool {
        self.inner.read().by_id.contains_key(id)
    }

    /// Number of registered candidates.
    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().order.is_empty()
    }

    /// All candidates in insertion order.
    pub fn snapshot(&self) -> Vec<Arc<Candidate>> {
        self.inner.read().order.clone()
    }

    /// Candidates owned by `island_id`, in insertion order.
    pub fn by_island(&self, island_id: usize) -> Vec<Arc<Candidate>> {
        self.inner
            .read()
            .order
            .iter()
            .filter(|c| c.island_id == island_id)
            .cloned()
            .collect()
    }

    /// The `n` highest-scoring candidates across all islands.
    ///
    /// Equal scores are ordered by insertion, earliest first.
    pub fn top(&self, n: usize) -> Vec<Arc<Candidate>> {
        let inner = self.inner.read();
        let mut ranked: Vec<(usize, &Arc<Candidate>)> = inner.order.iter().enumerate().collect();
        ranked.sort_by(|(ia, a), (ib, b)| b.score().total_cmp(&a.score()).then(ia.cmp(ib)));
        ranked.into_iter().take(n).map(|(_, c)| Arc::clone(c)).collect()
    }

    /// Walk parent links from `id` back to its root.
    ///
    /// The first element is the candidate itself. Parents that were never
    /// registered (e.g. rejected seeds) end the walk.
    pub fn lineage(&self, id: &CandidateId) -> Vec<Arc<Candidate>> {
        let inner = self.inner.read();
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = inner.by_id.get(id).cloned();
        while let Some(candidate) = cursor {
            if !seen.insert(candidate.id.clone()) {
                break;
            }
            cursor = candidate
                .parent_id
                .as_ref()
                .and_then(|p| inner.by_id.get(p).cloned());
            chain.push(candidate);
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::tests::candidate;

    fn child(id: &str, parent: &str, score: f64) -> Candidate {
        let mut c = candidate(id, &[0], score);
        c.parent_id = Some(CandidateId::new(parent));
        c
    }

    #[test]
    fn test_append_and_get() {
        let reg = ProgramRegistry::new();
        reg.append(candidate("a", &[0], 0.5)).unwrap();
        assert_eq!(reg.len(), 1);
        assert!(reg.contains(&CandidateId::new("a")));
        assert_eq!(reg.get(&CandidateId::new("a")).unwrap().score(), 0.5);
    }

    #[test]
    fn test_duplicate_id_is_invariant_violation() {
        let reg = ProgramRegistry::new();
        reg.append(candidate("a", &[0], 0.5)).unwrap();
        let err = reg.append(candidate("a", &[1], 0.9)).unwrap_err();
        assert!(matches!(err, InvariantViolation::DuplicateId(ref id) if id.as_str() == "a"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_from_programs_rejects_duplicates() {
        let err = ProgramRegistry::from_programs(vec![
            candidate("a", &[0], 0.1),
            candidate("a", &[0], 0.2),
        ])
        .unwrap_err();
        assert!(matches!(err, InvariantViolation::DuplicateId(_)));
    }

    #[test]
    fn test_snapshot_preserves_insertion_order() {
        let reg = ProgramRegistry::new();
        for id in ["c", "a", "b"] {
            reg.append(candidate(id, &[0], 0.1)).unwrap();
        }
        let ids: Vec<_> = reg.snapshot().iter().map(|c| c.id.to_string()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_top_ranks_by_score() {
        let reg = ProgramRegistry::new();
        reg.append(candidate("low", &[0], 0.1)).unwrap();
        reg.append(candidate("high", &[1], 0.9)).unwrap();
        reg.append(candidate("mid", &[2], 0.5)).unwrap();
        let ids: Vec<_> = reg.top(2).iter().map(|c| c.id.to_string()).collect();
        assert_eq!(ids, vec!["high", "mid"]);
    }

    #[test]
    fn test_lineage_walks_to_root() {
        let reg = ProgramRegistry::new();
        reg.append(candidate("root", &[0], 0.1)).unwrap();
        reg.append(child("mid", "root", 0.2)).unwrap();
        reg.append(child("leaf", "mid", 0.3)).unwrap();
        let ids: Vec<_> = reg
            .lineage(&CandidateId::new("leaf"))
            .iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(ids, vec!["leaf", "mid", "root"]);
    }

    #[test]
    fn test_lineage_stops_at_unregistered_parent() {
        let reg = ProgramRegistry::new();
        reg.append(child("orphan", "missing", 0.2)).unwrap();
        assert_eq!(reg.lineage(&CandidateId::new("orphan")).len(), 1);
        assert!(reg.lineage(&CandidateId::new("nope")).is_empty());
    }

    #[test]
    fn test_by_island_filters() {
        let reg = ProgramRegistry::new();
        let mut a = candidate("a", &[0], 0.1);
        a.island_id = 1;
        reg.append(a).unwrap();
        reg.append(candidate("b", &[0], 0.1)).unwrap();
        assert_eq!(reg.by_island(1).len(), 1);
        assert_eq!(reg.by_island(0).len(), 1);
    }

    #[test]
    fn test_clone_shares_state() {
        let reg = ProgramRegistry::new();
        let reg2 = reg.clone();
        reg.append(candidate("a", &[0], 0.1)).unwrap();
        assert_eq!(reg2.len(), 1);
    }

    #[test]
    fn test_concurrent_appends_are_serialized() {
        let reg = ProgramRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        reg.append(candidate(&format!("t{t}-{i}"), &[0], 0.1)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 400);
    }
}
