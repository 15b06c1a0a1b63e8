//! Archive benchmarks: feature-grid insert and parent sampling.
//!
//! The controller runs both on its own task for every iteration, so they
//! bound how fast results can be ingested regardless of worker count.

use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio_evolve_orchestrator::archive::{FeatureGrid, SampleStrategy};
use tokio_evolve_orchestrator::{Candidate, CandidateId, FeatureCoord, Metrics};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_candidate(rng: &mut ChaCha8Rng, bins: usize) -> Arc<Candidate> {
    let score: f64 = rng.gen();
    Arc::new(Candidate {
        id: CandidateId::mint(rng),
        source: String::from("fn main() {}"),
        parent_id: None,
        generation: 0,
        island_id: 0,
        metrics: Metrics::from_score(score).expect("finite score"),
        coordinate: FeatureCoord::new(vec![rng.gen_range(0..bins), rng.gen_range(0..bins)]),
        valid: true,
        created_at_ms: 0,
        artifacts: BTreeMap::new(),
    })
}

fn filled_grid(bins: usize, inserts: usize) -> FeatureGrid {
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let mut grid = FeatureGrid::new();
    for _ in 0..inserts {
        grid.insert(make_candidate(&mut rng, bins)).expect("insert");
    }
    grid
}

// ---------------------------------------------------------------------------
// Bench: insert into a 10x10 grid
// ---------------------------------------------------------------------------

fn bench_insert(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let pool: Vec<_> = (0..1_000).map(|_| make_candidate(&mut rng, 10)).collect();

    c.bench_function("grid_insert_1000", |b| {
        b.iter(|| {
            let mut grid = FeatureGrid::new();
            for candidate in &pool {
                let _ = black_box(grid.insert(Arc::clone(candidate)));
            }
            grid.len()
        })
    });
}

// ---------------------------------------------------------------------------
// Bench: sampling strategies by grid size
// ---------------------------------------------------------------------------

fn bench_sample(c: &mut Criterion) {
    let mut group = c.benchmark_group("grid_sample");
    for bins in [5usize, 10, 30] {
        let grid = filled_grid(bins, bins * bins * 4);
        for strategy in [SampleStrategy::Elite, SampleStrategy::Diverse, SampleStrategy::Random] {
            group.bench_with_input(
                BenchmarkId::new(strategy.as_str(), bins * bins),
                &grid,
                |b, grid| {
                    let mut rng = ChaCha8Rng::seed_from_u64(3);
                    b.iter(|| black_box(grid.sample(strategy, 4, &mut rng)))
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_insert, bench_sample);
criterion_main!(benches);
