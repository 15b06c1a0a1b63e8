//! Quality-diversity archive: feature discretization, per-island grids, and
//! the island set that ties them together.

pub mod features;
pub mod grid;
pub mod islands;

pub use features::{bin_index, Discretizer, FeatureError, COMPLEXITY_KEY};
pub use grid::{FeatureGrid, InsertOutcome, SampleStrategy};
pub use islands::{Island, IslandSet, MigrationReport};
