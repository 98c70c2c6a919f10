//! UI hierarchy: normalized tree, acquisition and caching.

pub mod acquirer;
pub mod cache;
pub mod node;

pub use acquirer::{AcquireOptions, BREAKER_THRESHOLD, HierarchyAcquirer, TreeSnapshot};
pub use cache::{CachedTree, HierarchyCache};
pub use node::{Bounds, UiNode, parse_bounds, screen_hash};
