//! Nearest-neighbor search structures
//!
//! Implements:
//! - [`KdTree`] for exact k-nearest-neighbor and radius queries
//! - [`MultiProbeLsh`] for approximate search over high-dimensional descriptors
//! - [`OccupancyGrid`] and [`VoxelNeighborIndex`] for voxel hashing

pub mod kdtree;
pub mod lsh;
pub mod voxel;

pub use kdtree::{brute_force_knn, KdTree};
pub use lsh::{LshParams, MultiProbeLsh};
pub use voxel::{OccupancyGrid, VoxelNeighborIndex};

use rayon::prelude::*;
use std::cmp::Ordering;

/// A single search hit: index into the indexed set and squared distance to
/// the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub sq_dist: f64,
}

impl Neighbor {
    pub fn new(index: usize, sq_dist: f64) -> Self {
        Self { index, sq_dist }
    }

    /// Total order used for every result list: ascending distance, then
    /// ascending index.
    pub fn rank(&self, other: &Self) -> Ordering {
        self.sq_dist
            .total_cmp(&other.sq_dist)
            .then(self.index.cmp(&other.index))
    }
}

/// Heap entry ordered by [`Neighbor::rank`], so a `BinaryHeap` keeps the
/// worst of the current k best on top.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ranked(pub Neighbor);

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.rank(&other.0)
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

/// Common query interface over the exact, approximate and voxel indices.
///
/// Implementations are read-only after construction and may be queried from
/// many threads at once.
pub trait NearestNeighborSearch<const D: usize>: Send + Sync {
    /// Up to `k` neighbors sorted by [`Neighbor::rank`]. Returning fewer than
    /// `k` results is not an error.
    fn knn_search(&self, query: &[f64; D], k: usize) -> Vec<Neighbor>;

    fn nearest(&self, query: &[f64; D]) -> Option<Neighbor> {
        self.knn_search(query, 1).into_iter().next()
    }
}

/// Run `knn_search` for every query in parallel.
pub fn batch_knn_search<S, const D: usize>(
    index: &S,
    queries: &[[f64; D]],
    k: usize,
    num_threads: usize,
) -> Vec<Vec<Neighbor>>
where
    S: NearestNeighborSearch<D> + ?Sized,
{
    cloudreg_core::runtime::install(num_threads, || {
        queries
            .par_iter()
            .map(|q| index.knn_search(q, k))
            .collect()
    })
}

#[inline]
pub(crate) fn squared_distance<const D: usize>(a: &[f64; D], b: &[f64; D]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}
