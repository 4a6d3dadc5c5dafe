//! Multi-probe locality sensitive hashing
//!
//! Each table hashes a mean-centered feature to a `num_bits` code whose bit
//! `b` is the sign of its projection on a Gaussian random vector. Queries
//! probe the exact bucket first, then buckets reached by flipping the bits
//! whose projections lie closest to zero (query-directed probing), visiting
//! tables round-robin until the candidate budget is spent. Candidates are
//! ranked by their true distance.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use cloudreg_core::{Error, Result};

use crate::{squared_distance, NearestNeighborSearch, Neighbor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LshParams {
    /// Number of independent hash tables (L).
    pub num_tables: usize,
    /// Code length per table (B), at most 64.
    pub num_bits: usize,
    /// Largest number of bits flipped in a single probe.
    pub max_hamming_radius: usize,
    /// Probes per table, including the exact bucket.
    pub num_probes: usize,
    /// Distinct candidates collected before ranking.
    pub max_candidates: usize,
    pub num_threads: usize,
}

impl Default for LshParams {
    fn default() -> Self {
        Self {
            num_tables: 8,
            num_bits: 12,
            max_hamming_radius: 2,
            num_probes: 16,
            max_candidates: 2048,
            num_threads: 1,
        }
    }
}

struct HashTable<const D: usize> {
    projections: Vec<[f64; D]>,
    buckets: HashMap<u64, Vec<usize>>,
}

impl<const D: usize> HashTable<D> {
    fn project(&self, centered: &[f64; D]) -> impl Iterator<Item = f64> + '_ {
        let centered = *centered;
        self.projections
            .iter()
            .map(move |proj| proj.iter().zip(centered.iter()).map(|(a, b)| a * b).sum())
    }

    fn code(&self, centered: &[f64; D]) -> u64 {
        self.project(centered)
            .enumerate()
            .fold(0u64, |code, (b, v)| if v >= 0.0 { code | (1 << b) } else { code })
    }

    /// Bucket codes to visit for `centered`, best first.
    fn probe_sequence(&self, centered: &[f64; D], max_radius: usize, num_probes: usize) -> Vec<u64> {
        let projections: Vec<f64> = self.project(centered).collect();
        let code = projections
            .iter()
            .enumerate()
            .fold(0u64, |code, (b, &v)| if v >= 0.0 { code | (1 << b) } else { code });

        let mut probes = Vec::with_capacity(num_probes);
        probes.push(code);
        let num_bits = projections.len();
        if max_radius == 0 || num_probes <= 1 || num_bits == 0 {
            return probes;
        }

        // Flipping bit b costs its squared projection; enumerate flip sets in
        // ascending total cost over bits sorted by cost.
        let mut order: Vec<usize> = (0..num_bits).collect();
        order.sort_by(|&a, &b| {
            let ca = projections[a] * projections[a];
            let cb = projections[b] * projections[b];
            ca.total_cmp(&cb).then(a.cmp(&b))
        });
        let costs: Vec<f64> = order.iter().map(|&b| projections[b] * projections[b]).collect();

        let mut heap = BinaryHeap::new();
        heap.push(FlipSet::new(vec![0], &costs));
        while probes.len() < num_probes {
            let Some(set) = heap.pop() else {
                break;
            };

            let last = set.positions[set.positions.len() - 1];
            if last + 1 < num_bits {
                let mut shifted = set.positions.clone();
                let tail = shifted.len() - 1;
                shifted[tail] = last + 1;
                heap.push(FlipSet::new(shifted, &costs));

                if set.positions.len() < max_radius {
                    let mut expanded = set.positions.clone();
                    expanded.push(last + 1);
                    heap.push(FlipSet::new(expanded, &costs));
                }
            }

            let flipped = set
                .positions
                .iter()
                .fold(code, |c, &j| c ^ (1u64 << order[j]));
            probes.push(flipped);
        }

        probes
    }
}

/// A set of positions into the cost-sorted bit order, min-ordered by cost.
struct FlipSet {
    cost: f64,
    positions: Vec<usize>,
}

impl FlipSet {
    fn new(positions: Vec<usize>, costs: &[f64]) -> Self {
        let cost = positions.iter().map(|&j| costs[j]).sum();
        Self { cost, positions }
    }
}

impl Ord for FlipSet {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.positions.cmp(&self.positions))
    }
}

impl PartialOrd for FlipSet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FlipSet {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FlipSet {}

/// Approximate nearest-neighbor index over `D`-dimensional feature vectors.
pub struct MultiProbeLsh<const D: usize> {
    features: Vec<[f64; D]>,
    mean: [f64; D],
    tables: Vec<HashTable<D>>,
    params: LshParams,
}

impl<const D: usize> MultiProbeLsh<D> {
    /// Build the hash tables over a copy of `features`.
    ///
    /// Projection vectors are drawn from `rng` table by table, so the index is
    /// reproducible for a given seed regardless of `num_threads`.
    pub fn create_tables<R: Rng + ?Sized>(
        features: &[[f64; D]],
        params: &LshParams,
        rng: &mut R,
    ) -> Result<Self> {
        if params.num_tables == 0 {
            return Err(Error::InvalidInput("num_tables must be >= 1".into()));
        }
        if params.num_bits == 0 || params.num_bits > 64 {
            return Err(Error::InvalidInput(format!(
                "num_bits must be in 1..=64, got {}",
                params.num_bits
            )));
        }

        let mut mean = [0.0; D];
        if !features.is_empty() {
            for f in features {
                for d in 0..D {
                    mean[d] += f[d];
                }
            }
            let n = features.len() as f64;
            mean.iter_mut().for_each(|m| *m /= n);
        }

        let mut tables: Vec<HashTable<D>> = (0..params.num_tables)
            .map(|_| {
                let projections = (0..params.num_bits)
                    .map(|_| std::array::from_fn(|_| rng.sample(StandardNormal)))
                    .collect();
                HashTable {
                    projections,
                    buckets: HashMap::new(),
                }
            })
            .collect();

        let centered: Vec<[f64; D]> = features
            .iter()
            .map(|f| std::array::from_fn(|d| f[d] - mean[d]))
            .collect();

        cloudreg_core::runtime::install(params.num_threads, || {
            tables.par_iter_mut().for_each(|table| {
                let mut buckets: HashMap<u64, Vec<usize>> = HashMap::new();
                for (i, c) in centered.iter().enumerate() {
                    buckets.entry(table.code(c)).or_default().push(i);
                }
                table.buckets = buckets;
            });
        });

        tracing::debug!(
            num_features = features.len(),
            num_tables = params.num_tables,
            num_bits = params.num_bits,
            "built multi-probe LSH tables"
        );

        Ok(Self {
            features: features.to_vec(),
            mean,
            tables,
            params: *params,
        })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn params(&self) -> &LshParams {
        &self.params
    }

    /// Approximate `k` nearest features, sorted by `(sq_dist, index)`.
    pub fn knn_search(&self, query: &[f64; D], k: usize) -> Vec<Neighbor> {
        if k == 0 || self.features.is_empty() {
            return Vec::new();
        }

        let centered: [f64; D] = std::array::from_fn(|d| query[d] - self.mean[d]);
        let num_probes = self.params.num_probes.max(1);
        let probe_lists: Vec<Vec<u64>> = self
            .tables
            .iter()
            .map(|t| t.probe_sequence(&centered, self.params.max_hamming_radius, num_probes))
            .collect();

        let max_candidates = self.params.max_candidates.max(k);
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        'probing: for round in 0..num_probes {
            for (table, probes) in self.tables.iter().zip(&probe_lists) {
                let Some(bucket) = probes.get(round).and_then(|code| table.buckets.get(code)) else {
                    continue;
                };
                for &i in bucket {
                    if seen.insert(i) {
                        candidates.push(Neighbor::new(i, squared_distance(&self.features[i], query)));
                        if candidates.len() >= max_candidates {
                            break 'probing;
                        }
                    }
                }
            }
        }

        candidates.sort_by(|a, b| a.rank(b));
        candidates.truncate(k);
        candidates
    }
}

impl<const D: usize> NearestNeighborSearch<D> for MultiProbeLsh<D> {
    fn knn_search(&self, query: &[f64; D], k: usize) -> Vec<Neighbor> {
        MultiProbeLsh::knn_search(self, query, k)
    }
}
