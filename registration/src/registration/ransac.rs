//! RANSAC global registration on feature correspondences.
//!
//! Iterations are grouped into fixed batches, each with its own RNG seeded up
//! front from the caller's generator, and batches are evaluated in parallel
//! rounds. Hypotheses are combined by inlier count with ties going to the
//! lowest iteration number, so the result depends only on the seed.

use nalgebra::{Isometry3, Point3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use cloudreg_core::{umeyama, Error, PointSource, Result};
use cloudreg_spatial::{NearestNeighborSearch, OccupancyGrid};

use super::correspondences::{find_correspondences, Correspondence};
use super::{consistent_correspondences, edges_similar, fit_correspondences, validate_features, RegistrationResult};

/// Iterations per independently seeded batch.
const BATCH_SIZE: usize = 64;
/// Batches evaluated in parallel before each early-stop check.
const BATCHES_PER_ROUND: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacParams {
    pub max_iterations: usize,
    /// Stop once this fraction of source points are inliers.
    pub early_stop_inlier_rate: f64,
    /// Voxel size of the occupancy grid used to count inliers.
    pub inlier_voxel_resolution: f64,
    /// Minimum edge-length ratio between sampled source and target triangles.
    pub poly_thresh: f64,
    pub reciprocal_check: bool,
    pub num_threads: usize,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iterations: 5000,
            early_stop_inlier_rate: 0.9,
            inlier_voxel_resolution: 1.0,
            poly_thresh: 0.9,
            reciprocal_check: false,
            num_threads: 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Hypothesis {
    transformation: Isometry3<f64>,
    num_inliers: usize,
    iteration: usize,
}

impl Hypothesis {
    fn better_than(&self, other: &Self) -> bool {
        self.num_inliers > other.num_inliers
            || (self.num_inliers == other.num_inliers && self.iteration < other.iteration)
    }
}

/// Estimate `T_target_source` with RANSAC over feature correspondences.
///
/// # Arguments
///
/// * `target`, `source` - Point clouds
/// * `target_features`, `source_features` - One descriptor per point
/// * `target_feature_index` - Nearest-neighbor index over `target_features`
/// * `source_feature_index` - Index over `source_features`, needed when
///   `params.reciprocal_check` is set
/// * `rng` - Seeds every batch; the result is reproducible for a given seed
///
/// # Errors
///
/// Feature slices whose length differs from their cloud, or a reciprocal
/// check without a source feature index.
#[allow(clippy::too_many_arguments)]
pub fn estimate_pose_ransac<P, Q, R, const D: usize>(
    target: &P,
    source: &Q,
    target_features: &[[f64; D]],
    source_features: &[[f64; D]],
    target_feature_index: &dyn NearestNeighborSearch<D>,
    source_feature_index: Option<&dyn NearestNeighborSearch<D>>,
    params: &RansacParams,
    rng: &mut R,
) -> Result<RegistrationResult>
where
    P: PointSource + ?Sized,
    Q: PointSource + ?Sized,
    R: Rng + ?Sized,
{
    validate_features(target, source, target_features, source_features)?;
    if !(params.inlier_voxel_resolution > 0.0) {
        return Err(Error::InvalidInput(format!(
            "inlier_voxel_resolution must be positive, got {}",
            params.inlier_voxel_resolution
        )));
    }

    let pool = find_correspondences(
        target_features,
        source_features,
        target_feature_index,
        source_feature_index,
        params.reciprocal_check,
        params.num_threads,
    )?;
    let grid = OccupancyGrid::from_cloud(target, params.inlier_voxel_resolution);

    if pool.len() < 3 {
        tracing::debug!(pool_size = pool.len(), "too few correspondences for RANSAC");
        return Ok(RegistrationResult::scored(Isometry3::identity(), &grid, source, Vec::new()));
    }

    let num_batches = params.max_iterations.div_ceil(BATCH_SIZE);
    let seeds: Vec<u64> = (0..num_batches).map(|_| rng.gen()).collect();
    let early_stop_inliers = (params.early_stop_inlier_rate * source.size() as f64).ceil() as usize;

    let mut best: Option<Hypothesis> = None;
    for (round, round_seeds) in seeds.chunks(BATCHES_PER_ROUND).enumerate() {
        let first_batch = round * BATCHES_PER_ROUND;
        let batch_results: Vec<Option<Hypothesis>> = cloudreg_core::runtime::install(params.num_threads, || {
            round_seeds
                .par_iter()
                .enumerate()
                .map(|(offset, &seed)| {
                    let batch = first_batch + offset;
                    let begin = batch * BATCH_SIZE;
                    let end = (begin + BATCH_SIZE).min(params.max_iterations);
                    run_batch(target, source, &pool, &grid, params, seed, begin..end)
                })
                .collect()
        });

        for hypothesis in batch_results.into_iter().flatten() {
            if best.as_ref().map_or(true, |b| hypothesis.better_than(b)) {
                best = Some(hypothesis);
            }
        }

        tracing::debug!(
            round,
            best_inliers = best.map_or(0, |b| b.num_inliers),
            "RANSAC round finished"
        );
        if best.is_some_and(|b| b.num_inliers >= early_stop_inliers) {
            break;
        }
    }

    let Some(best) = best else {
        tracing::debug!(pool_size = pool.len(), "no valid RANSAC hypothesis");
        return Ok(RegistrationResult::scored(Isometry3::identity(), &grid, source, Vec::new()));
    };

    // Refit on every pool correspondence consistent with the best hypothesis
    let resolution = params.inlier_voxel_resolution;
    let mut transformation = best.transformation;
    let mut inliers = consistent_correspondences(target, source, &pool, &transformation, resolution);
    if let Some(refined) = fit_correspondences(target, source, &inliers, None) {
        if grid.count_inliers(source, &refined) >= best.num_inliers {
            transformation = refined;
            inliers = consistent_correspondences(target, source, &pool, &transformation, resolution);
        }
    }

    let result = RegistrationResult::scored(transformation, &grid, source, inliers);
    tracing::debug!(
        pool_size = pool.len(),
        iteration = best.iteration,
        num_inliers = result.num_inliers,
        inlier_rate = result.inlier_rate,
        "RANSAC finished"
    );
    Ok(result)
}

fn run_batch<P, Q>(
    target: &P,
    source: &Q,
    pool: &[Correspondence],
    grid: &OccupancyGrid,
    params: &RansacParams,
    seed: u64,
    iterations: std::ops::Range<usize>,
) -> Option<Hypothesis>
where
    P: PointSource + ?Sized,
    Q: PointSource + ?Sized,
{
    let mut rng = StdRng::seed_from_u64(seed);
    let mut best: Option<Hypothesis> = None;

    for iteration in iterations {
        let sample = rand::seq::index::sample(&mut rng, pool.len(), 3);
        let picked = [pool[sample.index(0)], pool[sample.index(1)], pool[sample.index(2)]];
        let src: [Point3<f64>; 3] = picked.map(|c| source.point(c.source));
        let tgt: [Point3<f64>; 3] = picked.map(|c| target.point(c.target));

        if !edges_similar(&src, &tgt, params.poly_thresh) || is_degenerate(&src) {
            continue;
        }
        let Some(transformation) = umeyama(&src, &tgt, None) else {
            continue;
        };

        let hypothesis = Hypothesis {
            transformation,
            num_inliers: grid.count_inliers(source, &transformation),
            iteration,
        };
        if best.as_ref().map_or(true, |b| hypothesis.better_than(b)) {
            best = Some(hypothesis);
        }
    }

    best
}

/// Nearly collinear triangles do not determine a rotation.
fn is_degenerate(triangle: &[Point3<f64>; 3]) -> bool {
    let e1 = triangle[1] - triangle[0];
    let e2 = triangle[2] - triangle[0];
    e1.cross(&e2).norm() <= 1e-6 * e1.norm() * e2.norm()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate_triangle() {
        let line = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        ];
        assert!(is_degenerate(&line));

        let tri = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        assert!(!is_degenerate(&tri));
    }

    #[test]
    fn test_tie_prefers_earlier_iteration() {
        let a = Hypothesis {
            transformation: Isometry3::identity(),
            num_inliers: 10,
            iteration: 3,
        };
        let b = Hypothesis { iteration: 7, ..a };
        assert!(a.better_than(&b));
        assert!(!b.better_than(&a));
        let c = Hypothesis { num_inliers: 11, iteration: 9, ..a };
        assert!(c.better_than(&a));
    }
}
