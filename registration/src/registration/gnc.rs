//! Graduated Non-Convexity (GNC) Robust Registration
//!
//! GNC starts from a wide, nearly convex robust kernel and shrinks it step by
//! step, alternating a weighted closed-form rigid fit with a weight update.
//! This lets the estimate escape the local minima a fixed robust kernel
//! would fall into while still rejecting outlier correspondences.
//!
//! Based on "Graduated Non-Convexity for Robust Spatial Perception" by Yang et al.
//! The optional tuple test follows "Fast Global Registration" by Zhou et al.

use std::collections::BTreeSet;

use nalgebra::{Isometry3, Point3, Vector3};
use rand::Rng;
use serde::{Deserialize, Serialize};

use cloudreg_core::{Error, PointSource, Result, RobustLossType};
use cloudreg_spatial::{NearestNeighborSearch, OccupancyGrid};

use super::correspondences::{match_sources, Correspondence};
use super::{consistent_correspondences, edges_similar, fit_correspondences, validate_features, RegistrationResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GncParams {
    /// Source points drawn for matching.
    pub max_init_samples: usize,
    pub reciprocal_check: bool,
    /// Keep only correspondences that form geometrically consistent triplets.
    pub tuple_check: bool,
    pub tuple_thresh: f64,
    pub max_num_tuples: usize,
    /// Divisor applied to the kernel control parameter every outer iteration.
    pub div_factor: f64,
    pub max_iterations: usize,
    pub max_inner_iterations: usize,
    /// Largest weight change at which the inner loop is converged.
    pub tolerance: f64,
    pub inlier_voxel_resolution: f64,
    pub loss: RobustLossType,
    pub num_threads: usize,
    /// Log every outer iteration at info level.
    pub verbose: bool,
}

impl Default for GncParams {
    fn default() -> Self {
        Self {
            max_init_samples: 5000,
            reciprocal_check: true,
            tuple_check: false,
            tuple_thresh: 0.9,
            max_num_tuples: 1000,
            div_factor: 1.4,
            max_iterations: 64,
            max_inner_iterations: 8,
            tolerance: 1e-6,
            inlier_voxel_resolution: 1.0,
            loss: RobustLossType::GemanMcClure,
            num_threads: 4,
            verbose: false,
        }
    }
}

/// Estimate `T_target_source` with graduated non-convexity.
///
/// Arguments are as for [`super::estimate_pose_ransac`]; `rng` draws the
/// matched source samples and, with `tuple_check`, the tested triplets.
#[allow(clippy::too_many_arguments)]
pub fn estimate_pose_gnc<P, Q, R, const D: usize>(
    target: &P,
    source: &Q,
    target_features: &[[f64; D]],
    source_features: &[[f64; D]],
    target_feature_index: &dyn NearestNeighborSearch<D>,
    source_feature_index: Option<&dyn NearestNeighborSearch<D>>,
    params: &GncParams,
    rng: &mut R,
) -> Result<RegistrationResult>
where
    P: PointSource + ?Sized,
    Q: PointSource + ?Sized,
    R: Rng + ?Sized,
{
    validate_features(target, source, target_features, source_features)?;
    if !(params.inlier_voxel_resolution > 0.0) || !(params.div_factor > 1.0) {
        return Err(Error::InvalidInput(format!(
            "GNC needs inlier_voxel_resolution > 0 and div_factor > 1, got {} and {}",
            params.inlier_voxel_resolution, params.div_factor
        )));
    }

    let num_samples = params.max_init_samples.min(source.size());
    let mut samples = rand::seq::index::sample(rng, source.size(), num_samples).into_vec();
    samples.sort_unstable();

    let mut correspondences = match_sources(
        &samples,
        target_features,
        source_features,
        target_feature_index,
        source_feature_index,
        params.reciprocal_check,
        params.num_threads,
    )?;
    if params.tuple_check {
        correspondences = tuple_test(target, source, &correspondences, params, rng);
    }

    let grid = OccupancyGrid::from_cloud(target, params.inlier_voxel_resolution);
    if correspondences.len() < 3 {
        tracing::debug!(
            num_correspondences = correspondences.len(),
            "too few correspondences for GNC"
        );
        return Ok(RegistrationResult::scored(Isometry3::identity(), &grid, source, Vec::new()));
    }

    let src: Vec<Point3<f64>> = correspondences.iter().map(|c| source.point(c.source)).collect();
    let tgt: Vec<Point3<f64>> = correspondences.iter().map(|c| target.point(c.target)).collect();

    let min_mu = params.inlier_voxel_resolution * params.inlier_voxel_resolution;
    let mut mu = bounding_box_diagonal(&tgt).powi(2).max(min_mu);
    let mut loss = params.loss.with_scale(mu.sqrt());

    let mut weights = vec![1.0; correspondences.len()];
    let mut transformation = Isometry3::identity();

    for iteration in 0..params.max_iterations {
        loss.set_scale(mu.sqrt());

        let mut converged = false;
        for _ in 0..params.max_inner_iterations {
            let Some(estimate) = fit_correspondences(target, source, &correspondences, Some(&weights)) else {
                break;
            };
            transformation = estimate;

            let mut max_change: f64 = 0.0;
            for (w, (s, t)) in weights.iter_mut().zip(src.iter().zip(&tgt)) {
                let updated = loss.weight((transformation * s - t).norm());
                max_change = max_change.max((updated - *w).abs());
                *w = updated;
            }
            if max_change < params.tolerance {
                converged = true;
                break;
            }
        }

        if params.verbose {
            let sum_weights: f64 = weights.iter().sum();
            tracing::info!(iteration, mu, sum_weights, converged, "GNC iteration");
        }

        if mu <= min_mu && converged {
            break;
        }
        mu = (mu / params.div_factor).max(min_mu);
    }

    let inliers = consistent_correspondences(
        target,
        source,
        &correspondences,
        &transformation,
        params.inlier_voxel_resolution,
    );
    let result = RegistrationResult::scored(transformation, &grid, source, inliers);
    tracing::debug!(
        num_correspondences = correspondences.len(),
        num_inliers = result.num_inliers,
        inlier_rate = result.inlier_rate,
        "GNC finished"
    );
    Ok(result)
}

fn bounding_box_diagonal(points: &[Point3<f64>]) -> f64 {
    let Some(first) = points.first() else {
        return 0.0;
    };
    let (min, max) = points.iter().fold((first.coords, first.coords), |(lo, hi), p| {
        (lo.inf(&p.coords), hi.sup(&p.coords))
    });
    let extent: Vector3<f64> = max - min;
    extent.norm()
}

/// Keep correspondences that take part in at least one triplet whose source
/// and target edge lengths agree within `tuple_thresh`.
fn tuple_test<P, Q, R>(
    target: &P,
    source: &Q,
    correspondences: &[Correspondence],
    params: &GncParams,
    rng: &mut R,
) -> Vec<Correspondence>
where
    P: PointSource + ?Sized,
    Q: PointSource + ?Sized,
    R: Rng + ?Sized,
{
    let n = correspondences.len();
    if n < 3 {
        return correspondences.to_vec();
    }

    let mut kept = BTreeSet::new();
    let mut num_tuples = 0;
    let max_trials = n * 100;
    for _ in 0..max_trials {
        if num_tuples >= params.max_num_tuples {
            break;
        }
        let sample = rand::seq::index::sample(rng, n, 3);
        let ids = [sample.index(0), sample.index(1), sample.index(2)];
        let src = ids.map(|i| source.point(correspondences[i].source));
        let tgt = ids.map(|i| target.point(correspondences[i].target));
        if edges_similar(&src, &tgt, params.tuple_thresh) {
            kept.extend(ids);
            num_tuples += 1;
        }
    }

    tracing::debug!(
        num_correspondences = n,
        num_tuples,
        num_kept = kept.len(),
        "tuple test"
    );
    kept.into_iter().map(|i| correspondences[i]).collect()
}
