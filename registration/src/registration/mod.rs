//! Feature-based global registration
//!
//! Implements:
//! - Feature correspondence search with optional reciprocal check
//! - RANSAC over correspondence triplets
//! - GNC (Graduated Non-Convexity) robust registration
//!
//! Both estimators score hypotheses with an occupancy grid over the target
//! and never fail on statistically poor data: they return the best transform
//! found together with an honest inlier rate.

pub mod correspondences;
pub mod gnc;
pub mod ransac;

pub use correspondences::{find_correspondences, Correspondence};
pub use gnc::{estimate_pose_gnc, GncParams};
pub use ransac::{estimate_pose_ransac, RansacParams};

use nalgebra::{Isometry3, Point3};

use cloudreg_core::{ensure_len, umeyama, PointSource, Result};
use cloudreg_spatial::OccupancyGrid;

/// Outcome of a global registration.
///
/// # Fields
///
/// * `transformation` - `T_target_source`, mapping source points into the target frame
/// * `inlier_rate` - Fraction of source points landing in an occupied target voxel
/// * `num_inliers` - Number of such source points
/// * `correspondences` - Feature correspondences consistent with `transformation`
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationResult {
    pub transformation: Isometry3<f64>,
    pub inlier_rate: f64,
    pub num_inliers: usize,
    pub correspondences: Vec<Correspondence>,
}

impl RegistrationResult {
    /// Score `transformation` against `grid` and package it.
    pub(crate) fn scored<P: PointSource + ?Sized>(
        transformation: Isometry3<f64>,
        grid: &OccupancyGrid,
        source: &P,
        correspondences: Vec<Correspondence>,
    ) -> Self {
        let num_inliers = grid.count_inliers(source, &transformation);
        let inlier_rate = if source.is_empty() {
            0.0
        } else {
            num_inliers as f64 / source.size() as f64
        };
        Self {
            transformation,
            inlier_rate,
            num_inliers,
            correspondences,
        }
    }
}

/// Check that each feature slice matches its cloud.
pub(crate) fn validate_features<P, Q, const D: usize>(
    target: &P,
    source: &Q,
    target_features: &[[f64; D]],
    source_features: &[[f64; D]],
) -> Result<()>
where
    P: PointSource + ?Sized,
    Q: PointSource + ?Sized,
{
    ensure_len("target features", target.size(), target_features.len())?;
    ensure_len("source features", source.size(), source_features.len())
}

/// Rigid fit on the given correspondences, optionally weighted.
pub(crate) fn fit_correspondences<P, Q>(
    target: &P,
    source: &Q,
    correspondences: &[Correspondence],
    weights: Option<&[f64]>,
) -> Option<Isometry3<f64>>
where
    P: PointSource + ?Sized,
    Q: PointSource + ?Sized,
{
    let (src, tgt): (Vec<Point3<f64>>, Vec<Point3<f64>>) = correspondences
        .iter()
        .map(|c| (source.point(c.source), target.point(c.target)))
        .unzip();
    umeyama(&src, &tgt, weights)
}

/// Correspondences whose source point maps within `max_distance` of its
/// target point under `transformation`.
pub(crate) fn consistent_correspondences<P, Q>(
    target: &P,
    source: &Q,
    correspondences: &[Correspondence],
    transformation: &Isometry3<f64>,
    max_distance: f64,
) -> Vec<Correspondence>
where
    P: PointSource + ?Sized,
    Q: PointSource + ?Sized,
{
    correspondences
        .iter()
        .filter(|c| (transformation * source.point(c.source) - target.point(c.target)).norm() < max_distance)
        .copied()
        .collect()
}

/// Edge-length similarity of two triangles: every ratio `min/max` of
/// corresponding edges must reach `threshold`.
pub(crate) fn edges_similar(a: &[Point3<f64>; 3], b: &[Point3<f64>; 3], threshold: f64) -> bool {
    [(0, 1), (1, 2), (2, 0)].iter().all(|&(i, j)| {
        let la = (a[i] - a[j]).norm();
        let lb = (b[i] - b[j]).norm();
        let longer = la.max(lb);
        longer > 0.0 && la.min(lb) / longer >= threshold
    })
}
