//! Per-point covariance estimation for distribution-to-distribution ICP.

use nalgebra::{Matrix3, Point3, SymmetricEigen, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use cloudreg_core::{to_array, PointSource};
use cloudreg_spatial::KdTree;

/// Eigenvalue ratio below which a neighborhood is treated as rank deficient.
const RANK_EPS: f64 = 1e-9;

/// Covariance of a k-NN neighborhood with its eigenvectors sorted by
/// ascending eigenvalue.
pub(crate) struct Neighborhood {
    pub covariance: Matrix3<f64>,
    pub eigenvectors: Matrix3<f64>,
}

impl Neighborhood {
    /// `None` for fewer than three points or rank < 2.
    pub fn analyze(points: &[Point3<f64>]) -> Option<Self> {
        if points.len() < 3 {
            return None;
        }

        let inv_n = 1.0 / points.len() as f64;
        let centroid: Vector3<f64> = points.iter().map(|p| p.coords).sum::<Vector3<f64>>() * inv_n;
        let covariance = points
            .iter()
            .map(|p| {
                let d = p.coords - centroid;
                d * d.transpose()
            })
            .sum::<Matrix3<f64>>()
            * inv_n;

        let eigen = SymmetricEigen::new(covariance);
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));

        if eigen.eigenvalues[order[1]] <= RANK_EPS * eigen.eigenvalues[order[2]] {
            return None;
        }

        let eigenvectors = Matrix3::from_columns(&[
            eigen.eigenvectors.column(order[0]).into_owned(),
            eigen.eigenvectors.column(order[1]).into_owned(),
            eigen.eigenvectors.column(order[2]).into_owned(),
        ]);

        Some(Self {
            covariance,
            eigenvectors,
        })
    }

    /// Unit eigenvector of the smallest eigenvalue.
    pub fn normal(&self) -> Vector3<f64> {
        self.eigenvectors.column(0).into_owned()
    }
}

/// Gather the coordinates of the `k` nearest neighbors of point `i`.
pub(crate) fn knn_points<P: PointSource + ?Sized>(
    cloud: &P,
    tree: &KdTree<3>,
    i: usize,
    k: usize,
) -> Vec<Point3<f64>> {
    tree.knn_search(&to_array(&cloud.point(i)), k)
        .iter()
        .map(|n| Point3::from(tree.points()[n.index]))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CovarianceRegularization {
    /// Keep the neighborhood covariance as is.
    None,
    /// Replace eigenvalues with `(1e-3, 1, 1)`, modelling a locally planar
    /// surface.
    #[default]
    PlaneNormalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CovarianceEstimationParams {
    pub k_neighbors: usize,
    pub num_threads: usize,
    pub regularization: CovarianceRegularization,
}

impl Default for CovarianceEstimationParams {
    fn default() -> Self {
        Self {
            k_neighbors: 10,
            num_threads: 4,
            regularization: CovarianceRegularization::PlaneNormalized,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CovarianceEstimation {
    pub covariances: Vec<Matrix3<f64>>,
    /// `false` where the neighborhood was degenerate and `1e-3 * I` was used.
    pub valid: Vec<bool>,
}

impl CovarianceEstimation {
    pub fn num_valid(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }
}

pub fn estimate_covariances<P: PointSource + ?Sized>(
    cloud: &P,
    params: &CovarianceEstimationParams,
) -> CovarianceEstimation {
    let tree = KdTree::from_cloud(cloud);
    let plane = Matrix3::from_diagonal(&Vector3::new(1e-3, 1.0, 1.0));

    let results: Vec<(Matrix3<f64>, bool)> = cloudreg_core::runtime::install(params.num_threads, || {
        (0..cloud.size())
            .into_par_iter()
            .map(|i| {
                let neighbors = knn_points(cloud, &tree, i, params.k_neighbors);
                match Neighborhood::analyze(&neighbors) {
                    Some(nb) => {
                        let cov = match params.regularization {
                            CovarianceRegularization::None => nb.covariance,
                            CovarianceRegularization::PlaneNormalized => {
                                nb.eigenvectors * plane * nb.eigenvectors.transpose()
                            }
                        };
                        (cov, true)
                    }
                    None => (Matrix3::identity() * 1e-3, false),
                }
            })
            .collect()
    });

    let (covariances, valid): (Vec<_>, Vec<_>) = results.into_iter().unzip();
    let estimation = CovarianceEstimation { covariances, valid };
    tracing::debug!(
        num_points = estimation.valid.len(),
        num_degenerate = estimation.valid.len() - estimation.num_valid(),
        "estimated covariances"
    );
    estimation
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane_points() -> Vec<Point3<f64>> {
        let mut points = Vec::new();
        for i in 0..6 {
            for j in 0..6 {
                points.push(Point3::new(i as f64 * 0.5, j as f64 * 0.5, 2.0));
            }
        }
        points
    }

    #[test]
    fn test_plane_normalized_covariance() {
        let estimation = estimate_covariances(&plane_points(), &CovarianceEstimationParams::default());
        assert_eq!(estimation.num_valid(), 36);
        for cov in &estimation.covariances {
            // Small variance along the plane normal, unit variance in the plane
            assert!((cov[(2, 2)] - 1e-3).abs() < 1e-9);
            assert!((cov[(0, 0)] - 1.0).abs() < 1e-9);
            assert!((cov[(1, 1)] - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_degenerate_neighborhood() {
        // Collinear points have rank 1
        let points: Vec<_> = (0..10).map(|i| Point3::new(i as f64, 0.0, 0.0)).collect();
        let estimation = estimate_covariances(&points, &CovarianceEstimationParams::default());
        assert_eq!(estimation.num_valid(), 0);
        assert_eq!(estimation.covariances[0], Matrix3::identity() * 1e-3);
    }

    #[test]
    fn test_raw_covariance() {
        let params = CovarianceEstimationParams {
            regularization: CovarianceRegularization::None,
            ..Default::default()
        };
        let estimation = estimate_covariances(&plane_points(), &params);
        for cov in &estimation.covariances {
            assert!(cov[(2, 2)].abs() < 1e-12);
            assert!(cov[(0, 0)] > 0.0);
        }
    }
}
