use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use cloudreg_core::PointSource;
use cloudreg_spatial::KdTree;

use crate::covariance::{knn_points, Neighborhood};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalEstimationParams {
    pub k_neighbors: usize,
    pub num_threads: usize,
    /// When set, normals are flipped to face this point.
    pub viewpoint: Option<Point3<f64>>,
}

impl Default for NormalEstimationParams {
    fn default() -> Self {
        Self {
            k_neighbors: 10,
            num_threads: 4,
            viewpoint: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalEstimation {
    /// Unit normals; zero where the neighborhood was degenerate.
    pub normals: Vec<Vector3<f64>>,
    pub valid: Vec<bool>,
}

impl NormalEstimation {
    pub fn num_valid(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }
}

/// Estimate normals using K-nearest neighbors.
/// Uses PCA on the covariance of each neighborhood.
pub fn estimate_normals<P: PointSource + ?Sized>(
    cloud: &P,
    params: &NormalEstimationParams,
) -> NormalEstimation {
    let tree = KdTree::from_cloud(cloud);
    estimate_normals_with_tree(cloud, &tree, params)
}

/// Same as [`estimate_normals`], reusing a tree built over `cloud`.
pub fn estimate_normals_with_tree<P: PointSource + ?Sized>(
    cloud: &P,
    tree: &KdTree<3>,
    params: &NormalEstimationParams,
) -> NormalEstimation {
    let results: Vec<(Vector3<f64>, bool)> = cloudreg_core::runtime::install(params.num_threads, || {
        (0..cloud.size())
            .into_par_iter()
            .map(|i| {
                let neighbors = knn_points(cloud, tree, i, params.k_neighbors);
                let Some(nb) = Neighborhood::analyze(&neighbors) else {
                    return (Vector3::zeros(), false);
                };

                let mut normal = nb.normal();
                if let Some(viewpoint) = params.viewpoint {
                    if normal.dot(&(viewpoint - cloud.point(i))) < 0.0 {
                        normal = -normal;
                    }
                }
                (normal, true)
            })
            .collect()
    });

    let (normals, valid): (Vec<_>, Vec<_>) = results.into_iter().unzip();
    let estimation = NormalEstimation { normals, valid };
    tracing::debug!(
        num_points = estimation.valid.len(),
        num_degenerate = estimation.valid.len() - estimation.num_valid(),
        "estimated normals"
    );
    estimation
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_normals() {
        // Plane at z=0
        let mut points = Vec::new();
        for i in 0..5 {
            for j in 0..5 {
                points.push(Point3::new(i as f64, j as f64, 0.0));
            }
        }
        let params = NormalEstimationParams {
            k_neighbors: 5,
            ..Default::default()
        };
        let estimation = estimate_normals(&points, &params);

        assert_eq!(estimation.num_valid(), 25);
        for n in &estimation.normals {
            assert!(n.z.abs() > 0.999, "Normal {:?} is not vertical", n);
            assert!((n.norm() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_viewpoint_orientation() {
        let mut points = Vec::new();
        for i in 0..4 {
            for j in 0..4 {
                points.push(Point3::new(i as f64, j as f64, 1.0));
            }
        }
        let params = NormalEstimationParams {
            viewpoint: Some(Point3::new(1.5, 1.5, -10.0)),
            ..Default::default()
        };
        let estimation = estimate_normals(&points, &params);
        assert!(estimation.normals.iter().all(|n| n.z < -0.999));
    }

    #[test]
    fn test_degenerate_inputs() {
        let two = vec![Point3::origin(), Point3::new(1.0, 0.0, 0.0)];
        let estimation = estimate_normals(&two, &NormalEstimationParams::default());
        assert_eq!(estimation.valid, vec![false, false]);
        assert!(estimation.normals.iter().all(|n| *n == Vector3::zeros()));

        let line: Vec<_> = (0..8).map(|i| Point3::new(0.0, i as f64, 0.0)).collect();
        let estimation = estimate_normals(&line, &NormalEstimationParams::default());
        assert_eq!(estimation.num_valid(), 0);

        let empty: Vec<Point3<f64>> = Vec::new();
        assert!(estimate_normals(&empty, &NormalEstimationParams::default()).normals.is_empty());
    }
}
