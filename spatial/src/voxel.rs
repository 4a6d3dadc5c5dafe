//! Voxel hashing structures
//!
//! - [`OccupancyGrid`]: set of occupied voxels, used to score pose hypotheses
//! - [`VoxelNeighborIndex`]: point indices bucketed per voxel, answering
//!   nearest-neighbor queries from the 27 surrounding voxels

use std::collections::{HashMap, HashSet};

use nalgebra::{Isometry3, Point3};

use cloudreg_core::PointSource;

use crate::{squared_distance, NearestNeighborSearch, Neighbor};

pub type VoxelKey = (i64, i64, i64);

#[inline]
fn voxel_key(point: &Point3<f64>, inv_resolution: f64) -> VoxelKey {
    (
        (point.x * inv_resolution).floor() as i64,
        (point.y * inv_resolution).floor() as i64,
        (point.z * inv_resolution).floor() as i64,
    )
}

/// Hashed set of occupied voxels at a fixed resolution.
#[derive(Debug, Clone)]
pub struct OccupancyGrid {
    resolution: f64,
    inv_resolution: f64,
    occupied: HashSet<VoxelKey>,
}

impl OccupancyGrid {
    /// Non-positive or non-finite resolutions fall back to 1.0.
    pub fn new(resolution: f64) -> Self {
        let resolution = if resolution.is_finite() && resolution > 0.0 {
            resolution
        } else {
            tracing::warn!(resolution, "invalid occupancy grid resolution, using 1.0");
            1.0
        };
        Self {
            resolution,
            inv_resolution: 1.0 / resolution,
            occupied: HashSet::new(),
        }
    }

    pub fn from_cloud<P: PointSource + ?Sized>(cloud: &P, resolution: f64) -> Self {
        let mut grid = Self::new(resolution);
        grid.insert_points(cloud);
        grid
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn num_occupied(&self) -> usize {
        self.occupied.len()
    }

    pub fn insert_points<P: PointSource + ?Sized>(&mut self, cloud: &P) {
        for i in 0..cloud.size() {
            self.occupied.insert(voxel_key(&cloud.point(i), self.inv_resolution));
        }
    }

    pub fn is_occupied(&self, point: &Point3<f64>) -> bool {
        self.occupied.contains(&voxel_key(point, self.inv_resolution))
    }

    /// Number of `transform * p` landing in an occupied voxel.
    pub fn count_inliers<P: PointSource + ?Sized>(&self, points: &P, transform: &Isometry3<f64>) -> usize {
        (0..points.size())
            .filter(|&i| self.is_occupied(&(transform * points.point(i))))
            .count()
    }

    /// Fraction of `transform * p` landing in an occupied voxel; 0 for an
    /// empty point set.
    pub fn overlap_rate<P: PointSource + ?Sized>(&self, points: &P, transform: &Isometry3<f64>) -> f64 {
        if points.is_empty() {
            return 0.0;
        }
        self.count_inliers(points, transform) as f64 / points.size() as f64
    }
}

/// Nearest-neighbor index over voxel buckets.
///
/// Exact for neighbors closer than one voxel; farther points are only found
/// when they fall inside the 3x3x3 block around the query.
#[derive(Debug, Clone)]
pub struct VoxelNeighborIndex {
    inv_resolution: f64,
    points: Vec<[f64; 3]>,
    buckets: HashMap<VoxelKey, Vec<usize>>,
}

impl VoxelNeighborIndex {
    pub fn from_cloud<P: PointSource + ?Sized>(cloud: &P, resolution: f64) -> Self {
        let resolution = if resolution.is_finite() && resolution > 0.0 {
            resolution
        } else {
            1.0
        };
        let inv_resolution = 1.0 / resolution;

        let mut points = Vec::with_capacity(cloud.size());
        let mut buckets: HashMap<VoxelKey, Vec<usize>> = HashMap::new();
        for i in 0..cloud.size() {
            let p = cloud.point(i);
            buckets.entry(voxel_key(&p, inv_resolution)).or_default().push(i);
            points.push(cloudreg_core::to_array(&p));
        }

        tracing::debug!(
            num_points = points.len(),
            num_voxels = buckets.len(),
            "built voxel neighbor index"
        );

        Self {
            inv_resolution,
            points,
            buckets,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl NearestNeighborSearch<3> for VoxelNeighborIndex {
    fn knn_search(&self, query: &[f64; 3], k: usize) -> Vec<Neighbor> {
        if k == 0 {
            return Vec::new();
        }

        let center = voxel_key(&Point3::from(*query), self.inv_resolution);
        let mut candidates = Vec::new();
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let key = (center.0 + dx, center.1 + dy, center.2 + dz);
                    if let Some(bucket) = self.buckets.get(&key) {
                        candidates.extend(
                            bucket
                                .iter()
                                .map(|&i| Neighbor::new(i, squared_distance(&self.points[i], query))),
                        );
                    }
                }
            }
        }

        candidates.sort_by(|a, b| a.rank(b));
        candidates.truncate(k);
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn test_occupancy_overlap() {
        let target = vec![
            Point3::new(0.1, 0.1, 0.1),
            Point3::new(1.5, 0.2, 0.3),
            Point3::new(-0.5, 2.5, 0.0),
        ];
        let grid = OccupancyGrid::from_cloud(&target, 1.0);
        assert_eq!(grid.num_occupied(), 3);
        assert!(grid.is_occupied(&Point3::new(0.9, 0.9, 0.9)));
        assert!(!grid.is_occupied(&Point3::new(-0.1, 0.5, 0.5)));

        let identity = Isometry3::identity();
        assert_eq!(grid.overlap_rate(&target, &identity), 1.0);

        let far = Isometry3::translation(100.0, 0.0, 0.0);
        assert_eq!(grid.overlap_rate(&target, &far), 0.0);

        let empty: Vec<Point3<f64>> = Vec::new();
        assert_eq!(grid.overlap_rate(&empty, &identity), 0.0);
    }

    #[test]
    fn test_voxel_neighbor_index_matches_close_points() {
        let points: Vec<_> = (0..50)
            .map(|i| Point3::from(Vector3::new(i as f64 * 0.3, (i % 7) as f64 * 0.2, 0.0)))
            .collect();
        let index = VoxelNeighborIndex::from_cloud(&points, 1.0);
        assert_eq!(index.len(), 50);

        for (i, p) in points.iter().enumerate() {
            let nn = index.nearest(&cloudreg_core::to_array(p)).unwrap();
            assert_eq!(nn.index, i);
            assert_eq!(nn.sq_dist, 0.0);
        }

        assert!(index.knn_search(&[100.0, 100.0, 100.0], 3).is_empty());
    }
}
