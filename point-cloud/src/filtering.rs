use nalgebra::{Matrix3, Point3, Vector3};
use rayon::prelude::*;

use cloudreg_core::{PointCloud, Result};

/// Downsample a point cloud with a voxel grid.
///
/// Returns a new cloud with one point per occupied voxel (the centroid).
/// Normals are averaged and renormalized; covariances and times are
/// averaged; features are dropped. A non-positive or NaN voxel size returns a clone.
pub fn voxelgrid_sampling(cloud: &PointCloud, voxel_size: f64) -> Result<PointCloud> {
    if voxel_size.is_nan() || voxel_size <= 0.0 || cloud.is_empty() {
        return Ok(cloud.clone());
    }

    let n = cloud.len();
    let inv_size = 1.0 / voxel_size;

    // 1. Compute voxel keys
    let mut keys: Vec<(i64, i64, i64, usize)> = cloud
        .points()
        .iter()
        .enumerate()
        .map(|(i, p)| {
            (
                (p.x * inv_size).floor() as i64,
                (p.y * inv_size).floor() as i64,
                (p.z * inv_size).floor() as i64,
                i,
            )
        })
        .collect();

    // 2. Sort by voxel key; the point index keeps the order total
    if n > 10000 {
        keys.par_sort_unstable();
    } else {
        keys.sort_unstable();
    }

    // 3. Aggregate runs of equal keys
    let normals = cloud.normals();
    let covariances = cloud.covariances();
    let times = cloud.times();

    let mut new_points = Vec::new();
    let mut new_normals = normals.map(|_| Vec::new());
    let mut new_covariances = covariances.map(|_| Vec::new());
    let mut new_times = times.map(|_| Vec::new());

    let mut start = 0;
    while start < keys.len() {
        let voxel = (keys[start].0, keys[start].1, keys[start].2);
        let mut end = start;
        while end < keys.len() && (keys[end].0, keys[end].1, keys[end].2) == voxel {
            end += 1;
        }
        let members = &keys[start..end];
        let inv_count = 1.0 / members.len() as f64;

        let sum_p: Vector3<f64> = members.iter().map(|m| cloud.points()[m.3].coords).sum();
        new_points.push(Point3::from(sum_p * inv_count));

        if let (Some(src), Some(dst)) = (normals, new_normals.as_mut()) {
            let sum_n: Vector3<f64> = members.iter().map(|m| src[m.3]).sum();
            dst.push(sum_n.try_normalize(1e-12).unwrap_or_else(Vector3::zeros));
        }
        if let (Some(src), Some(dst)) = (covariances, new_covariances.as_mut()) {
            let sum_c: Matrix3<f64> = members.iter().map(|m| src[m.3]).sum();
            dst.push(sum_c * inv_count);
        }
        if let (Some(src), Some(dst)) = (times, new_times.as_mut()) {
            let sum_t: f64 = members.iter().map(|m| src[m.3]).sum();
            dst.push(sum_t * inv_count);
        }

        start = end;
    }

    tracing::debug!(
        input = n,
        output = new_points.len(),
        voxel_size,
        "voxelgrid sampling"
    );

    let mut downsampled = PointCloud::new(new_points);
    if let Some(normals) = new_normals {
        downsampled = downsampled.with_normals(normals)?;
    }
    if let Some(covariances) = new_covariances {
        downsampled = downsampled.with_covariances(covariances)?;
    }
    if let Some(times) = new_times {
        downsampled = downsampled.with_times(times)?;
    }
    Ok(downsampled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voxelgrid_sampling() {
        // Points in a 0.1x0.1 patch
        let mut points = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                points.push(Point3::new(i as f64 * 0.01, j as f64 * 0.01, 0.0));
            }
        }
        let pc = PointCloud::new(points);

        let down = voxelgrid_sampling(&pc, 0.2).unwrap();
        assert_eq!(down.len(), 1);
        assert!((down.points()[0] - Point3::new(0.045, 0.045, 0.0)).norm() < 1e-12);

        // 0.00..0.04 -> bin 0, 0.05..0.09 -> bin 1, in x and y
        let down = voxelgrid_sampling(&pc, 0.05).unwrap();
        assert_eq!(down.len(), 4);
    }

    #[test]
    fn test_voxelgrid_sampling_averages_attributes() {
        let pc = PointCloud::new(vec![
            Point3::new(0.1, 0.1, 0.1),
            Point3::new(0.3, 0.1, 0.1),
            Point3::new(5.0, 5.0, 5.0),
        ])
        .with_normals(vec![Vector3::x(), Vector3::y(), Vector3::z()])
        .and_then(|c| c.with_times(vec![0.0, 1.0, 0.5]))
        .and_then(|c| c.with_features(vec![[1.0; 33]; 3]))
        .unwrap();

        let down = voxelgrid_sampling(&pc, 1.0).unwrap();
        assert_eq!(down.len(), 2);
        assert!(down.features().is_none());

        let times = down.times().unwrap();
        assert_eq!(times, &[0.5, 0.5]);

        let n = down.normals().unwrap()[0];
        let expected = Vector3::new(1.0, 1.0, 0.0).normalize();
        assert!((n - expected).norm() < 1e-12);
    }

    #[test]
    fn test_non_positive_voxel_size_clones() {
        let pc = PointCloud::new(vec![Point3::origin(), Point3::new(0.01, 0.0, 0.0)]);
        assert_eq!(voxelgrid_sampling(&pc, 0.0).unwrap(), pc);
        assert_eq!(voxelgrid_sampling(&pc, -1.0).unwrap(), pc);
        assert_eq!(voxelgrid_sampling(&pc, f64::NAN).unwrap(), pc);
    }
}
