use nalgebra::{Matrix3, Point3, Vector3};

use crate::{ensure_len, Result};

/// Number of bins in an FPFH signature (3 channels x 11 bins).
pub const FPFH_DIM: usize = 33;

/// Fast point feature histogram of a single point.
pub type FpfhSignature = [f64; FPFH_DIM];

/// Read access to a point set and whichever per-point attributes it carries.
///
/// Indices, descriptor estimators and alignment factors are written against
/// this trait so they work on owned clouds as well as on plain point slices or
/// any other backing that can answer these queries.
pub trait PointSource: Sync {
    fn size(&self) -> usize;

    /// Panics if `i >= self.size()`.
    fn point(&self, i: usize) -> Point3<f64>;

    fn has_normals(&self) -> bool {
        false
    }

    fn normal(&self, _i: usize) -> Option<Vector3<f64>> {
        None
    }

    fn has_covariances(&self) -> bool {
        false
    }

    fn covariance(&self, _i: usize) -> Option<Matrix3<f64>> {
        None
    }

    fn has_times(&self) -> bool {
        false
    }

    fn time(&self, _i: usize) -> Option<f64> {
        None
    }

    fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// An immutable point cloud with optional parallel attributes.
///
/// Every attribute, when present, has exactly one entry per point. Attributes
/// are attached with the consuming `with_*` builders, which reject sequences of
/// the wrong length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    points: Vec<Point3<f64>>,
    normals: Option<Vec<Vector3<f64>>>,
    covariances: Option<Vec<Matrix3<f64>>>,
    times: Option<Vec<f64>>,
    features: Option<Vec<FpfhSignature>>,
}

impl PointCloud {
    pub fn new(points: Vec<Point3<f64>>) -> Self {
        Self {
            points,
            ..Self::default()
        }
    }

    pub fn with_normals(mut self, normals: Vec<Vector3<f64>>) -> Result<Self> {
        ensure_len("normals", self.points.len(), normals.len())?;
        self.normals = Some(normals);
        Ok(self)
    }

    pub fn with_covariances(mut self, covariances: Vec<Matrix3<f64>>) -> Result<Self> {
        ensure_len("covariances", self.points.len(), covariances.len())?;
        self.covariances = Some(covariances);
        Ok(self)
    }

    pub fn with_times(mut self, times: Vec<f64>) -> Result<Self> {
        ensure_len("times", self.points.len(), times.len())?;
        self.times = Some(times);
        Ok(self)
    }

    pub fn with_features(mut self, features: Vec<FpfhSignature>) -> Result<Self> {
        ensure_len("features", self.points.len(), features.len())?;
        self.features = Some(features);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }

    pub fn normals(&self) -> Option<&[Vector3<f64>]> {
        self.normals.as_deref()
    }

    pub fn covariances(&self) -> Option<&[Matrix3<f64>]> {
        self.covariances.as_deref()
    }

    pub fn times(&self) -> Option<&[f64]> {
        self.times.as_deref()
    }

    pub fn features(&self) -> Option<&[FpfhSignature]> {
        self.features.as_deref()
    }

    /// Apply a rigid transform to points, normals and covariances.
    ///
    /// Times and features are carried over unchanged.
    pub fn transformed(&self, transform: &nalgebra::Isometry3<f64>) -> Self {
        let rotation = transform.rotation.to_rotation_matrix();
        let r = rotation.matrix();
        Self {
            points: self.points.iter().map(|p| transform * p).collect(),
            normals: self
                .normals
                .as_ref()
                .map(|ns| ns.iter().map(|n| r * n).collect()),
            covariances: self
                .covariances
                .as_ref()
                .map(|cs| cs.iter().map(|c| r * c * r.transpose()).collect()),
            times: self.times.clone(),
            features: self.features.clone(),
        }
    }
}

impl PointSource for PointCloud {
    fn size(&self) -> usize {
        self.points.len()
    }

    fn point(&self, i: usize) -> Point3<f64> {
        self.points[i]
    }

    fn has_normals(&self) -> bool {
        self.normals.is_some()
    }

    fn normal(&self, i: usize) -> Option<Vector3<f64>> {
        self.normals.as_ref().map(|n| n[i])
    }

    fn has_covariances(&self) -> bool {
        self.covariances.is_some()
    }

    fn covariance(&self, i: usize) -> Option<Matrix3<f64>> {
        self.covariances.as_ref().map(|c| c[i])
    }

    fn has_times(&self) -> bool {
        self.times.is_some()
    }

    fn time(&self, i: usize) -> Option<f64> {
        self.times.as_ref().map(|t| t[i])
    }
}

impl PointSource for [Point3<f64>] {
    fn size(&self) -> usize {
        self.len()
    }

    fn point(&self, i: usize) -> Point3<f64> {
        self[i]
    }
}

impl PointSource for Vec<Point3<f64>> {
    fn size(&self) -> usize {
        self.len()
    }

    fn point(&self, i: usize) -> Point3<f64> {
        self[i]
    }
}

/// Collect the coordinates of any point source.
pub fn collect_points<P: PointSource + ?Sized>(source: &P) -> Vec<Point3<f64>> {
    (0..source.size()).map(|i| source.point(i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_attribute_length_is_checked() {
        let pc = PointCloud::new(vec![Point3::origin(), Point3::new(1.0, 0.0, 0.0)]);
        let err = pc.clone().with_normals(vec![Vector3::z()]).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                what: "normals",
                expected: 2,
                actual: 1
            }
        ));

        let pc = pc.with_times(vec![0.0, 1.0]).unwrap();
        assert!(pc.has_times());
        assert_eq!(pc.time(1), Some(1.0));
        assert!(!pc.has_normals());
    }

    #[test]
    fn test_slice_adapter() {
        let pts = vec![Point3::new(1.0, 2.0, 3.0)];
        assert_eq!(pts.size(), 1);
        assert_eq!(pts.as_slice().point(0), Point3::new(1.0, 2.0, 3.0));
        assert!(pts.normal(0).is_none());
    }

    #[test]
    fn test_transformed_rotates_normals() {
        let pc = PointCloud::new(vec![Point3::new(1.0, 0.0, 0.0)])
            .with_normals(vec![Vector3::x()])
            .unwrap();
        let t = nalgebra::Isometry3::new(
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::z() * std::f64::consts::FRAC_PI_2,
        );
        let moved = pc.transformed(&t);
        assert!((moved.points()[0] - Point3::new(0.0, 1.0, 1.0)).norm() < 1e-12);
        assert!((moved.normals().unwrap()[0] - Vector3::y()).norm() < 1e-12);
    }
}
