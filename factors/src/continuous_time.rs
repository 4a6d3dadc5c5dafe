//! Continuous-time ICP factor.
//!
//! Each source point carries a capture time within the scan. The sensor pose
//! at normalized time `t ∈ [0, 1]` interpolates between the scan's start and
//! end poses: rotation along the SO(3) geodesic `R0·Exp(t·Log(R0ᵀR1))`,
//! translation linearly. Optimizing both poses jointly deskews the scan.
//!
//! Based on "CT-ICP: Real-time Elastic LiDAR Odometry with Loop Closure" by
//! Dellenbach et al.

use nalgebra::{Isometry3, Matrix3, Point3, SMatrix, SVector, Translation3, Vector3, Vector6};

use cloudreg_core::{
    ensure_len, geometry, left_jacobian_so3_inv, right_jacobian_so3, right_jacobian_so3_inv, skew,
    so3_exp, so3_log, Error, PointSource, Result,
};
use cloudreg_spatial::NearestNeighborSearch;

use crate::correspondences::{Correspondences, PoseState};
use crate::icp::{nearest_targets, pair_residual, IcpFactorParams};
use crate::linearization::{accumulate_chunks, LinearizedSystem, PointTerm};
use crate::AlignmentFactor;

/// Sensor poses `T_target_sensor` at the start and end of a scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanPoses {
    pub start: Isometry3<f64>,
    pub end: Isometry3<f64>,
}

impl ScanPoses {
    pub fn new(start: Isometry3<f64>, end: Isometry3<f64>) -> Self {
        Self { start, end }
    }

    /// No motion during the scan.
    pub fn constant(pose: Isometry3<f64>) -> Self {
        Self { start: pose, end: pose }
    }

    fn relative_rotation(&self) -> Vector3<f64> {
        so3_log(&(self.start.rotation.inverse() * self.end.rotation))
    }

    /// Pose at normalized time `t`.
    pub fn interpolate(&self, t: f64) -> Isometry3<f64> {
        let rotation = self.start.rotation * so3_exp(&(self.relative_rotation() * t));
        let translation =
            self.start.translation.vector * (1.0 - t) + self.end.translation.vector * t;
        Isometry3::from_parts(Translation3::from(translation), rotation)
    }

    /// Perturb both poses on the right; `delta = [ξ_start; ξ_end]`.
    pub fn retract(&self, delta: &SVector<f64, 12>) -> Self {
        let start: Vector6<f64> = delta.fixed_rows::<6>(0).into_owned();
        let end: Vector6<f64> = delta.fixed_rows::<6>(6).into_owned();
        Self {
            start: geometry::retract(&self.start, &start),
            end: geometry::retract(&self.end, &end),
        }
    }
}

impl PoseState for ScanPoses {
    fn distance_to(&self, other: &Self) -> (f64, f64) {
        let (rot_start, trans_start) = self.start.distance_to(&other.start);
        let (rot_end, trans_end) = self.end.distance_to(&other.end);
        (rot_start.max(rot_end), trans_start.max(trans_end))
    }
}

pub struct ContinuousTimeIcpFactor<'a, T: ?Sized, S: ?Sized> {
    target: &'a T,
    target_index: &'a dyn NearestNeighborSearch<3>,
    source: &'a S,
    params: IcpFactorParams,
    times: Vec<f64>,
}

impl<'a, T, S> ContinuousTimeIcpFactor<'a, T, S>
where
    T: PointSource + ?Sized,
    S: PointSource + ?Sized,
{
    /// The source must carry per-point times. They are normalized to
    /// `[0, 1]` by the scan's earliest and latest time.
    pub fn new(
        target: &'a T,
        target_index: &'a dyn NearestNeighborSearch<3>,
        source: &'a S,
        params: &IcpFactorParams,
    ) -> Result<Self> {
        if !source.has_times() {
            return Err(Error::MissingAttribute("times"));
        }
        params.metric.validate(target, source)?;

        let raw: Vec<f64> = (0..source.size())
            .map(|i| source.time(i).ok_or(Error::MissingAttribute("times")))
            .collect::<Result<_>>()?;
        let (min, max) = raw
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &t| (lo.min(t), hi.max(t)));
        let range = max - min;
        let times = if range > 0.0 {
            raw.iter().map(|t| (t - min) / range).collect()
        } else {
            vec![0.0; raw.len()]
        };

        Ok(Self {
            target,
            target_index,
            source,
            params: *params,
            times,
        })
    }

    pub fn params(&self) -> &IcpFactorParams {
        &self.params
    }

    pub fn normalized_times(&self) -> &[f64] {
        &self.times
    }

    pub fn find_correspondences(&self, poses: &ScanPoses) -> Correspondences<ScanPoses> {
        let targets = nearest_targets(
            self.target_index,
            self.source.size(),
            self.params.max_correspondence_distance,
            self.params.num_threads,
            |i| (poses.interpolate(self.times[i]) * self.source.point(i)).coords,
        );
        Correspondences { state: *poses, targets }
    }

    /// Linearize at `poses` with correspondences found earlier. The
    /// correspondences must cover every source point.
    pub fn evaluate_with(
        &self,
        poses: &ScanPoses,
        correspondences: &Correspondences<ScanPoses>,
    ) -> Result<LinearizedSystem<12>> {
        ensure_len("correspondences", self.source.size(), correspondences.targets.len())?;
        Ok(self.linearize(poses, &correspondences.targets))
    }

    pub fn evaluate(&self, poses: &ScanPoses) -> LinearizedSystem<12> {
        self.linearize(poses, &self.find_correspondences(poses).targets)
    }

    /// Residual and 3×12 Jacobian (columns `[ω0, ν0, ω1, ν1]`) of source
    /// point `i` paired with target point `target_index`; zero if gated out.
    pub fn residual_and_jacobian(
        &self,
        poses: &ScanPoses,
        i: usize,
        target_index: usize,
    ) -> (Vector3<f64>, SMatrix<f64, 3, 12>) {
        self.term(&Interpolation::new(poses), i, target_index)
            .map(|(r, j, _)| (r, j))
            .unwrap_or_else(|| (Vector3::zeros(), SMatrix::zeros()))
    }

    pub fn error(&self, poses: &ScanPoses) -> f64 {
        self.evaluate(poses).error
    }

    /// Every source point moved to the target frame with the pose at its
    /// own capture time.
    pub fn deskewed_source_points(&self, poses: &ScanPoses) -> Vec<Point3<f64>> {
        self.times
            .iter()
            .enumerate()
            .map(|(i, &t)| poses.interpolate(t) * self.source.point(i))
            .collect()
    }

    fn linearize(&self, poses: &ScanPoses, targets: &[Option<usize>]) -> LinearizedSystem<12> {
        let interpolation = Interpolation::new(poses);
        let system = accumulate_chunks(self.source.size(), self.params.num_threads, |i| {
            self.term(&interpolation, i, targets[i]?)
        });
        tracing::debug!(
            num_points = self.source.size(),
            num_inliers = system.num_inliers,
            error = system.error,
            "evaluated continuous-time ICP factor"
        );
        system
    }

    fn term(&self, interp: &Interpolation, i: usize, target_index: usize) -> Option<PointTerm<12>> {
        let t = self.times[i];
        let x = self.source.point(i).coords;

        let delta_rotation = so3_exp(&(interp.phi * t)).to_rotation_matrix().into_inner();
        let rotation = interp.start_rotation * delta_rotation;
        let q = rotation * x + interp.start_translation * (1.0 - t) + interp.end_translation * t;
        let (residual, information) = pair_residual(
            self.target,
            self.source,
            &self.params,
            i,
            target_index,
            &q,
            &rotation,
        )?;

        // R(t) = R0·Exp(tφ) perturbed by either endpoint is R(t)·Exp(A·δ).
        let jr_t = right_jacobian_so3(&(interp.phi * t)) * t;
        let a_start = delta_rotation.transpose() - jr_t * interp.jl_inv;
        let a_end = jr_t * interp.jr_inv;
        let d_rotation = -rotation * skew(&x);

        let mut jacobian = SMatrix::<f64, 3, 12>::zeros();
        jacobian
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(d_rotation * a_start));
        jacobian
            .fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(interp.start_rotation * (1.0 - t)));
        jacobian
            .fixed_view_mut::<3, 3>(0, 6)
            .copy_from(&(d_rotation * a_end));
        jacobian
            .fixed_view_mut::<3, 3>(0, 9)
            .copy_from(&(interp.end_rotation * t));
        Some((residual, jacobian, information))
    }
}

/// Per-evaluation quantities shared by every point.
struct Interpolation {
    start_rotation: Matrix3<f64>,
    end_rotation: Matrix3<f64>,
    start_translation: Vector3<f64>,
    end_translation: Vector3<f64>,
    phi: Vector3<f64>,
    jl_inv: Matrix3<f64>,
    jr_inv: Matrix3<f64>,
}

impl Interpolation {
    fn new(poses: &ScanPoses) -> Self {
        let phi = poses.relative_rotation();
        Self {
            start_rotation: poses.start.rotation.to_rotation_matrix().into_inner(),
            end_rotation: poses.end.rotation.to_rotation_matrix().into_inner(),
            start_translation: poses.start.translation.vector,
            end_translation: poses.end.translation.vector,
            phi,
            jl_inv: left_jacobian_so3_inv(&phi),
            jr_inv: right_jacobian_so3_inv(&phi),
        }
    }
}

impl<T, S> AlignmentFactor<12> for ContinuousTimeIcpFactor<'_, T, S>
where
    T: PointSource + ?Sized,
    S: PointSource + ?Sized,
{
    type State = ScanPoses;

    fn evaluate(&self, state: &ScanPoses) -> LinearizedSystem<12> {
        ContinuousTimeIcpFactor::evaluate(self, state)
    }

    fn retract(&self, state: &ScanPoses, delta: &SVector<f64, 12>) -> ScanPoses {
        state.retract(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudreg_core::PointCloud;
    use cloudreg_spatial::KdTree;

    #[test]
    fn test_interpolation_endpoints() {
        let start = Isometry3::new(Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 0.0, 0.1));
        let end = Isometry3::new(Vector3::new(2.0, 1.0, 0.0), Vector3::new(0.0, 0.2, 0.3));
        let poses = ScanPoses::new(start, end);

        let (rot, trans) = poses.interpolate(0.0).distance_to(&start);
        assert!(rot < 1e-6 && trans < 1e-12);
        let (rot, trans) = poses.interpolate(1.0).distance_to(&end);
        assert!(rot < 1e-6 && trans < 1e-12);

        let mid = poses.interpolate(0.5);
        assert!((mid.translation.vector - Vector3::new(1.5, 0.5, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_times_are_normalized() {
        let cloud = PointCloud::new(vec![Point3::origin(); 3])
            .with_times(vec![10.0, 10.5, 12.0])
            .unwrap();
        let index = KdTree::from_cloud(&cloud);
        let factor =
            ContinuousTimeIcpFactor::new(&cloud, &index, &cloud, &IcpFactorParams::default())
                .unwrap();
        assert_eq!(factor.normalized_times(), &[0.0, 0.25, 1.0]);

        let flat = PointCloud::new(vec![Point3::origin(); 2])
            .with_times(vec![3.0, 3.0])
            .unwrap();
        let factor =
            ContinuousTimeIcpFactor::new(&flat, &index, &flat, &IcpFactorParams::default()).unwrap();
        assert_eq!(factor.normalized_times(), &[0.0, 0.0]);
    }

    #[test]
    fn test_requires_times() {
        let cloud = PointCloud::new(vec![Point3::origin()]);
        let index = KdTree::from_cloud(&cloud);
        let result =
            ContinuousTimeIcpFactor::new(&cloud, &index, &cloud, &IcpFactorParams::default());
        assert!(matches!(result, Err(Error::MissingAttribute("times"))));
    }

    #[test]
    fn test_mismatched_correspondences_are_rejected() {
        let cloud = PointCloud::new(vec![Point3::origin(); 4])
            .with_times(vec![0.0, 0.1, 0.2, 0.3])
            .unwrap();
        let index = KdTree::from_cloud(&cloud);
        let factor =
            ContinuousTimeIcpFactor::new(&cloud, &index, &cloud, &IcpFactorParams::default())
                .unwrap();
        let poses = ScanPoses::constant(Isometry3::identity());

        let short = Correspondences {
            state: poses,
            targets: vec![Some(0)],
        };
        let err = factor.evaluate_with(&poses, &short).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 4,
                actual: 1,
                ..
            }
        ));
    }
}
