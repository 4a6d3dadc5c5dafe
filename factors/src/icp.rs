//! Rigid ICP-family factor over a single `T_target_source` pose.

use nalgebra::{Isometry3, Matrix3, Matrix3x6, Vector3, Vector6};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use cloudreg_core::{ensure_len, geometry, skew, PointSource, Result};
use cloudreg_spatial::NearestNeighborSearch;

use crate::correspondences::Correspondences;
use crate::linearization::{accumulate_chunks, LinearizedSystem, PointTerm};
use crate::metric::AlignmentMetric;
use crate::AlignmentFactor;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcpFactorParams {
    pub metric: AlignmentMetric,
    /// Pairs farther apart than this are ignored.
    pub max_correspondence_distance: f64,
    pub num_threads: usize,
}

impl Default for IcpFactorParams {
    fn default() -> Self {
        Self {
            metric: AlignmentMetric::PointToPoint,
            max_correspondence_distance: 1.0,
            num_threads: 1,
        }
    }
}

/// Nearest target point of every transformed source point, or `None` past
/// `max_distance`. Shared by the rigid and continuous-time factors.
pub(crate) fn nearest_targets<F>(
    index: &dyn NearestNeighborSearch<3>,
    num_points: usize,
    max_distance: f64,
    num_threads: usize,
    transformed: F,
) -> Vec<Option<usize>>
where
    F: Fn(usize) -> Vector3<f64> + Sync,
{
    let max_sq_dist = max_distance * max_distance;
    cloudreg_core::runtime::install(num_threads, || {
        (0..num_points)
            .into_par_iter()
            .map(|i| {
                let q = transformed(i);
                index
                    .nearest(&[q.x, q.y, q.z])
                    .filter(|n| n.sq_dist <= max_sq_dist)
                    .map(|n| n.index)
            })
            .collect()
    })
}

/// Residual `q - y` and information of one pair, or `None` when the pair is
/// gated out by distance or has a singular information matrix.
pub(crate) fn pair_residual<T, S>(
    target: &T,
    source: &S,
    params: &IcpFactorParams,
    source_index: usize,
    target_index: usize,
    transformed: &Vector3<f64>,
    rotation: &Matrix3<f64>,
) -> Option<(Vector3<f64>, Matrix3<f64>)>
where
    T: PointSource + ?Sized,
    S: PointSource + ?Sized,
{
    let residual = transformed - target.point(target_index).coords;
    let max = params.max_correspondence_distance;
    if !(residual.norm_squared() <= max * max) {
        return None;
    }
    let information =
        params
            .metric
            .information(target, target_index, source, source_index, rotation)?;
    Some((residual, information))
}

/// ICP factor between a target cloud, indexed for nearest-neighbor search,
/// and a source cloud.
///
/// The factor only evaluates; the caller's optimizer owns the pose.
pub struct IntegratedIcpFactor<'a, T: ?Sized, S: ?Sized> {
    target: &'a T,
    target_index: &'a dyn NearestNeighborSearch<3>,
    source: &'a S,
    params: IcpFactorParams,
}

impl<'a, T, S> IntegratedIcpFactor<'a, T, S>
where
    T: PointSource + ?Sized,
    S: PointSource + ?Sized,
{
    /// `target_index` must index the target points in order.
    pub fn new(
        target: &'a T,
        target_index: &'a dyn NearestNeighborSearch<3>,
        source: &'a S,
        params: &IcpFactorParams,
    ) -> Result<Self> {
        params.metric.validate(target, source)?;
        Ok(Self {
            target,
            target_index,
            source,
            params: *params,
        })
    }

    pub fn params(&self) -> &IcpFactorParams {
        &self.params
    }

    pub fn find_correspondences(&self, pose: &Isometry3<f64>) -> Correspondences<Isometry3<f64>> {
        let targets = nearest_targets(
            self.target_index,
            self.source.size(),
            self.params.max_correspondence_distance,
            self.params.num_threads,
            |i| (pose * self.source.point(i)).coords,
        );
        Correspondences { state: *pose, targets }
    }

    /// Linearize at `pose` with correspondences found earlier, possibly at a
    /// nearby pose. The correspondences must cover every source point.
    pub fn evaluate_with(
        &self,
        pose: &Isometry3<f64>,
        correspondences: &Correspondences<Isometry3<f64>>,
    ) -> Result<LinearizedSystem<6>> {
        ensure_len("correspondences", self.source.size(), correspondences.targets.len())?;
        Ok(self.linearize(pose, &correspondences.targets))
    }

    pub fn evaluate(&self, pose: &Isometry3<f64>) -> LinearizedSystem<6> {
        self.linearize(pose, &self.find_correspondences(pose).targets)
    }

    /// Residual and Jacobian of source point `i` paired with target point
    /// `target_index`; both zero if the pair is gated out.
    pub fn residual_and_jacobian(
        &self,
        pose: &Isometry3<f64>,
        i: usize,
        target_index: usize,
    ) -> (Vector3<f64>, Matrix3x6<f64>) {
        self.term(pose, i, target_index)
            .map(|(r, j, _)| (r, j))
            .unwrap_or_else(|| (Vector3::zeros(), Matrix3x6::zeros()))
    }

    pub fn error(&self, pose: &Isometry3<f64>) -> f64 {
        self.evaluate(pose).error
    }

    fn linearize(&self, pose: &Isometry3<f64>, targets: &[Option<usize>]) -> LinearizedSystem<6> {
        let system = accumulate_chunks(self.source.size(), self.params.num_threads, |i| {
            self.term(pose, i, targets[i]?)
        });
        tracing::debug!(
            num_points = self.source.size(),
            num_inliers = system.num_inliers,
            error = system.error,
            "evaluated ICP factor"
        );
        system
    }

    fn term(&self, pose: &Isometry3<f64>, i: usize, target_index: usize) -> Option<PointTerm<6>> {
        let p = self.source.point(i).coords;
        let rotation = pose.rotation.to_rotation_matrix().into_inner();
        let q = rotation * p + pose.translation.vector;
        let (residual, information) = pair_residual(
            self.target,
            self.source,
            &self.params,
            i,
            target_index,
            &q,
            &rotation,
        )?;

        let mut jacobian = Matrix3x6::zeros();
        jacobian
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(-rotation * skew(&p)));
        jacobian.fixed_view_mut::<3, 3>(0, 3).copy_from(&rotation);
        Some((residual, jacobian, information))
    }
}

impl<T, S> AlignmentFactor<6> for IntegratedIcpFactor<'_, T, S>
where
    T: PointSource + ?Sized,
    S: PointSource + ?Sized,
{
    type State = Isometry3<f64>;

    fn evaluate(&self, state: &Isometry3<f64>) -> LinearizedSystem<6> {
        IntegratedIcpFactor::evaluate(self, state)
    }

    fn retract(&self, state: &Isometry3<f64>, delta: &Vector6<f64>) -> Isometry3<f64> {
        geometry::retract(state, delta)
    }
}
