use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use cloudreg_core::{Error, PointSource, Result};

/// How the residual `r = q - y` between a transformed source point `q` and
/// its target point `y` is weighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AlignmentMetric {
    /// Information `I`.
    #[default]
    PointToPoint,
    /// Information `n nᵀ` with the target normal `n`.
    PointToPlane,
    /// Information `(C_y + R C_p Rᵀ)⁻¹` from target and source covariances.
    Gicp,
}

impl AlignmentMetric {
    /// Fail unless the clouds carry the attributes this metric reads.
    pub fn validate<T, S>(&self, target: &T, source: &S) -> Result<()>
    where
        T: PointSource + ?Sized,
        S: PointSource + ?Sized,
    {
        match self {
            AlignmentMetric::PointToPoint => Ok(()),
            AlignmentMetric::PointToPlane if !target.has_normals() => {
                Err(Error::MissingAttribute("target normals"))
            }
            AlignmentMetric::PointToPlane => Ok(()),
            AlignmentMetric::Gicp if !target.has_covariances() => {
                Err(Error::MissingAttribute("target covariances"))
            }
            AlignmentMetric::Gicp if !source.has_covariances() => {
                Err(Error::MissingAttribute("source covariances"))
            }
            AlignmentMetric::Gicp => Ok(()),
        }
    }

    /// Information matrix of the pair `(target_index, source_index)` when the
    /// source is rotated by `rotation`. `None` drops the pair: the target
    /// normal is zero (degenerate neighborhood) or the fused GICP covariance
    /// is singular.
    pub(crate) fn information<T, S>(
        &self,
        target: &T,
        target_index: usize,
        source: &S,
        source_index: usize,
        rotation: &Matrix3<f64>,
    ) -> Option<Matrix3<f64>>
    where
        T: PointSource + ?Sized,
        S: PointSource + ?Sized,
    {
        match self {
            AlignmentMetric::PointToPoint => Some(Matrix3::identity()),
            AlignmentMetric::PointToPlane => {
                let n = target.normal(target_index).filter(|n| n.norm_squared() > 0.0)?;
                Some(n * n.transpose())
            }
            AlignmentMetric::Gicp => {
                let c_target = target.covariance(target_index)?;
                let c_source = source.covariance(source_index)?;
                (c_target + rotation * c_source * rotation.transpose()).try_inverse()
            }
        }
    }
}
