//! ICP-family alignment factors
//!
//! A factor linearizes the alignment cost between a target and a source cloud
//! at a given state and hands the resulting [`LinearizedSystem`] to an
//! external optimizer:
//! - [`IntegratedIcpFactor`]: one rigid `T_target_source` pose (6 DoF)
//! - [`ContinuousTimeIcpFactor`]: start and end poses of a scan whose points
//!   were captured over time (12 DoF)
//!
//! Both support point-to-point, point-to-plane and generalized ICP through
//! [`AlignmentMetric`].

pub mod continuous_time;
pub mod correspondences;
pub mod icp;
pub mod linearization;
pub mod metric;

pub use continuous_time::{ContinuousTimeIcpFactor, ScanPoses};
pub use correspondences::{Correspondences, PoseState, UpdateTolerance};
pub use icp::{IcpFactorParams, IntegratedIcpFactor};
pub use linearization::{LinearizedSystem, CHUNK_SIZE};
pub use metric::AlignmentMetric;
pub use cloudreg_core::{Error, Result};

use nalgebra::SVector;

/// Optimizer-facing interface of a factor with `N` degrees of freedom.
///
/// Evaluation is pure: the factor never stores or updates the state.
pub trait AlignmentFactor<const N: usize>: Send + Sync {
    type State: Clone;

    fn evaluate(&self, state: &Self::State) -> LinearizedSystem<N>;

    fn error(&self, state: &Self::State) -> f64 {
        self.evaluate(state).error
    }

    /// Apply a tangent-space update.
    fn retract(&self, state: &Self::State, delta: &SVector<f64, N>) -> Self::State;
}
