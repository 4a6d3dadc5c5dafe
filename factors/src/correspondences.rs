use nalgebra::Isometry3;
use serde::{Deserialize, Serialize};

use cloudreg_core::pose_error;

/// A state whose correspondences can be reused while it moves little.
pub trait PoseState: Clone + PartialEq {
    /// Largest rotation (rad) and translation distance to `other`.
    fn distance_to(&self, other: &Self) -> (f64, f64);
}

impl PoseState for Isometry3<f64> {
    fn distance_to(&self, other: &Self) -> (f64, f64) {
        pose_error(self, other)
    }
}

/// How far the state may move before cached correspondences are stale.
/// Zero tolerances reuse correspondences only for the exact same state.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateTolerance {
    pub rotation: f64,
    pub translation: f64,
}

/// Nearest target point per source point, found at `state`.
#[derive(Debug, Clone, PartialEq)]
pub struct Correspondences<S> {
    pub state: S,
    /// `None` when the source point has no target within the correspondence
    /// distance.
    pub targets: Vec<Option<usize>>,
}

impl<S: PoseState> Correspondences<S> {
    pub fn num_valid(&self) -> usize {
        self.targets.iter().filter(|t| t.is_some()).count()
    }

    pub fn is_valid_for(&self, state: &S, tolerance: &UpdateTolerance) -> bool {
        if self.state == *state {
            return true;
        }
        let (rotation, translation) = self.state.distance_to(state);
        rotation <= tolerance.rotation && translation <= tolerance.translation
    }
}
