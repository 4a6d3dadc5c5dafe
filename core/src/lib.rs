//! Core types shared by every cloudreg crate.
//!
//! - [`PointCloud`] and the [`PointSource`] capability trait
//! - SE(3)/SO(3) helpers and the closed-form rigid solver ([`geometry`])
//! - Robust loss functions used by graduated non-convexity ([`robust_loss`])
//! - Thread pool helpers ([`runtime`])

pub mod geometry;
pub mod point_cloud;
pub mod robust_loss;
pub mod runtime;

pub use geometry::*;
pub use point_cloud::*;
pub use robust_loss::{RobustLoss, RobustLossType};

/// Errors raised for structurally invalid input.
///
/// Statistically poor data (few inliers, degenerate neighborhoods) is never
/// reported through this type; those cases produce sentinel values instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch: {what} has {actual} entries, expected {expected}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Missing attribute: {0}")]
    MissingAttribute(&'static str),

    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fail with [`Error::DimensionMismatch`] unless `actual == expected`.
pub fn ensure_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::DimensionMismatch {
            what,
            expected,
            actual,
        })
    }
}
