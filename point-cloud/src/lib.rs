//! Point cloud preprocessing and local surface descriptors
//!
//! - [`filtering`]: voxel-grid downsampling
//! - [`normals`]: PCA normal estimation
//! - [`covariance`]: per-point covariances for generalized ICP
//! - [`fpfh`]: fast point feature histograms
//!
//! Estimators read any [`cloudreg_core::PointSource`] and return plain
//! vectors, which callers attach to a cloud with the `with_*` builders.

pub mod covariance;
pub mod filtering;
pub mod fpfh;
pub mod normals;

pub use covariance::{
    estimate_covariances, CovarianceEstimation, CovarianceEstimationParams,
    CovarianceRegularization,
};
pub use filtering::voxelgrid_sampling;
pub use fpfh::{estimate_fpfh, FpfhParams};
pub use normals::{
    estimate_normals, estimate_normals_with_tree, NormalEstimation, NormalEstimationParams,
};
