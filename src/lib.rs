//! Point cloud registration
//!
//! Umbrella crate over the workspace:
//! - [`core`]: point clouds, geometry, errors
//! - [`spatial`]: kd-tree, multi-probe LSH and voxel indices
//! - [`point_cloud`]: downsampling, normals, covariances, FPFH
//! - [`registration`]: RANSAC and GNC global registration
//! - [`factors`]: ICP-family alignment factors
//!
//! [`RegistrationPipeline`] chains them into an explicit global then local
//! registration.

pub use cloudreg_core as core;
pub use cloudreg_factors as factors;
pub use cloudreg_point_cloud as point_cloud;
pub use cloudreg_registration as registration;
pub use cloudreg_spatial as spatial;

pub mod pipeline;

pub use cloudreg_core::{Error, Result};
pub use pipeline::{
    GlobalStage, LocalStage, PipelineConfig, PipelineResult, PoseOptimizer, PreparedCloud,
    PreprocessConfig, RegistrationPipeline,
};

/// Size the thread pool used by every operation configured with
/// `num_threads == 0`, returning its thread count.
///
/// Call it before any parallel work. When `num_threads` is `None`, the
/// `CLOUDREG_CPU_THREADS` environment variable decides, then the core count.
/// See [`core::runtime::init_global_thread_pool`].
pub fn init_thread_pool(num_threads: Option<usize>) -> Result<usize> {
    cloudreg_core::runtime::init_global_thread_pool(num_threads)
}
