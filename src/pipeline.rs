//! Two-stage registration: feature-based global estimate, then ICP refinement
//! driven by a caller-supplied optimizer.

use nalgebra::{Isometry3, Point3, Vector3};
use rand::Rng;
use serde::{Deserialize, Serialize};

use cloudreg_core::{Error, FpfhSignature, PointCloud, Result, FPFH_DIM};
use cloudreg_factors::{AlignmentFactor, AlignmentMetric, IcpFactorParams, IntegratedIcpFactor};
use cloudreg_point_cloud::{
    estimate_covariances, estimate_fpfh, estimate_normals_with_tree, voxelgrid_sampling,
    CovarianceEstimationParams, FpfhParams, NormalEstimationParams,
};
use cloudreg_registration::{
    estimate_pose_gnc, estimate_pose_ransac, GncParams, RansacParams, RegistrationResult,
};
use cloudreg_spatial::{KdTree, LshParams, MultiProbeLsh, NearestNeighborSearch};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Downsampling voxel size; non-positive keeps every point.
    pub voxel_size: f64,
    pub normals: NormalEstimationParams,
    /// Flip normals towards the cloud centroid, overriding `normals.viewpoint`.
    pub orient_to_centroid: bool,
    pub fpfh: FpfhParams,
    /// Used only when the local stage runs generalized ICP.
    pub covariances: CovarianceEstimationParams,
    /// Approximate descriptor matching. `None` matches exactly with a kd-tree.
    pub lsh: Option<LshParams>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.5,
            normals: NormalEstimationParams::default(),
            orient_to_centroid: false,
            fpfh: FpfhParams::default(),
            covariances: CovarianceEstimationParams::default(),
            lsh: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum GlobalStage {
    None,
    Ransac(RansacParams),
    Gnc(GncParams),
}

impl Default for GlobalStage {
    fn default() -> Self {
        GlobalStage::Ransac(RansacParams::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum LocalStage {
    #[default]
    None,
    Refine(IcpFactorParams),
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub preprocess: PreprocessConfig,
    pub global: GlobalStage,
    pub local: LocalStage,
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidInput(format!("failed to parse pipeline config: {e}")))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::InvalidInput(format!("failed to serialize pipeline config: {e}")))
    }
}

/// The external nonlinear optimizer behind the local stage.
///
/// It owns the iteration: evaluating the factor, solving for an update,
/// retracting and deciding convergence.
pub trait PoseOptimizer: Sync {
    fn optimize(
        &self,
        factor: &dyn AlignmentFactor<6, State = Isometry3<f64>>,
        initial: Isometry3<f64>,
    ) -> Result<Isometry3<f64>>;
}

/// A downsampled cloud with normals, FPFH features when the global stage
/// needs them, covariances for generalized ICP, and its kd-tree.
#[derive(Debug, Clone)]
pub struct PreparedCloud {
    pub cloud: PointCloud,
    pub tree: KdTree<3>,
}

impl PreparedCloud {
    pub fn features(&self) -> &[FpfhSignature] {
        self.cloud.features().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResult {
    /// Final `T_target_source`.
    pub transformation: Isometry3<f64>,
    pub global: Option<RegistrationResult>,
    /// Source points with a target correspondence at the refined pose.
    pub local_inliers: Option<usize>,
}

pub struct RegistrationPipeline<'o> {
    config: PipelineConfig,
    optimizer: Option<&'o dyn PoseOptimizer>,
}

impl<'o> RegistrationPipeline<'o> {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            optimizer: None,
        }
    }

    pub fn with_optimizer(mut self, optimizer: &'o dyn PoseOptimizer) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Downsample `cloud` and attach what the configured stages read.
    pub fn prepare(&self, cloud: &PointCloud) -> Result<PreparedCloud> {
        let pre = &self.config.preprocess;
        let mut cloud = voxelgrid_sampling(cloud, pre.voxel_size)?;
        let tree = KdTree::from_cloud(&cloud);

        let mut normal_params = pre.normals;
        if pre.orient_to_centroid {
            normal_params.viewpoint = centroid(&cloud);
        }
        let normals = estimate_normals_with_tree(&cloud, &tree, &normal_params);
        let num_degenerate = normals.valid.len() - normals.num_valid();
        cloud = cloud.with_normals(normals.normals)?;

        if self.needs_covariances() {
            let covariances = estimate_covariances(&cloud, &pre.covariances);
            cloud = cloud.with_covariances(covariances.covariances)?;
        }
        if self.config.global != GlobalStage::None {
            let features = estimate_fpfh(&cloud, &tree, &pre.fpfh)?;
            cloud = cloud.with_features(features)?;
        }

        tracing::debug!(num_points = cloud.len(), num_degenerate, "prepared cloud");
        Ok(PreparedCloud { cloud, tree })
    }

    /// Prepare both clouds and register `source` onto `target`.
    pub fn register<R: Rng + ?Sized>(
        &self,
        target: &PointCloud,
        source: &PointCloud,
        rng: &mut R,
    ) -> Result<PipelineResult> {
        let target = self.prepare(target)?;
        let source = self.prepare(source)?;
        self.register_prepared(&target, &source, rng)
    }

    pub fn register_prepared<R: Rng + ?Sized>(
        &self,
        target: &PreparedCloud,
        source: &PreparedCloud,
        rng: &mut R,
    ) -> Result<PipelineResult> {
        let global = self.run_global(target, source, rng)?;
        let initial = global
            .as_ref()
            .map_or_else(Isometry3::identity, |g| g.transformation);

        let (transformation, local_inliers) = match self.config.local {
            LocalStage::None => (initial, None),
            LocalStage::Refine(params) => {
                let optimizer = self.optimizer.ok_or_else(|| {
                    Error::InvalidInput("local refinement needs a pose optimizer".into())
                })?;
                let factor =
                    IntegratedIcpFactor::new(&target.cloud, &target.tree, &source.cloud, &params)?;
                let refined = optimizer.optimize(&factor, initial)?;
                let num_inliers = factor.evaluate(&refined).num_inliers;
                tracing::info!(num_inliers, num_points = source.cloud.len(), "local refinement done");
                (refined, Some(num_inliers))
            }
        };

        Ok(PipelineResult {
            transformation,
            global,
            local_inliers,
        })
    }

    fn run_global<R: Rng + ?Sized>(
        &self,
        target: &PreparedCloud,
        source: &PreparedCloud,
        rng: &mut R,
    ) -> Result<Option<RegistrationResult>> {
        let reciprocal_check = match self.config.global {
            GlobalStage::None => return Ok(None),
            GlobalStage::Ransac(params) => params.reciprocal_check,
            GlobalStage::Gnc(params) => params.reciprocal_check,
        };

        let target_index = self.feature_index(target.features(), rng)?;
        let source_index = if reciprocal_check {
            Some(self.feature_index(source.features(), rng)?)
        } else {
            None
        };

        let result = match self.config.global {
            GlobalStage::None => return Ok(None),
            GlobalStage::Ransac(params) => estimate_pose_ransac(
                &target.cloud,
                &source.cloud,
                target.features(),
                source.features(),
                &*target_index,
                source_index.as_deref(),
                &params,
                rng,
            )?,
            GlobalStage::Gnc(params) => estimate_pose_gnc(
                &target.cloud,
                &source.cloud,
                target.features(),
                source.features(),
                &*target_index,
                source_index.as_deref(),
                &params,
                rng,
            )?,
        };
        tracing::info!(
            num_inliers = result.num_inliers,
            inlier_rate = result.inlier_rate,
            "global registration done"
        );
        Ok(Some(result))
    }

    fn feature_index<R: Rng + ?Sized>(
        &self,
        features: &[FpfhSignature],
        rng: &mut R,
    ) -> Result<Box<dyn NearestNeighborSearch<FPFH_DIM>>> {
        Ok(match &self.config.preprocess.lsh {
            Some(params) => Box::new(MultiProbeLsh::create_tables(features, params, rng)?),
            None => Box::new(KdTree::new(features.to_vec())),
        })
    }

    fn needs_covariances(&self) -> bool {
        matches!(
            self.config.local,
            LocalStage::Refine(IcpFactorParams {
                metric: AlignmentMetric::Gicp,
                ..
            })
        )
    }
}

fn centroid(cloud: &PointCloud) -> Option<Point3<f64>> {
    if cloud.is_empty() {
        return None;
    }
    let sum: Vector3<f64> = cloud.points().iter().map(|p| p.coords).sum();
    Some(Point3::from(sum / cloud.len() as f64))
}
