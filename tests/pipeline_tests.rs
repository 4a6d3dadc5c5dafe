use cloudreg::core::{pose_error, PointCloud, Result};
use cloudreg::factors::{AlignmentFactor, AlignmentMetric, IcpFactorParams};
use cloudreg::point_cloud::{FpfhParams, NormalEstimationParams};
use cloudreg::registration::RansacParams;
use cloudreg::spatial::{LshParams, OccupancyGrid};
use cloudreg::{
    GlobalStage, LocalStage, PipelineConfig, PoseOptimizer, PreprocessConfig,
    RegistrationPipeline,
};
use nalgebra::{DMatrix, DVector, Isometry3, Point3, SVector, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Minimum corner of the unit cube, off the voxel grid so faces do not sit
/// on voxel boundaries.
const CUBE_MIN: [f64; 3] = [0.013, -0.527, 0.041];

/// Uniform samples on the six faces of the unit cube.
fn unit_cube(points_per_face: usize, rng: &mut StdRng) -> PointCloud {
    let mut points = Vec::with_capacity(6 * points_per_face);
    for face in 0..6 {
        let axis = face / 2;
        for _ in 0..points_per_face {
            let mut p = Vector3::new(rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>());
            p[axis] = (face % 2) as f64;
            points.push(Point3::from(p + Vector3::from(CUBE_MIN)));
        }
    }
    PointCloud::new(points)
}

fn cube_center() -> Point3<f64> {
    Point3::from(Vector3::from(CUBE_MIN) + Vector3::repeat(0.5))
}

/// Gauss-Newton with a small diagonal damping, re-associating each step.
struct GaussNewton {
    max_iterations: usize,
}

impl PoseOptimizer for GaussNewton {
    fn optimize(
        &self,
        factor: &dyn AlignmentFactor<6, State = Isometry3<f64>>,
        initial: Isometry3<f64>,
    ) -> Result<Isometry3<f64>> {
        let mut pose = initial;
        for _ in 0..self.max_iterations {
            let system = factor.evaluate(&pose);
            let hessian = DMatrix::from_fn(6, 6, |r, c| {
                system.hessian[(r, c)] + if r == c { 1e-6 } else { 0.0 }
            });
            let gradient = DVector::from_fn(6, |r, _| -system.gradient[r]);
            let Some(delta) = hessian.cholesky().map(|c| c.solve(&gradient)) else {
                break;
            };
            let delta = SVector::<f64, 6>::from_fn(|r, _| delta[r]);
            pose = factor.retract(&pose, &delta);
            if delta.norm() < 1e-9 {
                break;
            }
        }
        Ok(pose)
    }
}

fn cube_config() -> PipelineConfig {
    PipelineConfig {
        preprocess: PreprocessConfig {
            voxel_size: 0.05,
            normals: NormalEstimationParams::default(),
            orient_to_centroid: true,
            fpfh: FpfhParams {
                search_radius: 0.5,
                ..Default::default()
            },
            ..Default::default()
        },
        global: GlobalStage::Ransac(RansacParams {
            max_iterations: 20000,
            inlier_voxel_resolution: 0.1,
            reciprocal_check: true,
            ..Default::default()
        }),
        local: LocalStage::Refine(IcpFactorParams {
            metric: AlignmentMetric::PointToPlane,
            max_correspondence_distance: 0.2,
            num_threads: 4,
        }),
    }
}

/// The cube is symmetric, so any pose that differs from `expected` by one
/// of its rotational symmetries aligns the clouds equally well. The residual
/// `estimated * expected⁻¹` must map the target cube onto itself.
fn assert_cube_aligned(estimated: &Isometry3<f64>, expected: &Isometry3<f64>) {
    let residual = estimated * expected.inverse();
    let rotation = residual.rotation.to_rotation_matrix().into_inner();
    for value in rotation.iter() {
        let snapped = value.round();
        assert!(
            snapped.abs() <= 1.0 && (value - snapped).abs() < 0.02,
            "not a cube symmetry: {rotation}"
        );
    }
    let center = cube_center();
    let moved = (residual * center - center).norm();
    assert!(moved < 0.02, "cube center moved by {moved}");
}

#[test]
fn test_cube_ransac_then_icp() {
    let mut rng = StdRng::seed_from_u64(42);
    let target = unit_cube(3000, &mut rng);
    let motion = Isometry3::new(
        Vector3::new(1.0, 0.0, 0.0),
        Vector3::new(0.0, 0.0, 5f64.to_radians()),
    );
    let source = target.transformed(&motion);
    let expected = motion.inverse();

    let optimizer = GaussNewton { max_iterations: 30 };
    let pipeline = RegistrationPipeline::new(cube_config()).with_optimizer(&optimizer);
    let target = pipeline.prepare(&target).unwrap();
    let source = pipeline.prepare(&source).unwrap();
    let result = pipeline
        .register_prepared(&target, &source, &mut StdRng::seed_from_u64(7))
        .unwrap();

    let global = result.global.as_ref().unwrap();
    assert!(global.num_inliers > 0);
    assert_cube_aligned(&result.transformation, &expected);

    let grid = OccupancyGrid::from_cloud(&target.cloud, 0.1);
    let inlier_rate = grid.overlap_rate(&source.cloud, &result.transformation);
    assert!(inlier_rate > 0.9, "inlier rate {inlier_rate}");
    assert!(result.local_inliers.unwrap() as f64 > 0.9 * source.cloud.len() as f64);
}

#[test]
fn test_refinement_from_known_initial_guess() {
    let mut rng = StdRng::seed_from_u64(3);
    let target = unit_cube(3000, &mut rng);
    let motion = Isometry3::new(
        Vector3::new(0.03, -0.02, 0.01),
        Vector3::new(0.0, 0.0, 3f64.to_radians()),
    );
    let source = target.transformed(&motion);

    let config = PipelineConfig {
        global: GlobalStage::None,
        ..cube_config()
    };
    let optimizer = GaussNewton { max_iterations: 30 };
    let result = RegistrationPipeline::new(config)
        .with_optimizer(&optimizer)
        .register(&target, &source, &mut StdRng::seed_from_u64(0))
        .unwrap();

    assert!(result.global.is_none());
    let (rot_err, trans_err) = pose_error(&result.transformation, &motion.inverse());
    assert!(rot_err < 5e-3, "rotation error {rot_err}");
    assert!(trans_err < 1e-2, "translation error {trans_err}");
}

#[test]
fn test_global_only_with_lsh_matching() {
    let mut rng = StdRng::seed_from_u64(5);
    let target = unit_cube(1500, &mut rng);
    let source = target.transformed(&Isometry3::translation(0.5, 0.0, 0.0));

    let config = PipelineConfig {
        preprocess: PreprocessConfig {
            lsh: Some(LshParams::default()),
            ..cube_config().preprocess
        },
        global: GlobalStage::Ransac(RansacParams {
            max_iterations: 2000,
            inlier_voxel_resolution: 0.1,
            ..Default::default()
        }),
        local: LocalStage::None,
    };
    let pipeline = RegistrationPipeline::new(config);
    let result = pipeline
        .register(&target, &source, &mut StdRng::seed_from_u64(1))
        .unwrap();

    let global = result.global.unwrap();
    assert_eq!(result.transformation, global.transformation);
    assert!(result.local_inliers.is_none());
    assert!((0.0..=1.0).contains(&global.inlier_rate));
}

#[test]
fn test_config_from_json() {
    let json = r#"{
        "preprocess": { "voxel_size": 0.05, "orient_to_centroid": true },
        "global": { "Gnc": { "max_init_samples": 1000, "verbose": true } },
        "local": { "Refine": { "metric": "Gicp", "max_correspondence_distance": 0.3 } }
    }"#;
    let config = PipelineConfig::from_json_str(json).unwrap();

    assert_eq!(config.preprocess.voxel_size, 0.05);
    assert!(config.preprocess.orient_to_centroid);
    let GlobalStage::Gnc(gnc) = config.global else {
        panic!("expected GNC, got {:?}", config.global);
    };
    assert_eq!(gnc.max_init_samples, 1000);
    assert!(gnc.verbose);
    assert!(gnc.reciprocal_check);
    assert_eq!(
        config.local,
        LocalStage::Refine(IcpFactorParams {
            metric: AlignmentMetric::Gicp,
            max_correspondence_distance: 0.3,
            ..Default::default()
        })
    );
}

#[test]
fn test_gicp_preparation_attaches_covariances() {
    let mut rng = StdRng::seed_from_u64(9);
    let cloud = unit_cube(500, &mut rng);
    let config = PipelineConfig {
        global: GlobalStage::None,
        local: LocalStage::Refine(IcpFactorParams {
            metric: AlignmentMetric::Gicp,
            ..Default::default()
        }),
        ..cube_config()
    };
    let prepared = RegistrationPipeline::new(config).prepare(&cloud).unwrap();

    assert!(prepared.cloud.covariances().is_some());
    assert!(prepared.cloud.normals().is_some());
    assert!(prepared.features().is_empty());
    assert_eq!(prepared.tree.len(), prepared.cloud.len());
}
