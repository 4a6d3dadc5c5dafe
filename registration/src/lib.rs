//! Point cloud registration algorithms
//!
//! This crate provides coarse, initialization-free registration from
//! per-point descriptors:
//! - Feature correspondence search
//! - RANSAC over correspondence triplets
//! - GNC (Graduated Non-Convexity) for robust registration

pub mod registration;

pub use registration::{
    estimate_pose_gnc, estimate_pose_ransac, find_correspondences, Correspondence, GncParams,
    RansacParams, RegistrationResult,
};
pub use cloudreg_core::{Error, Result, RobustLoss, RobustLossType};
