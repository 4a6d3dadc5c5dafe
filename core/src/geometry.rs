//! SE(3) / SO(3) utilities.
//!
//! Tangent vectors are ordered `[ω; ν]` (rotation first). Perturbations are
//! applied on the right: `T ⊕ ξ = T · Exp(ξ)`.

use nalgebra::{
    Isometry3, Matrix3, Point3, Translation3, UnitQuaternion, Vector3, Vector6,
};

/// Small angle threshold for series expansions.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-6;

/// Constructs the skew-symmetric matrix `[v]×` such that `[v]× u = v × u`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// SO(3) exponential map.
#[inline]
pub fn so3_exp(omega: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*omega)
}

/// SO(3) logarithm map.
#[inline]
pub fn so3_log(rotation: &UnitQuaternion<f64>) -> Vector3<f64> {
    rotation.scaled_axis()
}

/// Right Jacobian of SO(3):
///
/// ```text
/// Jr(φ) = I - (1 - cos θ)/θ² [φ]× + (θ - sin θ)/θ³ [φ]×²
/// ```
pub fn right_jacobian_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let skew_phi = skew(phi);

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() - 0.5 * skew_phi;
    }

    let theta_sq = theta * theta;
    Matrix3::identity() - ((1.0 - theta.cos()) / theta_sq) * skew_phi
        + ((theta - theta.sin()) / (theta_sq * theta)) * skew_phi * skew_phi
}

/// Inverse of the right Jacobian of SO(3):
///
/// ```text
/// Jr⁻¹(φ) = I + ½[φ]× + (1/θ² - (1 + cos θ)/(2θ sin θ)) [φ]×²
/// ```
pub fn right_jacobian_so3_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let skew_phi = skew(phi);

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() + 0.5 * skew_phi + (1.0 / 12.0) * skew_phi * skew_phi;
    }

    let theta_sq = theta * theta;
    let coeff = 1.0 / theta_sq - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() + 0.5 * skew_phi + coeff * skew_phi * skew_phi
}

/// Inverse of the left Jacobian of SO(3); `Jl⁻¹(φ) = Jr⁻¹(-φ)`.
#[inline]
pub fn left_jacobian_so3_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    right_jacobian_so3_inv(&(-phi))
}

/// Left Jacobian of SO(3); `Jl(φ) = Jr(-φ)`.
#[inline]
pub fn left_jacobian_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    right_jacobian_so3(&(-phi))
}

/// SE(3) exponential map of `ξ = [ω; ν]`.
pub fn se3_exp(xi: &Vector6<f64>) -> Isometry3<f64> {
    let omega = xi.fixed_rows::<3>(0).into_owned();
    let nu = xi.fixed_rows::<3>(3).into_owned();
    let translation = left_jacobian_so3(&omega) * nu;
    Isometry3::from_parts(Translation3::from(translation), so3_exp(&omega))
}

/// SE(3) logarithm map, inverse of [`se3_exp`].
pub fn se3_log(pose: &Isometry3<f64>) -> Vector6<f64> {
    let omega = so3_log(&pose.rotation);
    let nu = left_jacobian_so3(&omega)
        .try_inverse()
        .unwrap_or_else(Matrix3::identity)
        * pose.translation.vector;
    let mut xi = Vector6::zeros();
    xi.fixed_rows_mut::<3>(0).copy_from(&omega);
    xi.fixed_rows_mut::<3>(3).copy_from(&nu);
    xi
}

/// Right retraction `T · Exp(ξ)`.
#[inline]
pub fn retract(pose: &Isometry3<f64>, xi: &Vector6<f64>) -> Isometry3<f64> {
    pose * se3_exp(xi)
}

/// Rotation angle (rad) and translation distance between two poses.
pub fn pose_error(a: &Isometry3<f64>, b: &Isometry3<f64>) -> (f64, f64) {
    let delta = a.inverse() * b;
    (
        delta.rotation.angle(),
        (a.translation.vector - b.translation.vector).norm(),
    )
}

/// Weighted least-squares rigid transform mapping `source` onto `target`
/// (Kabsch/Umeyama without scale).
///
/// Returns `None` for fewer than three pairs, vanishing total weight, or a
/// failed decomposition.
pub fn umeyama(
    source: &[Point3<f64>],
    target: &[Point3<f64>],
    weights: Option<&[f64]>,
) -> Option<Isometry3<f64>> {
    if source.len() < 3 || source.len() != target.len() {
        return None;
    }
    let weight = |i: usize| weights.map_or(1.0, |w| w[i]);

    let mut total_weight = 0.0;
    let mut source_centroid = Vector3::zeros();
    let mut target_centroid = Vector3::zeros();
    for i in 0..source.len() {
        let w = weight(i);
        source_centroid += source[i].coords * w;
        target_centroid += target[i].coords * w;
        total_weight += w;
    }

    if total_weight < 1e-12 {
        return None;
    }
    source_centroid /= total_weight;
    target_centroid /= total_weight;

    let mut covariance = Matrix3::zeros();
    for i in 0..source.len() {
        let src = source[i].coords - source_centroid;
        let tgt = target[i].coords - target_centroid;
        covariance += tgt * src.transpose() * weight(i);
    }

    let svd = covariance.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut u_corrected = u;
        u_corrected.set_column(2, &(u.column(2) * -1.0));
        rotation = u_corrected * v_t;
    }

    let rotation = UnitQuaternion::from_matrix(&rotation);
    let translation = target_centroid - rotation * source_centroid;
    Some(Isometry3::from_parts(Translation3::from(translation), rotation))
}

#[inline]
pub fn to_array(p: &Point3<f64>) -> [f64; 3] {
    [p.x, p.y, p.z]
}
