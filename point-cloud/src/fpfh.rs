//! Fast point feature histograms
//!
//! Each point gets a 33-bin signature: three 11-bin histograms of the Darboux
//! frame angles `(f1, f2, f3)` between the point and its radius neighbors.
//! Each simplified histogram (SPFH) channel sums to 100; the final FPFH adds
//! the inverse squared distance weighted sum of the neighbors' SPFH, itself
//! renormalized to 100 per channel.

use std::f64::consts::PI;

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use cloudreg_core::{ensure_len, to_array, Error, FpfhSignature, PointSource, Result, FPFH_DIM};
use cloudreg_spatial::KdTree;

const NUM_BINS: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FpfhParams {
    pub search_radius: f64,
    pub num_threads: usize,
}

impl Default for FpfhParams {
    fn default() -> Self {
        Self {
            search_radius: 5.0,
            num_threads: 4,
        }
    }
}

/// Estimate FPFH descriptors for every point of `cloud`.
///
/// `tree` must index the points of `cloud`. Points with a zero normal get an
/// all-zero descriptor and are skipped as neighbors.
pub fn estimate_fpfh<P: PointSource + ?Sized>(
    cloud: &P,
    tree: &KdTree<3>,
    params: &FpfhParams,
) -> Result<Vec<FpfhSignature>> {
    if !cloud.has_normals() {
        return Err(Error::MissingAttribute("normals"));
    }
    ensure_len("kd-tree points", cloud.size(), tree.len())?;

    let n = cloud.size();
    let points: Vec<Point3<f64>> = (0..n).map(|i| cloud.point(i)).collect();
    let normals: Vec<Vector3<f64>> = (0..n)
        .map(|i| cloud.normal(i).unwrap_or_else(Vector3::zeros))
        .collect();
    let has_normal = |i: usize| normals[i].norm_squared() > 0.0;

    let fpfh = cloudreg_core::runtime::install(params.num_threads, || {
        let neighborhoods: Vec<Vec<(usize, f64)>> = (0..n)
            .into_par_iter()
            .map(|i| {
                tree.radius_search(&to_array(&points[i]), params.search_radius)
                    .into_iter()
                    .filter(|nb| nb.index != i && has_normal(nb.index))
                    .map(|nb| (nb.index, nb.sq_dist))
                    .collect()
            })
            .collect();

        // 1. Simplified point feature histograms
        let spfh: Vec<FpfhSignature> = (0..n)
            .into_par_iter()
            .map(|i| {
                if !has_normal(i) {
                    return [0.0; FPFH_DIM];
                }
                let features: Vec<(f64, f64, f64)> = neighborhoods[i]
                    .iter()
                    .filter_map(|&(j, _)| pair_features(&points[i], &normals[i], &points[j], &normals[j]))
                    .collect();

                let mut hist = [0.0; FPFH_DIM];
                if features.is_empty() {
                    return hist;
                }
                let increment = 100.0 / features.len() as f64;
                for (f1, f2, f3) in features {
                    hist[bin((f1 + PI) / (2.0 * PI))] += increment;
                    hist[NUM_BINS + bin((f2 + 1.0) * 0.5)] += increment;
                    hist[2 * NUM_BINS + bin((f3 + 1.0) * 0.5)] += increment;
                }
                hist
            })
            .collect();

        // 2. Add the weighted neighbor histograms
        (0..n)
            .into_par_iter()
            .map(|i| {
                if !has_normal(i) {
                    return [0.0; FPFH_DIM];
                }

                let mut weighted = [0.0; FPFH_DIM];
                for &(j, sq_dist) in &neighborhoods[i] {
                    if sq_dist <= 0.0 {
                        continue;
                    }
                    let w = 1.0 / sq_dist;
                    for (acc, v) in weighted.iter_mut().zip(spfh[j].iter()) {
                        *acc += v * w;
                    }
                }

                let mut hist = spfh[i];
                for channel in 0..3 {
                    let range = channel * NUM_BINS..(channel + 1) * NUM_BINS;
                    let sum: f64 = weighted[range.clone()].iter().sum();
                    if sum > 0.0 {
                        let scale = 100.0 / sum;
                        for k in range {
                            hist[k] += weighted[k] * scale;
                        }
                    }
                }
                hist
            })
            .collect::<Vec<_>>()
    });

    tracing::debug!(num_points = n, search_radius = params.search_radius, "estimated FPFH");
    Ok(fpfh)
}

/// Map a value normalized to `[0, 1]` to a bin index.
#[inline]
fn bin(normalized: f64) -> usize {
    ((NUM_BINS as f64 * normalized).floor().max(0.0) as usize).min(NUM_BINS - 1)
}

/// Darboux frame angles `(f1 ∈ [-π, π], f2 ∈ [-1, 1], f3 ∈ [-1, 1])` of a
/// point pair. The source of the frame is the point whose normal makes the
/// smaller angle with the connecting line. `None` for coincident points or a
/// connecting line parallel to the frame normal.
fn pair_features(
    p1: &Point3<f64>,
    n1: &Vector3<f64>,
    p2: &Point3<f64>,
    n2: &Vector3<f64>,
) -> Option<(f64, f64, f64)> {
    let mut delta = p2 - p1;
    let dist = delta.norm();
    if dist <= 0.0 {
        return None;
    }

    let angle1 = n1.dot(&delta) / dist;
    let angle2 = n2.dot(&delta) / dist;

    let (u, n_other, f3) = if angle1.abs().acos() > angle2.abs().acos() {
        delta = -delta;
        (n2, n1, -angle2)
    } else {
        (n1, n2, angle1)
    };

    let v = delta.cross(u);
    let v_norm = v.norm();
    if v_norm <= 0.0 {
        return None;
    }
    let v = v / v_norm;
    let w = u.cross(&v);

    let f2 = v.dot(n_other);
    let f1 = w.dot(n_other).atan2(u.dot(n_other));
    Some((f1, f2, f3))
}
