use std::ops::{Add, AddAssign};

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use rayon::prelude::*;

/// Points per partial system. Partial systems are summed in chunk order, so
/// the result does not depend on the number of worker threads.
pub const CHUNK_SIZE: usize = 256;

/// Quadratic model of an alignment cost around the evaluated state.
///
/// `error = ½ Σ rᵀ Ω r`, `gradient = Σ Jᵀ Ω r`, `hessian = Σ Jᵀ Ω J` over the
/// points with a valid correspondence.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearizedSystem<const N: usize> {
    pub error: f64,
    pub gradient: SVector<f64, N>,
    pub hessian: SMatrix<f64, N, N>,
    pub num_inliers: usize,
}

impl<const N: usize> Default for LinearizedSystem<N> {
    fn default() -> Self {
        Self::zeros()
    }
}

impl<const N: usize> LinearizedSystem<N> {
    pub fn zeros() -> Self {
        Self {
            error: 0.0,
            gradient: SVector::zeros(),
            hessian: SMatrix::zeros(),
            num_inliers: 0,
        }
    }

    /// Add one residual with its Jacobian and information matrix.
    pub fn accumulate(
        &mut self,
        residual: &Vector3<f64>,
        jacobian: &SMatrix<f64, 3, N>,
        information: &Matrix3<f64>,
    ) {
        let weighted = information * residual;
        let jt_info = jacobian.transpose() * information;
        self.error += 0.5 * residual.dot(&weighted);
        self.gradient += jacobian.transpose() * weighted;
        self.hessian += jt_info * jacobian;
        self.num_inliers += 1;
    }
}

impl<const N: usize> AddAssign for LinearizedSystem<N> {
    fn add_assign(&mut self, rhs: Self) {
        self.error += rhs.error;
        self.gradient += rhs.gradient;
        self.hessian += rhs.hessian;
        self.num_inliers += rhs.num_inliers;
    }
}

impl<const N: usize> Add for LinearizedSystem<N> {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

/// One point's contribution: residual, Jacobian and information matrix.
pub(crate) type PointTerm<const N: usize> = (Vector3<f64>, SMatrix<f64, 3, N>, Matrix3<f64>);

/// Sum `term(i)` over `0..num_points` in fixed chunks evaluated in parallel.
pub(crate) fn accumulate_chunks<const N: usize, F>(
    num_points: usize,
    num_threads: usize,
    term: F,
) -> LinearizedSystem<N>
where
    F: Fn(usize) -> Option<PointTerm<N>> + Sync,
{
    let num_chunks = num_points.div_ceil(CHUNK_SIZE);
    let partials: Vec<LinearizedSystem<N>> = cloudreg_core::runtime::install(num_threads, || {
        (0..num_chunks)
            .into_par_iter()
            .map(|chunk| {
                let begin = chunk * CHUNK_SIZE;
                let end = (begin + CHUNK_SIZE).min(num_points);
                let mut system = LinearizedSystem::zeros();
                for (r, j, info) in (begin..end).filter_map(&term) {
                    system.accumulate(&r, &j, &info);
                }
                system
            })
            .collect()
    });

    partials
        .into_iter()
        .fold(LinearizedSystem::zeros(), |acc, partial| acc + partial)
}
