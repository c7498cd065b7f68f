use faer::{Mat, Side};
use itertools::izip;
use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

use crate::{
    math::{multiply, vector_dot},
    state::State,
};

#[derive(Debug, Error)]
pub enum MassMatrixError {
    #[error("Illegal value on mass matrix diagonal at {index}: {value}")]
    IllegalDiagonal { index: usize, value: f64 },
    #[error("Mass matrix is not positive definite")]
    NotPositiveDefinite,
    #[error("Expected {expected} mass matrix entries, got {actual}")]
    Shape { expected: usize, actual: usize },
}

/// The metric of the euclidean hamiltonian.
///
/// Both variants store the inverse mass matrix, which is the current
/// estimate of the posterior covariance.
#[derive(Debug, Clone)]
pub enum MassMatrix {
    Diag(DiagMassMatrix),
    Dense(DenseMassMatrix),
}

#[derive(Debug, Clone)]
pub struct DiagMassMatrix {
    inv_stds: Box<[f64]>,
    variance: Box<[f64]>,
}

impl DiagMassMatrix {
    pub fn new(ndim: usize) -> Self {
        Self {
            inv_stds: vec![1f64; ndim].into(),
            variance: vec![1f64; ndim].into(),
        }
    }

    pub fn from_variance(variance: &[f64]) -> Result<Self, MassMatrixError> {
        let mut matrix = Self::new(variance.len());
        update_diag(&mut matrix.variance, &mut matrix.inv_stds, variance)?;
        Ok(matrix)
    }

    pub fn variance(&self) -> &[f64] {
        &self.variance
    }
}

fn update_diag(
    variance_out: &mut [f64],
    inv_std_out: &mut [f64],
    new_variance: &[f64],
) -> Result<(), MassMatrixError> {
    if let Some((index, &value)) = new_variance
        .iter()
        .enumerate()
        .find(|&(_, &x)| !x.is_finite() || x <= 0f64)
    {
        return Err(MassMatrixError::IllegalDiagonal { index, value });
    }
    izip!(variance_out, inv_std_out, new_variance).for_each(|(var, inv_std, &x)| {
        *var = x;
        *inv_std = x.recip().sqrt();
    });
    Ok(())
}

/// A full inverse mass matrix `Sigma = L L^T`.
#[derive(Debug, Clone)]
pub struct DenseMassMatrix {
    dim: usize,
    /// Row major `Sigma`
    covariance: Box<[f64]>,
    /// Row major lower cholesky factor of `Sigma`
    chol: Box<[f64]>,
}

impl DenseMassMatrix {
    pub fn new(dim: usize) -> Self {
        let identity: Box<[f64]> = (0..dim * dim)
            .map(|k| if k / dim == k % dim { 1f64 } else { 0f64 })
            .collect();
        Self {
            dim,
            covariance: identity.clone(),
            chol: identity,
        }
    }

    pub fn from_covariance(dim: usize, covariance: &[f64]) -> Result<Self, MassMatrixError> {
        if covariance.len() != dim * dim {
            return Err(MassMatrixError::Shape {
                expected: dim * dim,
                actual: covariance.len(),
            });
        }
        if !covariance.iter().all(|x| x.is_finite()) {
            return Err(MassMatrixError::NotPositiveDefinite);
        }

        let mat = Mat::from_fn(dim, dim, |i, j| {
            0.5 * (covariance[i * dim + j] + covariance[j * dim + i])
        });
        let llt = mat
            .llt(Side::Lower)
            .map_err(|_| MassMatrixError::NotPositiveDefinite)?;
        let lower: Mat<f64> = llt.L().to_owned();

        let chol: Box<[f64]> = (0..dim * dim)
            .map(|k| {
                let (i, j) = (k / dim, k % dim);
                if j <= i {
                    lower[(i, j)]
                } else {
                    0f64
                }
            })
            .collect();
        if (0..dim).any(|i| !(chol[i * dim + i] > 0.)) {
            return Err(MassMatrixError::NotPositiveDefinite);
        }

        Ok(Self {
            dim,
            covariance: (0..dim * dim).map(|k| mat[(k / dim, k % dim)]).collect(),
            chol,
        })
    }

    pub fn covariance(&self) -> &[f64] {
        &self.covariance
    }

    fn row(&self, i: usize) -> &[f64] {
        &self.covariance[i * self.dim..(i + 1) * self.dim]
    }

    /// Solve `L^T p = z` in place.
    fn solve_upper(&self, values: &mut [f64]) {
        let n = self.dim;
        for i in (0..n).rev() {
            let mut total = values[i];
            for j in (i + 1)..n {
                total -= self.chol[j * n + i] * values[j];
            }
            values[i] = total / self.chol[i * n + i];
        }
    }
}

impl MassMatrix {
    pub fn identity(dim: usize, dense: bool) -> Self {
        if dense {
            MassMatrix::Dense(DenseMassMatrix::new(dim))
        } else {
            MassMatrix::Diag(DiagMassMatrix::new(dim))
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            MassMatrix::Diag(matrix) => matrix.variance.len(),
            MassMatrix::Dense(matrix) => matrix.dim,
        }
    }

    pub fn is_dense(&self) -> bool {
        matches!(self, MassMatrix::Dense(_))
    }

    /// Diagonal of the inverse mass matrix.
    pub fn variance_diag(&self) -> Box<[f64]> {
        match self {
            MassMatrix::Diag(matrix) => matrix.variance.clone(),
            MassMatrix::Dense(matrix) => (0..matrix.dim)
                .map(|i| matrix.covariance[i * matrix.dim + i])
                .collect(),
        }
    }

    /// Set `v = M^{-1} p`.
    pub(crate) fn update_velocity(&self, state: &mut State) {
        match self {
            MassMatrix::Diag(matrix) => multiply(&matrix.variance, &state.p, &mut state.v),
            MassMatrix::Dense(matrix) => {
                for (i, v) in state.v.iter_mut().enumerate() {
                    *v = vector_dot(matrix.row(i), &state.p);
                }
            }
        }
    }

    /// Requires an up to date velocity.
    pub(crate) fn update_kinetic_energy(&self, state: &mut State) {
        state.kinetic_energy = 0.5 * vector_dot(&state.p, &state.v);
    }

    /// Draw `p ~ N(0, M)`.
    pub(crate) fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut State, rng: &mut R) {
        match self {
            MassMatrix::Diag(matrix) => {
                state
                    .p
                    .iter_mut()
                    .zip(matrix.inv_stds.iter())
                    .for_each(|(p, &s)| {
                        let norm: f64 = rng.sample(StandardNormal);
                        *p = s * norm;
                    });
            }
            MassMatrix::Dense(matrix) => {
                state
                    .p
                    .iter_mut()
                    .for_each(|p| *p = rng.sample(StandardNormal));
                matrix.solve_upper(&mut state.p);
            }
        }
    }
}
