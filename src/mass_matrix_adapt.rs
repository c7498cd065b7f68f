use serde::Serialize;

use crate::mass_matrix::{DenseMassMatrix, DiagMassMatrix, MassMatrix, MassMatrixError};

/// Shrinkage of the sample covariance towards a multiple of the identity
///
/// `n / (n + k) * cov + scale * k / (n + k) * I` with `k = prior_count`
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MassMatrixRegularization {
    pub prior_count: f64,
    pub scale: f64,
}

impl Default for MassMatrixRegularization {
    fn default() -> Self {
        Self {
            prior_count: 5.,
            scale: 1e-3,
        }
    }
}

/// Welford's online estimate of the mean and (co)variance of the draws in
/// the current adaptation window.
#[derive(Debug, Clone)]
pub struct MassMatrixAdapt {
    dim: usize,
    dense: bool,
    count: u64,
    mean: Box<[f64]>,
    /// Sum of squared deviations, `dim` entries when diagonal, `dim * dim` when dense
    m2: Box<[f64]>,
    delta: Box<[f64]>,
    regularization: Option<MassMatrixRegularization>,
}

impl MassMatrixAdapt {
    pub fn new(dim: usize, dense: bool, regularization: Option<MassMatrixRegularization>) -> Self {
        let m2_size = if dense { dim * dim } else { dim };
        Self {
            dim,
            dense,
            count: 0,
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; m2_size].into(),
            delta: vec![0f64; dim].into(),
            regularization,
        }
    }

    pub fn add_sample(&mut self, position: &[f64]) {
        assert!(position.len() == self.dim);
        self.count += 1;
        let n = self.count as f64;

        for ((delta, mean), &x) in self.delta.iter_mut().zip(self.mean.iter_mut()).zip(position) {
            *delta = x - *mean;
            *mean += *delta / n;
        }

        if self.dense {
            let dim = self.dim;
            for i in 0..dim {
                let delta_i = self.delta[i];
                let row = &mut self.m2[i * dim..(i + 1) * dim];
                for (j, m2) in row.iter_mut().enumerate() {
                    *m2 += delta_i * (position[j] - self.mean[j]);
                }
            }
        } else {
            for ((m2, &delta), (&x, &mean)) in self
                .m2
                .iter_mut()
                .zip(self.delta.iter())
                .zip(position.iter().zip(self.mean.iter()))
            {
                *m2 += delta * (x - mean);
            }
        }
    }

    #[cfg(test)]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[cfg(test)]
    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.mean.fill(0.);
        self.m2.fill(0.);
    }

    /// The unbiased sample (co)variance, without regularization.
    ///
    /// Returns `None` if fewer than two samples were added.
    pub fn sample_covariance(&self) -> Option<Box<[f64]>> {
        if self.count < 2 {
            return None;
        }
        let denom = (self.count - 1) as f64;
        Some(self.m2.iter().map(|m2| m2 / denom).collect())
    }

    fn regularized(&self) -> Option<Box<[f64]>> {
        let mut cov = self.sample_covariance()?;
        let Some(reg) = self.regularization else {
            return Some(cov);
        };

        let n = self.count as f64;
        let weight = n / (n + reg.prior_count);
        let shrinkage = reg.scale * reg.prior_count / (n + reg.prior_count);
        cov.iter_mut().for_each(|val| *val *= weight);
        if self.dense {
            for i in 0..self.dim {
                cov[i * self.dim + i] += shrinkage;
            }
        } else {
            cov.iter_mut().for_each(|val| *val += shrinkage);
        }
        Some(cov)
    }

    /// A mass matrix whose inverse is the regularized covariance estimate.
    ///
    /// `Ok(None)` if the window does not contain enough draws.
    pub fn estimate(&self) -> Result<Option<MassMatrix>, MassMatrixError> {
        let Some(cov) = self.regularized() else {
            return Ok(None);
        };
        let matrix = if self.dense {
            MassMatrix::Dense(DenseMassMatrix::from_covariance(self.dim, &cov)?)
        } else {
            MassMatrix::Diag(DiagMassMatrix::from_variance(&cov)?)
        };
        Ok(Some(matrix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn known_variance() {
        let mut adapt = MassMatrixAdapt::new(2, false, None);
        for x in [1., 2., 3., 4., 5.] {
            adapt.add_sample(&[x, 10. * x]);
        }
        assert_eq!(adapt.count(), 5);
        assert_relative_eq!(adapt.mean()[0], 3.);
        let cov = adapt.sample_covariance().unwrap();
        assert_relative_eq!(cov[0], 2.5, epsilon = 1e-12);
        assert_relative_eq!(cov[1], 250., epsilon = 1e-9);

        adapt.reset();
        assert_eq!(adapt.count(), 0);
        assert!(adapt.sample_covariance().is_none());
        assert!(adapt.estimate().unwrap().is_none());
    }

    #[test]
    fn dense_matches_two_pass() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let normal = Normal::new(0., 2.).unwrap();
        let draws: Vec<[f64; 3]> = (0..200)
            .map(|_| {
                let a = normal.sample(&mut rng);
                let b = normal.sample(&mut rng);
                [a, a + b, 3. - b]
            })
            .collect();

        let mut adapt = MassMatrixAdapt::new(3, true, None);
        draws.iter().for_each(|draw| adapt.add_sample(draw));
        let cov = adapt.sample_covariance().unwrap();

        let n = draws.len() as f64;
        let mean: Vec<f64> = (0..3)
            .map(|i| draws.iter().map(|d| d[i]).sum::<f64>() / n)
            .collect();
        for i in 0..3 {
            for j in 0..3 {
                let expected = draws
                    .iter()
                    .map(|d| (d[i] - mean[i]) * (d[j] - mean[j]))
                    .sum::<f64>()
                    / (n - 1.);
                assert_relative_eq!(cov[i * 3 + j], expected, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn regularization_shrinks_towards_identity() {
        let reg = MassMatrixRegularization::default();
        let mut adapt = MassMatrixAdapt::new(1, false, Some(reg));
        for x in [1., 2., 3., 4., 5.] {
            adapt.add_sample(&[x]);
        }
        let Some(MassMatrix::Diag(matrix)) = adapt.estimate().unwrap() else {
            panic!("Expected a diagonal mass matrix");
        };
        let expected = 5. / 10. * 2.5 + 1e-3 * 5. / 10.;
        assert_relative_eq!(matrix.variance()[0], expected, epsilon = 1e-12);
    }

    #[test]
    fn constant_draws_still_positive() {
        let mut adapt =
            MassMatrixAdapt::new(2, true, Some(MassMatrixRegularization::default()));
        for _ in 0..10 {
            adapt.add_sample(&[1., 1.]);
        }
        let matrix = adapt.estimate().unwrap().unwrap();
        assert!(matrix.is_dense());
        assert!(matrix.variance_diag().iter().all(|&x| x > 0.));
    }
}
