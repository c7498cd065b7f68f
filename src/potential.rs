use std::error::Error;

use thiserror::Error;

use crate::{
    math::all_finite,
    model::{expand_transforms, Model},
    transform::Transform,
};

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: Error + Send + Sync + 'static {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

/// A log density and its gradient on the unconstrained space.
pub trait CpuLogpFunc {
    type LogpError: LogpError;

    fn dim(&self) -> usize;

    /// Return the log density at `position` and write its gradient into `gradient`.
    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError>;

    /// Map an unconstrained position to the values that are reported as a draw.
    fn expand_vector(&mut self, position: &[f64], out: &mut [f64]) {
        out.copy_from_slice(position);
    }
}

#[derive(Debug, Error)]
pub enum PotentialError<E: LogpError> {
    #[error("Error during logp evaluation")]
    Logp(#[source] E),
    #[error("Logp or its gradient is not finite")]
    NonFinite,
}

impl<E: LogpError> LogpError for PotentialError<E> {
    fn is_recoverable(&self) -> bool {
        match self {
            PotentialError::Logp(err) => err.is_recoverable(),
            PotentialError::NonFinite => true,
        }
    }
}

/// Evaluates the potential energy `-logp` of a log density.
///
/// Non-finite values are turned into a recoverable error, so that callers
/// can reject the point instead of carrying NaN through the trajectory.
pub struct Potential<F> {
    logp: F,
    num_evals: u64,
}

impl<F: CpuLogpFunc> Potential<F> {
    pub fn new(logp: F) -> Self {
        Potential { logp, num_evals: 0 }
    }

    pub fn dim(&self) -> usize {
        self.logp.dim()
    }

    /// Return the potential energy at `position`.
    ///
    /// `gradient` receives the gradient of the log density, not of the potential.
    pub fn evaluate(
        &mut self,
        position: &[f64],
        gradient: &mut [f64],
    ) -> Result<f64, PotentialError<F::LogpError>> {
        assert!(position.len() == self.dim());
        assert!(gradient.len() == self.dim());
        self.num_evals += 1;

        let logp = self
            .logp
            .logp(position, gradient)
            .map_err(PotentialError::Logp)?;
        if !logp.is_finite() || !all_finite(gradient) {
            return Err(PotentialError::NonFinite);
        }
        Ok(-logp)
    }

    pub fn expand_vector(&mut self, position: &[f64], out: &mut [f64]) {
        self.logp.expand_vector(position, out)
    }

    /// Number of calls to the log density so far.
    pub fn num_evals(&self) -> u64 {
        self.num_evals
    }

    pub fn logp_func(&self) -> &F {
        &self.logp
    }
}

/// The log density of a [`Model`] in unconstrained coordinates.
///
/// Adds `log|dtheta/dz|` of every site transform to the model density and
/// applies the chain rule to its gradient.
pub struct TransformedLogp<'model, M: Model> {
    model: &'model M,
    transforms: Box<[Transform]>,
    values: Box<[f64]>,
    gradient: Box<[f64]>,
}

impl<'model, M: Model> TransformedLogp<'model, M> {
    pub fn new(model: &'model M) -> Self {
        let transforms = expand_transforms(model.sites());
        let dim = transforms.len();
        TransformedLogp {
            model,
            transforms,
            values: vec![0f64; dim].into(),
            gradient: vec![0f64; dim].into(),
        }
    }

    /// Map constrained values to the unconstrained space.
    pub fn unconstrain(&self, values: &[f64], out: &mut [f64]) {
        assert!(values.len() == self.transforms.len());
        self.transforms
            .iter()
            .zip(values.iter().zip(out.iter_mut()))
            .for_each(|(transform, (&theta, z))| *z = transform.inverse(theta));
    }

    pub fn model(&self) -> &'model M {
        self.model
    }
}

impl<M: Model> CpuLogpFunc for TransformedLogp<'_, M> {
    type LogpError = M::LogpError;

    fn dim(&self) -> usize {
        self.transforms.len()
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError> {
        self.transforms
            .iter()
            .zip(position.iter().zip(self.values.iter_mut()))
            .for_each(|(transform, (&z, theta))| *theta = transform.forward(z));

        let logp = self.model.logp(&self.values, &mut self.gradient)?;

        let mut log_jac = 0f64;
        for (i, transform) in self.transforms.iter().enumerate() {
            let z = position[i];
            if transform.is_identity() {
                gradient[i] = self.gradient[i];
                continue;
            }
            gradient[i] =
                self.gradient[i] * transform.jacobian(z) + transform.grad_log_abs_det_jacobian(z);
            log_jac += transform.log_abs_det_jacobian(z);
        }
        Ok(logp + log_jac)
    }

    fn expand_vector(&mut self, position: &[f64], out: &mut [f64]) {
        self.transforms
            .iter()
            .zip(position.iter().zip(out.iter_mut()))
            .for_each(|(transform, (&z, theta))| *theta = transform.forward(z));
    }
}
