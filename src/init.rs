use rand::{distr::Uniform, Rng};
use serde::Serialize;
use thiserror::Error;

use crate::{
    chain::NutsChain,
    model::{expand_transforms, Model},
    nuts::NutsError,
    potential::TransformedLogp,
    transform::Transform,
};

/// How the first position of a chain is chosen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum InitStrategy {
    /// Start at fixed values in constrained space.
    Value(Vec<f64>),
    /// Start at a draw from the prior.
    Prior,
    /// Start at the coordinatewise median of `num_samples` prior draws.
    /// Retries use single prior draws.
    Median { num_samples: usize },
    /// Start at a uniform draw from `(-radius, radius)` in unconstrained space.
    Uniform { radius: f64 },
}

impl Default for InitStrategy {
    fn default() -> Self {
        InitStrategy::Uniform { radius: 2. }
    }
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("No valid initial point found for chain {chain} after {tries} attempts")]
    NoValidPoint {
        chain: u64,
        tries: usize,
        #[source]
        source: Option<NutsError>,
    },
    #[error("Initial values have length {actual}, the model has dimension {expected}")]
    BadLength { expected: usize, actual: usize },
    #[error("Radius of uniform initialization must be positive and finite, got {0}")]
    BadRadius(f64),
    #[error("Could not draw initial values from the prior")]
    Prior(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl InitStrategy {
    /// Write a candidate for the unconstrained initial position into `position`.
    ///
    /// `attempt` counts the previous proposals that were rejected.
    pub fn propose<M: Model, R: Rng + ?Sized>(
        &self,
        model: &M,
        attempt: usize,
        rng: &mut R,
        position: &mut [f64],
    ) -> Result<(), InitError> {
        let transforms = expand_transforms(model.sites());
        assert!(transforms.len() == position.len());

        match self {
            InitStrategy::Value(values) => {
                if values.len() != position.len() {
                    return Err(InitError::BadLength {
                        expected: position.len(),
                        actual: values.len(),
                    });
                }
                unconstrain(&transforms, values, position);
            }
            InitStrategy::Uniform { radius } => {
                let dist =
                    Uniform::new(-radius, *radius).map_err(|_| InitError::BadRadius(*radius))?;
                position.iter_mut().for_each(|x| *x = rng.sample(dist));
            }
            InitStrategy::Prior => {
                let values = prior_draw(model, rng, position.len())?;
                unconstrain(&transforms, &values, position);
            }
            InitStrategy::Median { num_samples } if attempt == 0 => {
                let draws = (0..*num_samples)
                    .map(|_| prior_draw(model, rng, position.len()))
                    .collect::<Result<Vec<_>, _>>()?;
                let median: Vec<f64> = (0..position.len())
                    .map(|i| {
                        let mut column: Vec<f64> = draws.iter().map(|draw| draw[i]).collect();
                        column.sort_unstable_by(f64::total_cmp);
                        median_sorted(&column)
                    })
                    .collect();
                unconstrain(&transforms, &median, position);
            }
            InitStrategy::Median { .. } => {
                let values = prior_draw(model, rng, position.len())?;
                unconstrain(&transforms, &values, position);
            }
        }
        Ok(())
    }

    /// Only random strategies can produce a different proposal on retry.
    pub fn is_random(&self) -> bool {
        !matches!(self, InitStrategy::Value(_))
    }
}

fn prior_draw<M: Model, R: Rng + ?Sized>(
    model: &M,
    rng: &mut R,
    dim: usize,
) -> Result<Vec<f64>, InitError> {
    let mut values = vec![0f64; dim];
    model
        .sample_prior(rng, &mut values)
        .map_err(|err| InitError::Prior(err.into()))?;
    Ok(values)
}

fn unconstrain(transforms: &[Transform], values: &[f64], out: &mut [f64]) {
    transforms
        .iter()
        .zip(values.iter().zip(out.iter_mut()))
        .for_each(|(transform, (&theta, z))| *z = transform.inverse(theta));
}

fn median_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

/// Propose initial points until the log density and its gradient are
/// finite, at most `max_tries` times.
pub fn initialize_chain<M: Model, R: Rng>(
    chain: &mut NutsChain<TransformedLogp<'_, M>, R>,
    strategy: &InitStrategy,
    max_tries: usize,
) -> Result<(), InitError> {
    let model = chain.logp_func().model();
    let mut position = vec![0f64; chain.dim()];
    let tries = if strategy.is_random() { max_tries } else { 1 };

    let mut last_error = None;
    for attempt in 0..tries {
        strategy.propose(model, attempt, chain.rng_mut(), &mut position)?;
        match chain.set_position(&position) {
            Ok(()) => return Ok(()),
            Err(err) => {
                log::warn!(
                    "Rejected initial point of chain {} (attempt {}): {}",
                    chain.chain_id(),
                    attempt + 1,
                    err
                );
                last_error = Some(err);
            }
        }
    }
    Err(InitError::NoValidPoint {
        chain: chain.chain_id(),
        tries,
        source: last_error,
    })
}
