use std::{error::Error, sync::Arc};

use rand::Rng;

use crate::{
    integrator::{leapfrog, leapfrog_steps, Direction},
    mass_matrix::MassMatrix,
    nuts::{Collector, NutsError},
    potential::{CpuLogpFunc, LogpError, Potential, PotentialError},
    state::State,
    stepsize::{clamp_step_size, LOWER_LIMIT, UPPER_LIMIT},
};

/// Details about a divergence that might have occured during sampling
///
/// There are two reasons why we might observe a divergence:
/// - The integration error of the Hamiltonian is larger than
///   a cutoff value or nan.
/// - The logp function caused a recoverable error (eg if an ODE solver
///   failed)
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    pub start_momentum: Option<Box<[f64]>>,
    pub start_location: Option<Box<[f64]>>,
    pub start_gradient: Option<Box<[f64]>>,
    pub end_location: Option<Box<[f64]>>,
    pub energy_error: Option<f64>,
    pub end_idx_in_trajectory: Option<i64>,
    pub start_idx_in_trajectory: Option<i64>,
    pub logp_function_error: Option<Arc<dyn Error + Send + Sync>>,
}

pub enum LeapfrogResult<E> {
    Ok(State),
    Divergence(DivergenceInfo),
    Err(E),
}

/// A hamiltonian with a constant euclidean metric.
pub struct EuclideanHamiltonian<F: CpuLogpFunc> {
    potential: Potential<F>,
    pub(crate) mass_matrix: MassMatrix,
    pub(crate) step_size: f64,
    max_energy_error: f64,
}

const MAX_STEP_SIZE_SEARCH: usize = 100;

impl<F: CpuLogpFunc> EuclideanHamiltonian<F> {
    pub fn new(
        potential: Potential<F>,
        mass_matrix: MassMatrix,
        step_size: f64,
        max_energy_error: f64,
    ) -> Self {
        assert!(potential.dim() == mass_matrix.dim());
        EuclideanHamiltonian {
            potential,
            mass_matrix,
            step_size,
            max_energy_error,
        }
    }

    pub fn dim(&self) -> usize {
        self.potential.dim()
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    pub fn mass_matrix(&self) -> &MassMatrix {
        &self.mass_matrix
    }

    pub(crate) fn potential_mut(&mut self) -> &mut Potential<F> {
        &mut self.potential
    }

    pub(crate) fn potential(&self) -> &Potential<F> {
        &self.potential
    }

    /// Perform one leapfrog step in direction `dir`.
    ///
    /// Return either an unrecoverable error, a new state or a divergence.
    pub(crate) fn leapfrog<C: Collector>(
        &mut self,
        start: &State,
        dir: Direction,
        collector: &mut C,
    ) -> LeapfrogResult<PotentialError<F::LogpError>> {
        let mut out = start.clone();
        let epsilon = (dir.sign() as f64) * self.step_size;

        if let Err(logp_error) = leapfrog(
            &mut self.potential,
            &self.mass_matrix,
            start,
            epsilon,
            &mut out,
        ) {
            if !logp_error.is_recoverable() {
                return LeapfrogResult::Err(logp_error);
            }
            let div_info = DivergenceInfo {
                logp_function_error: Some(Arc::new(logp_error)),
                start_location: Some(start.q.clone()),
                start_gradient: Some(start.grad.clone()),
                start_momentum: Some(start.p.clone()),
                end_location: None,
                start_idx_in_trajectory: Some(start.index_in_trajectory()),
                end_idx_in_trajectory: None,
                energy_error: None,
            };
            collector.register_leapfrog(start, &out, Some(&div_info));
            return LeapfrogResult::Divergence(div_info);
        }

        out.idx_in_trajectory = start.index_in_trajectory() + dir.sign();
        start.set_psum(&mut out);

        let energy_error = out.energy_error();
        if (energy_error > self.max_energy_error) | !energy_error.is_finite() {
            let divergence_info = DivergenceInfo {
                logp_function_error: None,
                start_location: Some(start.q.clone()),
                start_gradient: Some(start.grad.clone()),
                start_momentum: Some(start.p.clone()),
                end_location: Some(out.q.clone()),
                start_idx_in_trajectory: Some(start.index_in_trajectory()),
                end_idx_in_trajectory: Some(out.index_in_trajectory()),
                energy_error: Some(energy_error),
            };
            collector.register_leapfrog(start, &out, Some(&divergence_info));
            return LeapfrogResult::Divergence(divergence_info);
        }

        collector.register_leapfrog(start, &out, None);

        LeapfrogResult::Ok(out)
    }

    /// Initialize a state at a new location.
    ///
    /// The momentum is zero, it is set using `initialize_trajectory`.
    pub fn init_state(&mut self, init: &[f64]) -> Result<State, NutsError> {
        if init.len() != self.dim() {
            return Err(NutsError::BadInitDimension {
                expected: self.dim(),
                actual: init.len(),
            });
        }
        let mut state = State::new(self.dim());
        state.q.copy_from_slice(init);
        state.potential_energy = self
            .potential
            .evaluate(&state.q, &mut state.grad)
            .map_err(|err| NutsError::BadInitPosition(Box::new(err)))?;
        Ok(state)
    }

    /// Draw a new momentum and make `state` the first point of a trajectory.
    pub(crate) fn initialize_trajectory<R: Rng + ?Sized>(&self, state: &mut State, rng: &mut R) {
        self.mass_matrix.randomize_momentum(state, rng);
        self.mass_matrix.update_velocity(state);
        self.mass_matrix.update_kinetic_energy(state);
        state.make_init_point();
    }

    pub(crate) fn is_turning(&self, state1: &State, state2: &State) -> bool {
        state1.is_turning(state2)
    }

    pub(crate) fn set_mass_matrix(&mut self, mass_matrix: MassMatrix) {
        assert!(mass_matrix.dim() == self.dim());
        self.mass_matrix = mass_matrix;
    }

    pub(crate) fn set_step_size(&mut self, step_size: f64) {
        self.step_size = clamp_step_size(step_size);
    }

    /// Heuristic for an initial step size.
    ///
    /// Doubles or halves the step size until the acceptance probability of a
    /// single leapfrog step from `state`, with a fresh momentum for every
    /// trial, crosses 0.8. The step size found is stored and returned.
    pub fn find_reasonable_step_size<R: Rng + ?Sized>(&mut self, state: &State, rng: &mut R) -> f64 {
        let target = 0.8f64.ln();
        let mut step_size = clamp_step_size(self.step_size);
        let mut last_direction = 0i32;
        let mut direction = 0i32;

        let mut trial = state.clone();

        for _ in 0..MAX_STEP_SIZE_SEARCH {
            let not_small = (step_size > LOWER_LIMIT) | (direction >= 0);
            let not_large = (step_size < UPPER_LIMIT) | (direction <= 0);
            let same_direction = (last_direction == 0) | (direction == last_direction);
            if !(not_small & not_large & same_direction) {
                break;
            }

            step_size = clamp_step_size(2f64.powi(direction) * step_size);
            self.initialize_trajectory(&mut trial, rng);

            let new_direction = match leapfrog_steps(
                &mut self.potential,
                &self.mass_matrix,
                &trial,
                step_size,
                1,
            ) {
                Ok(out) => {
                    let delta_energy = out.energy() - trial.energy();
                    if target < -delta_energy {
                        1
                    } else {
                        -1
                    }
                }
                Err(_) => -1,
            };
            last_direction = direction;
            direction = new_direction;
        }

        log::debug!("Heuristic initial step size {step_size}");
        self.step_size = step_size;
        step_size
    }
}
