use rand::distr::{Distribution, StandardUniform};

use crate::{
    mass_matrix::MassMatrix,
    potential::{CpuLogpFunc, Potential, PotentialError},
    state::State,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn sign(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// One kick-drift-kick leapfrog step of size `epsilon` from `start` into `out`.
///
/// A negative `epsilon` integrates backward in time. The index in the
/// trajectory and the momentum sum of `out` are not touched. On error `out`
/// holds the new position but stale momentum and energies.
pub(crate) fn leapfrog<F: CpuLogpFunc>(
    potential: &mut Potential<F>,
    mass_matrix: &MassMatrix,
    start: &State,
    epsilon: f64,
    out: &mut State,
) -> Result<(), PotentialError<F::LogpError>> {
    start.first_momentum_halfstep(out, epsilon);
    mass_matrix.update_velocity(out);
    start.position_step(out, epsilon);

    out.potential_energy = potential.evaluate(&out.q, &mut out.grad)?;

    out.second_momentum_halfstep(epsilon);
    mass_matrix.update_velocity(out);
    mass_matrix.update_kinetic_energy(out);
    out.initial_energy = start.initial_energy;
    Ok(())
}

/// Chain `num_steps` leapfrog steps.
///
/// The gradient computed at the end of one step is reused by the first half
/// step of the next, so every step costs a single gradient evaluation.
pub(crate) fn leapfrog_steps<F: CpuLogpFunc>(
    potential: &mut Potential<F>,
    mass_matrix: &MassMatrix,
    start: &State,
    epsilon: f64,
    num_steps: usize,
) -> Result<State, PotentialError<F::LogpError>> {
    let mut current = start.clone();
    let mut next = start.clone();
    for _ in 0..num_steps {
        leapfrog(potential, mass_matrix, &current, epsilon, &mut next)?;
        std::mem::swap(&mut current, &mut next);
    }
    Ok(current)
}
