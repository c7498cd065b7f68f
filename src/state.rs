use crate::math::{axpy, axpy_out, scalar_prods2, scalar_prods3};

/// A point in phase space.
///
/// Besides position and momentum this also stores the sum of momentum terms
/// from the initial point of the trajectory to this point, so that the
/// termination criterion can be computed for any pair of states in
/// `is_turning`.
#[derive(Debug, Clone)]
pub struct State {
    pub(crate) q: Box<[f64]>,
    pub(crate) p: Box<[f64]>,
    /// `M^{-1} p`
    pub(crate) v: Box<[f64]>,
    pub(crate) p_sum: Box<[f64]>,
    /// Gradient of the log density at `q`
    pub(crate) grad: Box<[f64]>,
    pub(crate) idx_in_trajectory: i64,
    pub(crate) kinetic_energy: f64,
    pub(crate) potential_energy: f64,
    pub(crate) initial_energy: f64,
}

impl State {
    pub(crate) fn new(dim: usize) -> State {
        State {
            q: vec![0.; dim].into(),
            p: vec![0.; dim].into(),
            v: vec![0.; dim].into(),
            p_sum: vec![0.; dim].into(),
            grad: vec![0.; dim].into(),
            idx_in_trajectory: 0,
            kinetic_energy: 0.,
            potential_energy: 0.,
            initial_energy: 0.,
        }
    }

    pub fn position(&self) -> &[f64] {
        &self.q
    }

    pub fn gradient(&self) -> &[f64] {
        &self.grad
    }

    /// The total energy (potential + kinetic)
    pub fn energy(&self) -> f64 {
        self.kinetic_energy + self.potential_energy
    }

    pub fn logp(&self) -> f64 {
        -self.potential_energy
    }

    pub fn index_in_trajectory(&self) -> i64 {
        self.idx_in_trajectory
    }

    /// Energy relative to the first point of the trajectory.
    pub fn energy_error(&self) -> f64 {
        self.energy() - self.initial_energy
    }

    /// Compute the termination criterion for NUTS
    pub(crate) fn is_turning(&self, other: &Self) -> bool {
        let (start, end) = if self.idx_in_trajectory < other.idx_in_trajectory {
            (self, other)
        } else {
            (other, self)
        };

        let a = start.idx_in_trajectory;
        let b = end.idx_in_trajectory;

        assert!(a < b);
        // rho is the sum of the momenta of all states from start to end
        let (turn1, turn2) = if (a >= 0) & (b >= 0) {
            scalar_prods3(&end.p_sum, &start.p_sum, &start.p, &end.v, &start.v)
        } else if (b >= 0) & (a < 0) {
            scalar_prods2(&end.p_sum, &start.p_sum, &end.v, &start.v)
        } else {
            assert!((a < 0) & (b < 0));
            scalar_prods3(&start.p_sum, &end.p_sum, &end.p, &end.v, &start.v)
        };

        (turn1 < 0.) | (turn2 < 0.)
    }

    /// Initialize the point to be the first in the trajectory.
    pub(crate) fn make_init_point(&mut self) {
        self.idx_in_trajectory = 0;
        self.p_sum.copy_from_slice(&self.p);
        self.initial_energy = self.energy();
    }

    pub(crate) fn first_momentum_halfstep(&self, out: &mut Self, epsilon: f64) {
        axpy_out(&self.grad, &self.p, epsilon / 2., &mut out.p);
    }

    pub(crate) fn position_step(&self, out: &mut Self, epsilon: f64) {
        axpy_out(&out.v, &self.q, epsilon, &mut out.q);
    }

    pub(crate) fn second_momentum_halfstep(&mut self, epsilon: f64) {
        axpy(&self.grad, &mut self.p, epsilon / 2.);
    }

    pub(crate) fn set_psum(&self, out: &mut Self) {
        assert!(out.idx_in_trajectory != 0);

        if out.idx_in_trajectory == -1 {
            out.p_sum.copy_from_slice(&out.p);
        } else {
            axpy_out(&out.p, &self.p_sum, 1., &mut out.p_sum);
        }
    }
}
