use rand::Rng;
use thiserror::Error;

use crate::{
    hamiltonian::{DivergenceInfo, EuclideanHamiltonian, LeapfrogResult},
    integrator::Direction,
    math::logaddexp,
    potential::CpuLogpFunc,
    state::State,
};

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum NutsError {
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Could not evaluate the log density at the initial position")]
    BadInitPosition(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Initial position has length {actual}, expected {expected}")]
    BadInitDimension { expected: usize, actual: usize },

    #[error("The chain has already produced all requested draws")]
    ChainFinished,

    #[error("The chain has no position yet, call set_position first")]
    Uninitialized,
}

pub type Result<T> = std::result::Result<T, NutsError>;

/// Callbacks for various events during a Nuts sampling step.
///
/// Collectors can compute statistics like the mean acceptance rate
/// or collect data for mass matrix adaptation.
pub trait Collector {
    fn register_leapfrog(
        &mut self,
        _start: &State,
        _end: &State,
        _divergence_info: Option<&DivergenceInfo>,
    ) {
    }
    fn register_draw(&mut self, _state: &State, _info: &SampleInfo) {}
    fn register_init(&mut self, _state: &State, _options: &NutsOptions) {}
}

#[cfg(test)]
pub struct NullCollector;

#[cfg(test)]
impl Collector for NullCollector {}

/// Information about a draw, exported as part of the sampler stats
#[derive(Debug)]
pub struct SampleInfo {
    /// The depth of the trajectory that this point was sampled from
    pub depth: u64,

    /// More detailed information about a divergence that might have
    /// occured in the trajectory.
    pub divergence_info: Option<DivergenceInfo>,

    /// Whether the trajectory was terminated because it reached
    /// the maximum tree depth.
    pub reached_maxdepth: bool,
}

/// A part of the trajectory tree during NUTS sampling.
struct NutsTree {
    /// The left position of the tree.
    ///
    /// The left side always has the smaller index_in_trajectory.
    /// Leapfrogs in backward direction will replace the left.
    left: State,
    right: State,

    /// A draw from the trajectory between left and right using
    /// multinomial sampling.
    draw: State,
    log_size: f64,
    depth: u64,

    /// A tree is the main tree if it contains the initial point
    /// of the trajectory.
    is_main: bool,
}

enum ExtendResult {
    /// The tree extension succeeded properly, and the termination
    /// criterion was not reached.
    Ok(NutsTree),
    /// An unrecoverable error happend during a leapfrog step
    Err(NutsError),
    /// Tree extension succeeded and the termination criterion
    /// was reached.
    Turning(NutsTree),
    /// A divergence happend during tree extension.
    Diverging(NutsTree, DivergenceInfo),
}

impl NutsTree {
    fn new(state: State) -> NutsTree {
        NutsTree {
            right: state.clone(),
            left: state.clone(),
            draw: state,
            depth: 0,
            log_size: 0.,
            is_main: true,
        }
    }

    #[inline]
    fn extend<F, R, C>(
        mut self,
        rng: &mut R,
        hamiltonian: &mut EuclideanHamiltonian<F>,
        direction: Direction,
        collector: &mut C,
    ) -> ExtendResult
    where
        F: CpuLogpFunc,
        R: Rng + ?Sized,
        C: Collector,
    {
        let mut other = match self.single_step(hamiltonian, direction, collector) {
            Ok(Ok(tree)) => tree,
            Ok(Err(info)) => return ExtendResult::Diverging(self, info),
            Err(err) => return ExtendResult::Err(err),
        };

        while other.depth < self.depth {
            use ExtendResult::*;
            other = match other.extend(rng, hamiltonian, direction, collector) {
                Ok(tree) => tree,
                Turning(_) => {
                    return Turning(self);
                }
                Diverging(_, info) => {
                    return Diverging(self, info);
                }
                Err(error) => {
                    return Err(error);
                }
            };
        }

        let (first, last) = match direction {
            Direction::Forward => (&self.left, &other.right),
            Direction::Backward => (&other.left, &self.right),
        };

        let mut turning = hamiltonian.is_turning(first, last);
        if self.depth > 0 {
            if !turning {
                turning = hamiltonian.is_turning(&self.right, &other.right);
            }
            if !turning {
                turning = hamiltonian.is_turning(&self.left, &other.left);
            }
        }

        self.merge_into(other, rng, direction);

        if turning {
            ExtendResult::Turning(self)
        } else {
            ExtendResult::Ok(self)
        }
    }

    /// Biased progressive sampling when merging into the main tree,
    /// multinomial sampling within subtrees.
    #[inline]
    fn merge_into<R: Rng + ?Sized>(&mut self, other: NutsTree, rng: &mut R, direction: Direction) {
        assert!(self.depth == other.depth);
        assert!(self.left.index_in_trajectory() <= self.right.index_in_trajectory());
        match direction {
            Direction::Forward => {
                self.right = other.right;
            }
            Direction::Backward => {
                self.left = other.left;
            }
        }
        let log_size = logaddexp(self.log_size, other.log_size);

        let self_log_size = if self.is_main {
            assert!(self.left.index_in_trajectory() <= 0);
            assert!(self.right.index_in_trajectory() >= 0);
            self.log_size
        } else {
            log_size
        };

        if (other.log_size >= self_log_size)
            || (rng.random::<f64>().ln() < other.log_size - self_log_size)
        {
            self.draw = other.draw;
        }

        self.depth += 1;
        self.log_size = log_size;
    }

    #[inline]
    fn single_step<F: CpuLogpFunc, C: Collector>(
        &self,
        hamiltonian: &mut EuclideanHamiltonian<F>,
        direction: Direction,
        collector: &mut C,
    ) -> Result<std::result::Result<NutsTree, DivergenceInfo>> {
        let start = match direction {
            Direction::Forward => &self.right,
            Direction::Backward => &self.left,
        };
        let end = match hamiltonian.leapfrog(start, direction, collector) {
            LeapfrogResult::Ok(end) => end,
            LeapfrogResult::Divergence(info) => return Ok(Err(info)),
            LeapfrogResult::Err(error) => return Err(NutsError::LogpFailure(Box::new(error))),
        };

        let log_size = -end.energy_error();
        Ok(Ok(NutsTree {
            right: end.clone(),
            left: end.clone(),
            draw: end,
            depth: 0,
            log_size,
            is_main: false,
        }))
    }

    fn info(&self, maxdepth: bool, divergence_info: Option<DivergenceInfo>) -> SampleInfo {
        SampleInfo {
            depth: self.depth,
            divergence_info,
            reached_maxdepth: maxdepth,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NutsOptions {
    pub maxdepth: u64,
}

impl Default for NutsOptions {
    fn default() -> Self {
        NutsOptions { maxdepth: 10 }
    }
}

/// Draw a new momentum at `init` and build a trajectory by repeated doubling.
///
/// If the first leapfrog step diverges the returned state is `init` itself.
pub(crate) fn draw<F, R, C>(
    init: &mut State,
    rng: &mut R,
    hamiltonian: &mut EuclideanHamiltonian<F>,
    options: &NutsOptions,
    collector: &mut C,
) -> Result<(State, SampleInfo)>
where
    F: CpuLogpFunc,
    R: Rng + ?Sized,
    C: Collector,
{
    hamiltonian.initialize_trajectory(init, rng);
    collector.register_init(init, options);

    let mut tree = NutsTree::new(init.clone());
    while tree.depth < options.maxdepth {
        let direction: Direction = rng.random();
        tree = match tree.extend(rng, hamiltonian, direction, collector) {
            ExtendResult::Ok(tree) => tree,
            ExtendResult::Turning(tree) => {
                let info = tree.info(false, None);
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Diverging(tree, info) => {
                let info = tree.info(false, Some(info));
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Err(error) => {
                return Err(error);
            }
        };
    }
    let info = tree.info(true, None);
    collector.register_draw(&tree.draw, &info);
    Ok((tree.draw, info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mass_matrix::MassMatrix,
        potential::{LogpError, Potential},
        sampler::test_logps::NormalLogp,
        stepsize::AcceptanceRateCollector,
    };
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn hamiltonian(
        logp: NormalLogp,
        step_size: f64,
    ) -> EuclideanHamiltonian<NormalLogp> {
        let dim = logp.dim();
        EuclideanHamiltonian::new(
            Potential::new(logp),
            MassMatrix::identity(dim, false),
            step_size,
            1000.,
        )
    }

    /// Whether merging the two halves of `states[lo..lo + len]` hits the
    /// termination criterion, including the checks across the halves.
    fn merge_turning(states: &[State], lo: usize, len: usize) -> bool {
        let half = len / 2;
        let (mid, hi) = (lo + half, lo + len - 1);
        states[lo].is_turning(&states[hi])
            || (half > 1
                && (states[mid - 1].is_turning(&states[hi])
                    || states[lo].is_turning(&states[mid])))
    }

    /// Whether any merge while building the subtree over `states[lo..lo + len]` turns.
    fn subtree_turning(states: &[State], lo: usize, len: usize) -> bool {
        if len < 2 {
            return false;
        }
        let half = len / 2;
        subtree_turning(states, lo, half)
            || subtree_turning(states, lo + half, half)
            || merge_turning(states, lo, len)
    }

    /// Depth of a tree that only extends forward, from the explicit trajectory.
    ///
    /// A turning new subtree is dropped, a turning merge keeps the doubled tree.
    fn forward_depth(states: &[State], maxdepth: u64) -> u64 {
        for depth in 1..=maxdepth {
            let half = 1usize << (depth - 1);
            if subtree_turning(states, half, half) {
                return depth - 1;
            }
            if merge_turning(states, 0, 2 * half) {
                return depth;
            }
        }
        maxdepth
    }

    #[test]
    fn stops_at_first_u_turn() {
        let maxdepth = 12;
        for (dim, step_size) in [(1, 0.01), (1, 0.1), (1, 0.4), (3, 0.05)] {
            let mut hamiltonian = hamiltonian(NormalLogp::new(dim, 0.), step_size);
            let mut rng = ChaCha8Rng::seed_from_u64(7);
            let position = vec![1.; dim];

            for _ in 0..10 {
                let mut init = hamiltonian.init_state(&position).unwrap();
                hamiltonian.initialize_trajectory(&mut init, &mut rng);

                let mut states = vec![init.clone()];
                while states.len() < 1 << maxdepth {
                    let last = states.last().unwrap();
                    match hamiltonian.leapfrog(last, Direction::Forward, &mut NullCollector) {
                        LeapfrogResult::Ok(next) => states.push(next),
                        _ => panic!("Leapfrog failed on a normal"),
                    }
                }
                let expected = forward_depth(&states, maxdepth);
                assert!(expected >= 1);
                assert!(expected < maxdepth);

                let mut tree = NutsTree::new(init);
                let depth = loop {
                    assert!(tree.depth < maxdepth);
                    tree = match tree.extend(
                        &mut rng,
                        &mut hamiltonian,
                        Direction::Forward,
                        &mut NullCollector,
                    ) {
                        ExtendResult::Ok(tree) => tree,
                        ExtendResult::Turning(tree) => break tree.depth,
                        _ => panic!("Unexpected divergence or error"),
                    };
                };
                assert_eq!(depth, expected, "dim {dim} step size {step_size}");
            }
        }
    }

    #[test]
    fn reaches_maxdepth() {
        let mut hamiltonian = hamiltonian(NormalLogp::new(1, 0.), 1e-4);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let options = NutsOptions { maxdepth: 4 };
        let mut state = hamiltonian.init_state(&[0.5]).unwrap();
        let mut collector = AcceptanceRateCollector::new();
        let (_, info) =
            draw(&mut state, &mut rng, &mut hamiltonian, &options, &mut collector).unwrap();
        assert!(info.reached_maxdepth);
        assert_eq!(info.depth, 4);
        assert_eq!(collector.num_steps(), 16);
        assert!(collector.mean_acceptance_rate() > 0.99);
    }

    #[test]
    fn samples_standard_normal() {
        let mut hamiltonian = hamiltonian(NormalLogp::new(2, 0.), 0.6);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let options = NutsOptions::default();

        let mut state = hamiltonian.init_state(&[0.3, -0.2]).unwrap();
        let n = 4000;
        let mut sum = [0f64; 2];
        let mut sum_sq = [0f64; 2];
        for _ in 0..n {
            let (next, _) =
                draw(&mut state, &mut rng, &mut hamiltonian, &options, &mut NullCollector)
                    .unwrap();
            for i in 0..2 {
                sum[i] += next.q[i];
                sum_sq[i] += next.q[i] * next.q[i];
            }
            state = next;
        }
        for i in 0..2 {
            let mean = sum[i] / n as f64;
            let var = sum_sq[i] / n as f64 - mean * mean;
            assert_abs_diff_eq!(mean, 0., epsilon = 0.1);
            assert_abs_diff_eq!(var, 1., epsilon = 0.15);
        }
    }

    #[derive(Debug, Error)]
    enum WallError {
        #[error("outside of the wall")]
        Outside,
        #[error("fatal")]
        Fatal,
    }

    impl LogpError for WallError {
        fn is_recoverable(&self) -> bool {
            matches!(self, WallError::Outside)
        }
    }

    /// Standard normal restricted to `x < 0.5`, fatal beyond `x > fatal`.
    struct WallLogp {
        fatal: f64,
    }

    impl CpuLogpFunc for WallLogp {
        type LogpError = WallError;

        fn dim(&self) -> usize {
            1
        }

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> std::result::Result<f64, WallError> {
            if position[0] > self.fatal {
                return Err(WallError::Fatal);
            }
            if position[0] > 0.5 {
                return Err(WallError::Outside);
            }
            gradient[0] = -position[0];
            Ok(-position[0] * position[0] / 2.)
        }
    }

    #[test]
    fn recoverable_errors_are_divergences() {
        let mut hamiltonian = EuclideanHamiltonian::new(
            Potential::new(WallLogp { fatal: f64::INFINITY }),
            MassMatrix::identity(1, false),
            0.3,
            1000.,
        );
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let options = NutsOptions::default();

        let mut state = hamiltonian.init_state(&[0.]).unwrap();
        let mut divergences = 0;
        for _ in 0..500 {
            let (next, info) =
                draw(&mut state, &mut rng, &mut hamiltonian, &options, &mut NullCollector)
                    .unwrap();
            if let Some(info) = info.divergence_info {
                assert!(info.logp_function_error.is_some());
                divergences += 1;
            }
            assert!(next.q[0] <= 0.5);
            assert!(next.q[0].is_finite());
            state = next;
        }
        assert!(divergences > 0);
    }

    #[test]
    fn unrecoverable_error_stops() {
        let mut hamiltonian = EuclideanHamiltonian::new(
            Potential::new(WallLogp { fatal: 0.4 }),
            MassMatrix::identity(1, false),
            5.,
            1000.,
        );
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let options = NutsOptions::default();
        let mut state = hamiltonian.init_state(&[0.]).unwrap();

        let mut failed = false;
        for _ in 0..100 {
            match draw(&mut state, &mut rng, &mut hamiltonian, &options, &mut NullCollector) {
                Ok((next, _)) => state = next,
                Err(NutsError::LogpFailure(_)) => {
                    failed = true;
                    break;
                }
                Err(err) => panic!("Unexpected error {err}"),
            }
        }
        assert!(failed);
    }
}
