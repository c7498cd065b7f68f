use std::error::Error;

use itertools::Itertools;
use rand::Rng;

use crate::{
    adapt_strategy::WindowedAdaptation,
    hamiltonian::EuclideanHamiltonian,
    mass_matrix::MassMatrix,
    nuts::{draw, NutsError, NutsOptions, Result, SampleInfo},
    potential::{CpuLogpFunc, Potential},
    sampler::NutsSettings,
    sampler_stats::{SampleStats, StatOptions},
    state::State,
    stepsize::AcceptanceRateCollector,
};

/// An error and all its sources, separated by colons.
fn error_message(err: &(dyn Error + 'static)) -> String {
    std::iter::successors(Some(err), |&err| err.source()).join(": ")
}

/// Where a chain is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPhase {
    /// Adapting the step size and mass matrix, in the given warmup window
    Warmup { window: usize },
    /// Adaptation is frozen and draws are kept
    Sampling,
    Done,
}

/// A single Markov chain: the hamiltonian, its adaptation state and a
/// chain local random number generator.
pub struct NutsChain<F: CpuLogpFunc, R: Rng> {
    hamiltonian: EuclideanHamiltonian<F>,
    collector: AcceptanceRateCollector,
    options: NutsOptions,
    rng: R,
    state: Option<State>,
    chain: u64,
    draw_count: u64,
    num_warmup: u64,
    num_samples: u64,
    initial_step_size: f64,
    strategy: WindowedAdaptation,
    stats_options: StatOptions,
    divergences: u64,
    warmup_divergences: u64,
    maxdepth_reached: u64,
}

impl<F: CpuLogpFunc, R: Rng> NutsChain<F, R> {
    pub fn new(logp: F, settings: &NutsSettings, chain: u64, rng: R) -> Self {
        let dim = logp.dim();
        let hamiltonian = EuclideanHamiltonian::new(
            Potential::new(logp),
            MassMatrix::identity(dim, settings.dense_mass),
            settings.initial_step_size,
            settings.max_energy_error,
        );
        NutsChain {
            hamiltonian,
            collector: AcceptanceRateCollector::new(),
            options: NutsOptions {
                maxdepth: settings.max_tree_depth,
            },
            rng,
            state: None,
            chain,
            draw_count: 0,
            num_warmup: settings.num_warmup,
            num_samples: settings.num_samples,
            initial_step_size: settings.initial_step_size,
            strategy: WindowedAdaptation::new(settings.adapt_options(), settings.num_warmup, dim),
            stats_options: settings.stat_options(),
            divergences: 0,
            warmup_divergences: 0,
            maxdepth_reached: 0,
        }
    }

    /// Move the chain to an unconstrained `position` and initialize the
    /// step size there.
    ///
    /// Fails if the log density can not be evaluated at `position`.
    pub fn set_position(&mut self, position: &[f64]) -> Result<()> {
        let state = self.hamiltonian.init_state(position)?;
        if self.draw_count < self.num_warmup {
            self.hamiltonian.set_step_size(self.initial_step_size);
            self.strategy
                .init(&mut self.hamiltonian, &state, &mut self.rng);
        }
        self.state = Some(state);
        Ok(())
    }

    /// Draw the next sample.
    ///
    /// Returns the draw mapped to constrained space and its diagnostics.
    pub fn draw(&mut self) -> Result<(Box<[f64]>, SampleStats)> {
        if self.phase() == ChainPhase::Done {
            return Err(NutsError::ChainFinished);
        }
        let Some(init) = self.state.as_mut() else {
            return Err(NutsError::Uninitialized);
        };

        let step_size = self.hamiltonian.step_size();
        let (state, info) = draw(
            init,
            &mut self.rng,
            &mut self.hamiltonian,
            &self.options,
            &mut self.collector,
        )?;

        let tuning = self.draw_count < self.num_warmup;
        let accept_prob = self.collector.mean_acceptance_rate();
        if tuning {
            self.strategy.adapt(
                &mut self.hamiltonian,
                self.draw_count,
                accept_prob,
                &state,
                &mut self.rng,
            );
            if info.divergence_info.is_some() {
                self.warmup_divergences += 1;
            }
        } else {
            if info.divergence_info.is_some() {
                self.divergences += 1;
            }
            if info.reached_maxdepth {
                self.maxdepth_reached += 1;
            }
        }

        let stats = self.make_stats(&state, &info, tuning, step_size, accept_prob);

        let mut values: Box<[f64]> = vec![0f64; self.dim()].into();
        self.hamiltonian
            .potential_mut()
            .expand_vector(state.position(), &mut values);

        self.draw_count += 1;
        self.state = Some(state);
        Ok((values, stats))
    }

    fn make_stats(
        &self,
        state: &State,
        info: &SampleInfo,
        tuning: bool,
        step_size: f64,
        accept_prob: f64,
    ) -> SampleStats {
        let options = self.stats_options;
        let div_info = info
            .divergence_info
            .as_ref()
            .filter(|_| options.store_divergences);
        let to_vec = |values: &Option<Box<[f64]>>| values.as_ref().map(|v| v.to_vec());

        SampleStats {
            chain: self.chain,
            draw: self.draw_count,
            tuning,
            step_size,
            step_size_bar: if tuning {
                self.strategy.step_size_bar()
            } else {
                self.hamiltonian.step_size()
            },
            depth: info.depth,
            maxdepth_reached: info.reached_maxdepth,
            n_steps: self.collector.num_steps(),
            accept_prob,
            diverging: info.divergence_info.is_some(),
            energy: state.energy(),
            energy_error: state.energy_error(),
            logp: state.logp(),
            index_in_trajectory: state.index_in_trajectory(),
            unconstrained_draw: options
                .store_unconstrained
                .then(|| state.position().to_vec()),
            gradient: options.store_gradient.then(|| state.gradient().to_vec()),
            divergence_start: div_info.and_then(|d| to_vec(&d.start_location)),
            divergence_start_gradient: div_info.and_then(|d| to_vec(&d.start_gradient)),
            divergence_end: div_info.and_then(|d| to_vec(&d.end_location)),
            divergence_momentum: div_info.and_then(|d| to_vec(&d.start_momentum)),
            divergence_energy_error: div_info.and_then(|d| d.energy_error),
            divergence_start_index: div_info.and_then(|d| d.start_idx_in_trajectory),
            divergence_end_index: div_info.and_then(|d| d.end_idx_in_trajectory),
            divergence_message: div_info
                .and_then(|d| d.logp_function_error.as_deref())
                .map(|err| error_message(err)),
        }
    }

    pub fn phase(&self) -> ChainPhase {
        if self.draw_count < self.num_warmup {
            let last = self.strategy.schedule().len().saturating_sub(1);
            ChainPhase::Warmup {
                window: self.strategy.window_idx().min(last),
            }
        } else if self.draw_count < self.num_warmup + self.num_samples {
            ChainPhase::Sampling
        } else {
            ChainPhase::Done
        }
    }

    pub fn dim(&self) -> usize {
        self.hamiltonian.dim()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain
    }

    /// Number of draws made so far, warmup included.
    pub fn draw_count(&self) -> u64 {
        self.draw_count
    }

    pub fn total_draws(&self) -> u64 {
        self.num_warmup + self.num_samples
    }

    pub fn step_size(&self) -> f64 {
        self.hamiltonian.step_size()
    }

    pub fn mass_matrix(&self) -> &MassMatrix {
        self.hamiltonian.mass_matrix()
    }

    /// The current position in unconstrained space
    pub fn position(&self) -> Option<&[f64]> {
        self.state.as_ref().map(|state| state.position())
    }

    /// Divergences after warmup
    pub fn num_divergences(&self) -> u64 {
        self.divergences
    }

    pub fn num_warmup_divergences(&self) -> u64 {
        self.warmup_divergences
    }

    /// Post warmup trajectories that stopped at the maximum tree depth
    pub fn num_maxdepth_reached(&self) -> u64 {
        self.maxdepth_reached
    }

    pub fn num_logp_evals(&self) -> u64 {
        self.hamiltonian.potential().num_evals()
    }

    pub fn logp_func(&self) -> &F {
        self.hamiltonian.potential().logp_func()
    }

    pub(crate) fn rng_mut(&mut self) -> &mut R {
        &mut self.rng
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::test_logps::NormalLogp;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn settings() -> NutsSettings {
        NutsSettings {
            num_warmup: 100,
            num_samples: 50,
            ..Default::default()
        }
    }

    #[test]
    fn phases() {
        let settings = settings();
        let mut chain = NutsChain::new(
            NormalLogp::new(3, 0.5),
            &settings,
            2,
            ChaCha8Rng::seed_from_u64(0),
        );
        assert!(matches!(chain.draw(), Err(NutsError::Uninitialized)));
        chain.set_position(&[0., 0., 0.]).unwrap();

        assert_eq!(chain.phase(), ChainPhase::Warmup { window: 0 });
        let mut windows = vec![];
        for i in 0..150 {
            if let ChainPhase::Warmup { window } = chain.phase() {
                if windows.last() != Some(&window) {
                    windows.push(window);
                }
            }
            let (values, stats) = chain.draw().unwrap();
            assert_eq!(values.len(), 3);
            assert_eq!(stats.draw, i);
            assert_eq!(stats.chain, 2);
            assert_eq!(stats.tuning, i < 100);
            assert!(stats.n_steps >= 1);
            assert!((0. ..=1.).contains(&stats.accept_prob));
            if i == 100 {
                assert_eq!(chain.phase(), ChainPhase::Sampling);
            }
        }
        assert_eq!(windows, vec![0, 1, 2]);
        assert_eq!(chain.phase(), ChainPhase::Done);
        assert!(matches!(chain.draw(), Err(NutsError::ChainFinished)));
    }

    #[test]
    fn step_size_frozen_after_warmup() {
        let settings = settings();
        let mut chain = NutsChain::new(
            NormalLogp::new(2, 0.),
            &settings,
            0,
            ChaCha8Rng::seed_from_u64(5),
        );
        chain.set_position(&[1., -1.]).unwrap();
        for _ in 0..100 {
            chain.draw().unwrap();
        }
        let step_size = chain.step_size();
        let mass_matrix = chain.mass_matrix().variance_diag();
        for _ in 0..50 {
            let (_, stats) = chain.draw().unwrap();
            assert_eq!(stats.step_size, step_size);
            assert_eq!(stats.step_size_bar, step_size);
        }
        assert_eq!(chain.mass_matrix().variance_diag(), mass_matrix);
    }

    #[test]
    fn optional_stats() {
        let settings = NutsSettings {
            store_gradient: true,
            store_unconstrained: true,
            ..settings()
        };
        let mut chain = NutsChain::new(
            NormalLogp::new(2, 0.),
            &settings,
            0,
            ChaCha8Rng::seed_from_u64(5),
        );
        chain.set_position(&[1., -1.]).unwrap();
        let (values, stats) = chain.draw().unwrap();
        assert_eq!(stats.unconstrained_draw.as_deref(), Some(&values[..]));
        let gradient = stats.gradient.unwrap();
        assert_eq!(gradient[0], -values[0]);
        assert!(stats.divergence_start.is_none());
    }
}
