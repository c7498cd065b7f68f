use serde::Serialize;

use crate::{
    hamiltonian::DivergenceInfo,
    nuts::{Collector, NutsOptions},
    state::State,
};

pub(crate) const LOWER_LIMIT: f64 = 1e-10f64;
pub(crate) const UPPER_LIMIT: f64 = 1e10f64;

pub(crate) fn clamp_step_size(step_size: f64) -> f64 {
    if !step_size.is_finite() {
        return if step_size > 0. { UPPER_LIMIT } else { LOWER_LIMIT };
    }
    step_size.clamp(LOWER_LIMIT, UPPER_LIMIT)
}

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DualAverageOptions {
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
        }
    }
}

/// Nesterov dual averaging of the log step size, as in Hoffman & Gelman (2014)
#[derive(Debug, Clone)]
pub struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    settings: DualAverageOptions,
}

impl DualAverage {
    pub fn new(settings: DualAverageOptions, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            settings,
        }
    }

    /// Record the acceptance statistic of a draw.
    pub fn advance(&mut self, accept_stat: f64, target: f64) {
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (target - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    pub fn current_step_size(&self) -> f64 {
        clamp_step_size(self.log_step.exp())
    }

    /// The time averaged step size, used after the end of the window
    pub fn current_step_size_adapted(&self) -> f64 {
        clamp_step_size(self.log_step_adapted.exp())
    }

    pub fn reset(&mut self, initial_step: f64, bias_factor: f64) {
        self.log_step = initial_step.ln();
        self.log_step_adapted = initial_step.ln();
        self.hbar = 0f64;
        self.mu = (bias_factor * initial_step).ln();
        self.count = 1;
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn current(&self) -> f64 {
        if self.count == 0 {
            return 0.;
        }
        self.sum / self.count as f64
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0f64;
        self.count = 0;
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Mean Metropolis acceptance probability `min(1, exp(H0 - H))` over all
/// leapfrog steps of a trajectory. Divergent steps count as zero.
#[derive(Debug, Clone, Default)]
pub struct AcceptanceRateCollector {
    initial_energy: f64,
    pub(crate) mean: RunningMean,
}

impl AcceptanceRateCollector {
    pub(crate) fn new() -> AcceptanceRateCollector {
        AcceptanceRateCollector::default()
    }

    pub fn mean_acceptance_rate(&self) -> f64 {
        self.mean.current()
    }

    pub fn num_steps(&self) -> u64 {
        self.mean.count()
    }
}

impl Collector for AcceptanceRateCollector {
    fn register_leapfrog(
        &mut self,
        _start: &State,
        end: &State,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        match divergence_info {
            Some(_) => self.mean.add(0.),
            None => {
                let diff = self.initial_energy - end.energy();
                self.mean.add(diff.min(0.).exp());
            }
        };
    }

    fn register_init(&mut self, state: &State, _options: &NutsOptions) {
        self.initial_energy = state.energy();
        self.mean.reset();
    }
}
