use serde::Serialize;

use crate::model::{site_offsets, Site};

/// Which optional vectors are stored with each draw.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatOptions {
    pub store_gradient: bool,
    pub store_unconstrained: bool,
    pub store_divergences: bool,
}

/// Diagnostics of a single draw.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleStats {
    pub chain: u64,
    pub draw: u64,
    /// The draw was made during warmup
    pub tuning: bool,
    /// The step size the trajectory of this draw was integrated with
    pub step_size: f64,
    /// The averaged step size of dual averaging after this draw
    pub step_size_bar: f64,
    pub depth: u64,
    pub maxdepth_reached: bool,
    /// Number of leapfrog steps in the trajectory
    pub n_steps: u64,
    /// Mean acceptance probability over the leapfrog steps of the trajectory
    pub accept_prob: f64,
    pub diverging: bool,
    pub energy: f64,
    pub energy_error: f64,
    /// Log density of the draw in unconstrained space, including the log Jacobian
    pub logp: f64,
    pub index_in_trajectory: i64,
    pub unconstrained_draw: Option<Vec<f64>>,
    pub gradient: Option<Vec<f64>>,
    pub divergence_start: Option<Vec<f64>>,
    pub divergence_start_gradient: Option<Vec<f64>>,
    pub divergence_end: Option<Vec<f64>>,
    pub divergence_momentum: Option<Vec<f64>>,
    /// Energy error at the divergent leapfrog step, `None` if the log density failed
    pub divergence_energy_error: Option<f64>,
    pub divergence_start_index: Option<i64>,
    pub divergence_end_index: Option<i64>,
    /// The recoverable log density error that caused the divergence
    pub divergence_message: Option<String>,
}

/// A draw in constrained space together with its diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRecord {
    pub values: Box<[f64]>,
    pub stats: SampleStats,
}

impl SampleRecord {
    /// The values of the site called `name`, given the site layout of the model.
    pub fn site<'a>(&'a self, sites: &[Site], name: &str) -> Option<&'a [f64]> {
        site_offsets(sites)
            .find(|(site, _)| site.name == name)
            .map(|(site, offset)| &self.values[offset..offset + site.size])
    }
}
