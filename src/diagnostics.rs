//! Convergence diagnostics over the scalar draws of several chains.
//!
//! R-hat and the effective sample size follow Gelman et al., Bayesian Data
//! Analysis (3rd edition), with the initial monotone sequence estimator of
//! Geyer (1992) for the autocorrelation time.

use itertools::Itertools;
use serde::Serialize;

use crate::{model::site_offsets, sampler::Trace};

fn mean(data: &[f64]) -> f64 {
    data.iter().sum::<f64>() / data.len() as f64
}

fn variance(data: &[f64]) -> f64 {
    let m = mean(data);
    data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (data.len() as f64 - 1.)
}

fn split_chains(chains: &[Vec<f64>]) -> Vec<&[f64]> {
    chains
        .iter()
        .flat_map(|chain| {
            let mid = chain.len() / 2;
            // Drop the middle draw of odd length chains
            let (first, second) = (&chain[..mid], &chain[chain.len() - mid..]);
            [first, second]
        })
        .collect()
}

fn gelman_rubin(chains: &[&[f64]]) -> f64 {
    let m = chains.len() as f64;
    let n = chains[0].len() as f64;
    if chains.len() < 2 || n < 2. {
        return f64::NAN;
    }

    let chain_means = chains.iter().map(|c| mean(c)).collect_vec();
    let between = n * variance(&chain_means);
    let within = chains.iter().map(|c| variance(c)).sum::<f64>() / m;
    if within <= 0. {
        return f64::NAN;
    }

    let var_hat = (n - 1.) / n * within + between / n;
    (var_hat / within).sqrt()
}

/// Split R-hat: every chain is cut in two halves which are compared as
/// separate chains. Needs at least four draws per chain.
pub fn split_rhat(chains: &[Vec<f64>]) -> f64 {
    if chains.is_empty() || chains.iter().any(|c| c.len() != chains[0].len()) {
        return f64::NAN;
    }
    gelman_rubin(&split_chains(chains))
}

/// Autocovariance of a single chain for all lags, normalized by its length.
fn autocovariance(chain: &[f64]) -> Vec<f64> {
    let n = chain.len();
    let m = mean(chain);
    let centered = chain.iter().map(|x| x - m).collect_vec();
    (0..n)
        .map(|lag| {
            centered[..n - lag]
                .iter()
                .zip(&centered[lag..])
                .map(|(a, b)| a * b)
                .sum::<f64>()
                / n as f64
        })
        .collect()
}

/// Effective sample size over all chains.
///
/// Chains must have the same length, at least two draws each.
pub fn effective_sample_size(chains: &[Vec<f64>]) -> f64 {
    if chains.is_empty() || chains.iter().any(|c| c.len() != chains[0].len()) {
        return f64::NAN;
    }
    let m = chains.len() as f64;
    let n = chains[0].len();
    if n < 2 {
        return f64::NAN;
    }
    let n_f = n as f64;

    let gamma = chains.iter().map(|c| autocovariance(c)).collect_vec();
    let within = gamma.iter().map(|g| g[0] * n_f / (n_f - 1.)).sum::<f64>() / m;
    let chain_means = chains.iter().map(|c| mean(c)).collect_vec();
    let between = if chains.len() > 1 {
        variance(&chain_means)
    } else {
        0.
    };
    let var_plus = within * (n_f - 1.) / n_f + between;
    if !(var_plus > 0.) {
        return f64::NAN;
    }

    let mut rho = (0..n)
        .map(|lag| {
            let mean_gamma = gamma.iter().map(|g| g[lag]).sum::<f64>() / m;
            1. - (within - mean_gamma) / var_plus
        })
        .collect_vec();
    rho[0] = 1.;

    // Sums of adjacent pairs, truncated at the first negative one and made
    // monotone decreasing
    let mut pair_sums = Vec::with_capacity(n / 2);
    let mut last = f64::INFINITY;
    for pair in rho.chunks_exact(2) {
        let sum = pair[0] + pair[1];
        if sum < 0. {
            break;
        }
        last = last.min(sum);
        pair_sums.push(last);
    }
    let tau = -1. + 2. * pair_sums.iter().sum::<f64>();
    let tau = tau.max(1. / (m * n_f).log10());
    m * n_f / tau
}

/// Linear interpolation of a sorted sample at quantile `q`.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let idx = q * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    let frac = idx - lo as f64;
    sorted[lo] * (1. - frac) + sorted[hi.min(sorted.len() - 1)] * frac
}

/// The narrowest interval containing a fraction `prob` of the draws.
pub fn hpdi(draws: &[f64], prob: f64) -> (f64, f64) {
    if draws.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let mut sorted = draws.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let n = sorted.len();
    let mass = ((prob * n as f64).floor() as usize).clamp(1, n);
    let (start, _) = sorted
        .windows(mass)
        .map(|window| window[mass - 1] - window[0])
        .enumerate()
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .unwrap_or((0, 0.));
    (sorted[start], sorted[start + mass - 1])
}

/// Summary of a single scalar quantity over all chains.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    /// Bounds of the 90% highest posterior density interval
    pub hpdi_low: f64,
    pub hpdi_high: f64,
    pub n_eff: f64,
    pub r_hat: f64,
}

pub fn summary(chains: &[Vec<f64>]) -> Summary {
    let all = chains.iter().flatten().copied().collect_vec();
    let mut sorted = all.clone();
    sorted.sort_unstable_by(f64::total_cmp);
    let (hpdi_low, hpdi_high) = hpdi(&all, 0.9);
    Summary {
        mean: mean(&all),
        std: variance(&all).sqrt(),
        median: quantile(&sorted, 0.5),
        hpdi_low,
        hpdi_high,
        n_eff: effective_sample_size(chains),
        r_hat: split_rhat(chains),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinateSummary {
    /// The site name, with the index into the site for vector sites
    pub name: String,
    pub summary: Summary,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub coordinates: Vec<CoordinateSummary>,
    /// Divergences after warmup, per chain
    pub divergences: Vec<u64>,
    /// Trajectories after warmup that hit the maximum tree depth, per chain
    pub maxdepth_reached: Vec<u64>,
}

impl Trace {
    /// Summarize every coordinate of every site over the successful chains.
    pub fn summary(&self) -> TraceSummary {
        let Some(first) = self.chains.first() else {
            return TraceSummary {
                coordinates: vec![],
                divergences: vec![],
                maxdepth_reached: vec![],
            };
        };
        let coordinates = site_offsets(&first.sites)
            .flat_map(|(site, offset)| {
                (0..site.size).map(move |i| {
                    let name = if site.size == 1 {
                        site.name.clone()
                    } else {
                        format!("{}[{}]", site.name, i)
                    };
                    (name, offset + i)
                })
            })
            .map(|(name, index)| {
                let chains = self
                    .chains
                    .iter()
                    .map(|chain| chain.coordinate(index))
                    .collect_vec();
                CoordinateSummary {
                    name,
                    summary: summary(&chains),
                }
            })
            .collect();

        TraceSummary {
            coordinates,
            divergences: self.chains.iter().map(|c| c.divergences).collect(),
            maxdepth_reached: self.chains.iter().map(|c| c.maxdepth_reached).collect(),
        }
    }
}

impl std::fmt::Display for TraceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{:<14} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>7}",
            "", "mean", "std", "median", "5.0%", "95.0%", "n_eff", "r_hat"
        )?;
        for coord in &self.coordinates {
            let s = &coord.summary;
            writeln!(
                f,
                "{:<14} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>9.1} {:>7.3}",
                coord.name, s.mean, s.std, s.median, s.hpdi_low, s.hpdi_high, s.n_eff, s.r_hat
            )?;
        }
        writeln!(
            f,
            "Number of divergences: {}",
            self.divergences.iter().sum::<u64>()
        )
    }
}
