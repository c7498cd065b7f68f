use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use approx::assert_abs_diff_eq;
use itertools::Itertools;
use nuts_sampler::{
    sample, ChainMethod, InitStrategy, LogpError, Model, NutsSettings, ProgressCallback, Sampler,
    SamplerWaitResult, Site, Transform, TransformedLogp,
};
use pretty_assertions::assert_eq;
use thiserror::Error;

#[derive(Error, Debug)]
enum TestLogpError {
    #[error("Evaluation failed on purpose")]
    Fatal,
}

impl LogpError for TestLogpError {
    fn is_recoverable(&self) -> bool {
        false
    }
}

const MEAN: [f64; 2] = [1., -2.];
const COV: [f64; 4] = [1., 0.5, 0.5, 2.];

/// A correlated bivariate normal.
struct CorrelatedNormal {
    sites: Vec<Site>,
    precision: [f64; 4],
}

impl CorrelatedNormal {
    fn new() -> Self {
        let det = COV[0] * COV[3] - COV[1] * COV[2];
        Self {
            sites: vec![Site::new("x", 2)],
            precision: [COV[3] / det, -COV[1] / det, -COV[2] / det, COV[0] / det],
        }
    }
}

impl Model for CorrelatedNormal {
    type LogpError = TestLogpError;

    fn sites(&self) -> &[Site] {
        &self.sites
    }

    fn logp(&self, values: &[f64], gradient: &mut [f64]) -> Result<f64, TestLogpError> {
        let d = [values[0] - MEAN[0], values[1] - MEAN[1]];
        let p = &self.precision;
        gradient[0] = -(p[0] * d[0] + p[1] * d[1]);
        gradient[1] = -(p[2] * d[0] + p[3] * d[1]);
        Ok(0.5 * (d[0] * gradient[0] + d[1] * gradient[1]))
    }
}

fn settings() -> NutsSettings {
    NutsSettings {
        num_warmup: 500,
        num_samples: 1000,
        num_chains: 4,
        seed: 42,
        ..Default::default()
    }
}

fn pooled(trace: &nuts_sampler::Trace, index: usize) -> Vec<f64> {
    trace
        .chains
        .iter()
        .flat_map(|chain| chain.coordinate(index))
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn covariance(a: &[f64], b: &[f64]) -> f64 {
    let (ma, mb) = (mean(a), mean(b));
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - ma) * (y - mb))
        .sum::<f64>()
        / (a.len() as f64 - 1.)
}

#[test]
fn recovers_mean_and_covariance() -> Result<()> {
    let settings = settings();
    let trace = sample(CorrelatedNormal::new(), &settings)?;
    assert_eq!(trace.chains.len(), 4);
    assert!(trace.failed.is_empty());

    for chain in &trace.chains {
        assert!(chain.finished);
        assert_eq!(chain.num_posterior_draws(), 1000);
        assert_eq!(chain.num_draws, chain.total_draws);
        assert!(chain.divergences < 10, "{} divergences", chain.divergences);
    }
    assert_eq!(trace.num_draws(), 4 * 1500);
    assert_eq!(trace.num_finished_chains(), 4);

    let x = pooled(&trace, 0);
    let y = pooled(&trace, 1);
    assert_abs_diff_eq!(mean(&x), MEAN[0], epsilon = 0.1);
    assert_abs_diff_eq!(mean(&y), MEAN[1], epsilon = 0.1);
    assert_abs_diff_eq!(covariance(&x, &x), COV[0], epsilon = 0.15);
    assert_abs_diff_eq!(covariance(&x, &y), COV[1], epsilon = 0.15);
    assert_abs_diff_eq!(covariance(&y, &y), COV[3], epsilon = 0.3);

    let summary = trace.summary();
    assert_eq!(summary.coordinates.len(), 2);
    assert_eq!(summary.coordinates[0].name, "x[0]");
    for coord in &summary.coordinates {
        assert!(coord.summary.r_hat < 1.05, "{}", summary);
        assert!(coord.summary.n_eff > 500., "{}", summary);
    }
    Ok(())
}

/// A standard normal in two dimensions.
struct StandardNormal2 {
    sites: Vec<Site>,
}

impl Model for StandardNormal2 {
    type LogpError = TestLogpError;

    fn sites(&self) -> &[Site] {
        &self.sites
    }

    fn logp(&self, values: &[f64], gradient: &mut [f64]) -> Result<f64, TestLogpError> {
        gradient
            .iter_mut()
            .zip(values)
            .for_each(|(g, x)| *g = -x);
        Ok(-0.5 * values.iter().map(|x| x * x).sum::<f64>())
    }
}

#[test]
fn standard_normal_every_chain() -> Result<()> {
    let model = StandardNormal2 {
        sites: vec![Site::new("x", 2)],
    };
    let settings = NutsSettings {
        num_warmup: 500,
        num_samples: 1000,
        num_chains: 4,
        target_accept_prob: 0.8,
        seed: 0,
        ..Default::default()
    };
    let trace = sample(model, &settings)?;
    assert!(trace.failed.is_empty());
    assert_eq!(trace.chains.len(), 4);

    for chain in &trace.chains {
        assert!(chain.finished);
        assert_eq!(chain.num_posterior_draws(), 1000);
        let x = chain.coordinate(0);
        let y = chain.coordinate(1);
        assert_abs_diff_eq!(mean(&x), 0., epsilon = 0.1);
        assert_abs_diff_eq!(mean(&y), 0., epsilon = 0.1);
        assert_abs_diff_eq!(covariance(&x, &x), 1., epsilon = 0.15);
        assert_abs_diff_eq!(covariance(&x, &y), 0., epsilon = 0.15);
        assert_abs_diff_eq!(covariance(&y, &y), 1., epsilon = 0.15);
        // Less than 1% divergent
        assert!(chain.divergences < 10, "{} divergences", chain.divergences);
    }
    Ok(())
}

#[test]
fn same_seed_same_draws() -> Result<()> {
    let settings = NutsSettings {
        num_warmup: 100,
        num_samples: 100,
        ..settings()
    };
    let first = sample(CorrelatedNormal::new(), &settings)?;
    let second = sample(CorrelatedNormal::new(), &settings)?;
    for (a, b) in first.chains.iter().zip(&second.chains) {
        assert_eq!(a.draws, b.draws);
    }

    // Chains use different streams
    assert!(first.chains[0].coordinate(0) != first.chains[1].coordinate(0));

    let other = sample(
        CorrelatedNormal::new(),
        &NutsSettings {
            seed: 43,
            ..settings
        },
    )?;
    assert!(first.chains[0].coordinate(0) != other.chains[0].coordinate(0));
    Ok(())
}

#[test]
fn dense_mass_matrix_learns_covariance() -> Result<()> {
    let model = CorrelatedNormal::new();
    let settings = NutsSettings {
        dense_mass: true,
        ..settings()
    };
    let mut chain = settings.new_chain(0, TransformedLogp::new(&model));
    chain.set_position(&[0., 0.])?;
    for _ in 0..settings.num_warmup {
        chain.draw()?;
    }
    let mass_matrix = chain.mass_matrix();
    assert!(mass_matrix.is_dense());
    let variance = mass_matrix.variance_diag();
    assert_abs_diff_eq!(variance[0], COV[0], epsilon = 0.3);
    assert_abs_diff_eq!(variance[1], COV[3], epsilon = 0.6);

    let draws = (0..settings.num_samples)
        .map(|_| chain.draw().map(|(values, _)| values))
        .collect::<Result<Vec<_>, _>>()?;
    let x = draws.iter().map(|v| v[0]).collect_vec();
    let y = draws.iter().map(|v| v[1]).collect_vec();
    assert_abs_diff_eq!(mean(&x), MEAN[0], epsilon = 0.2);
    assert_abs_diff_eq!(mean(&y), MEAN[1], epsilon = 0.25);
    assert_abs_diff_eq!(covariance(&x, &y), COV[1], epsilon = 0.3);
    Ok(())
}

/// A gamma(2, 1) distribution on a positive site.
struct GammaModel {
    sites: Vec<Site>,
}

impl Model for GammaModel {
    type LogpError = TestLogpError;

    fn sites(&self) -> &[Site] {
        &self.sites
    }

    fn logp(&self, values: &[f64], gradient: &mut [f64]) -> Result<f64, TestLogpError> {
        let s = values[0];
        gradient[0] = 1. / s - 1.;
        Ok(s.ln() - s)
    }
}

#[test]
fn constrained_site() -> Result<()> {
    let model = GammaModel {
        sites: vec![Site::scalar("s").with_transform(Transform::Exp)],
    };
    let settings = NutsSettings {
        init_strategy: InitStrategy::Value(vec![1.]),
        store_unconstrained: true,
        ..settings()
    };
    let trace = sample(model, &settings)?;

    let draws = pooled(&trace, 0);
    assert!(draws.iter().all(|&s| s > 0.));
    assert_abs_diff_eq!(mean(&draws), 2., epsilon = 0.2);

    let record = &trace.chains[0].draws[0];
    let unconstrained = record.stats.unconstrained_draw.as_ref().unwrap();
    assert_abs_diff_eq!(unconstrained[0].exp(), record.values[0], epsilon = 1e-10);
    assert_eq!(trace.chains[0].site("s").unwrap().len(), 1000);
    assert!(trace.chains[0].site("t").is_none());
    Ok(())
}

#[test]
fn abort_keeps_draws() -> Result<()> {
    let settings = NutsSettings {
        num_warmup: 1000,
        num_samples: 100_000_000,
        store_warmup: true,
        ..settings()
    };
    let latest = Arc::new(Mutex::new(None));
    let latest_inner = latest.clone();
    let callback = ProgressCallback {
        callback: Box::new(move |_, progress| {
            *latest_inner.lock().unwrap() = Some(progress);
        }),
        rate: Duration::from_millis(5),
    };

    let sampler = Sampler::new(CorrelatedNormal::new(), settings, 4, Some(callback))?;
    let sampler = match sampler.wait_timeout(Duration::from_millis(100)) {
        SamplerWaitResult::Timeout(sampler) => sampler,
        SamplerWaitResult::Trace(_) => panic!("Sampler finished too early"),
        SamplerWaitResult::Err(err, _) => return Err(err),
    };
    let (result, trace) = sampler.abort();
    result?;
    let trace = trace.expect("No trace after abort");
    assert_eq!(trace.chains.len(), 4);
    for chain in &trace.chains {
        assert!(!chain.finished);
        let draws = chain.draws.iter().map(|record| record.stats.draw).collect_vec();
        assert_eq!(draws, (0..draws.len() as u64).collect_vec());
        assert_eq!(chain.num_draws, draws.len() as u64);
    }
    assert!(latest.lock().unwrap().is_some());
    Ok(())
}

#[test]
fn abort_in_warmup_counts_draws() -> Result<()> {
    let settings = NutsSettings {
        num_warmup: 100_000_000,
        num_samples: 100,
        store_warmup: false,
        ..settings()
    };
    let sampler = Sampler::new(CorrelatedNormal::new(), settings, 4, None)?;
    let sampler = match sampler.wait_timeout(Duration::from_millis(200)) {
        SamplerWaitResult::Timeout(sampler) => sampler,
        SamplerWaitResult::Trace(_) => panic!("Sampler finished too early"),
        SamplerWaitResult::Err(err, _) => return Err(err),
    };
    let (result, trace) = sampler.abort();
    result?;
    let trace = trace.expect("No trace after abort");
    assert_eq!(trace.chains.len(), 4);
    assert_eq!(trace.num_finished_chains(), 0);
    for chain in &trace.chains {
        // Warmup draws are not stored but still counted
        assert!(chain.draws.is_empty());
        assert!(chain.num_draws > 0);
        assert!(chain.num_draws < chain.total_draws);
    }
    assert_eq!(
        trace.num_draws(),
        trace.chains.iter().map(|chain| chain.num_draws).sum::<u64>()
    );
    Ok(())
}

/// The normal model, failing unrecoverably at one evaluation.
struct FailingModel {
    inner: CorrelatedNormal,
    evals: AtomicU64,
    fail_at: u64,
}

impl Model for FailingModel {
    type LogpError = TestLogpError;

    fn sites(&self) -> &[Site] {
        self.inner.sites()
    }

    fn logp(&self, values: &[f64], gradient: &mut [f64]) -> Result<f64, TestLogpError> {
        if self.evals.fetch_add(1, Ordering::SeqCst) == self.fail_at {
            return Err(TestLogpError::Fatal);
        }
        self.inner.logp(values, gradient)
    }
}

#[test]
fn failed_chain_keeps_partial_output() -> Result<()> {
    let model = FailingModel {
        inner: CorrelatedNormal::new(),
        evals: AtomicU64::new(0),
        fail_at: 100,
    };
    let settings = NutsSettings {
        num_warmup: 100,
        num_samples: 100,
        store_warmup: true,
        find_heuristic_step_size: false,
        chain_method: ChainMethod::Sequential,
        ..settings()
    };
    let trace = sample(model, &settings)?;

    assert_eq!(trace.failed.len(), 1);
    let failure = &trace.failed[0];
    assert_eq!(failure.chain_id, 0);
    assert!(!failure.output.finished);
    assert!(!failure.output.draws.is_empty());
    assert_eq!(failure.output.num_draws, failure.output.draws.len() as u64);
    assert!((failure.output.draws.len() as u64) < settings.total_draws());
    assert!(format!("{:#}", failure.error).contains("Sampling failed in chain 0"));

    assert_eq!(
        trace.chains.iter().map(|chain| chain.chain_id).collect_vec(),
        vec![1, 2, 3]
    );
    assert!(trace.chains.iter().all(|chain| chain.finished));
    Ok(())
}
