use anyhow::{anyhow, bail, Context, Result};
use itertools::Itertools;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::{ScopeFifo, ThreadPoolBuilder};
use serde::Serialize;
use std::{
    sync::{
        mpsc::{
            channel, sync_channel, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError,
        },
        Arc, Mutex,
    },
    thread::{spawn, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;

use crate::{
    adapt_strategy::{AdaptOptions, WindowSettings},
    chain::{ChainPhase, NutsChain},
    init::{initialize_chain, InitStrategy},
    mass_matrix_adapt::MassMatrixRegularization,
    model::{Model, Site},
    potential::{CpuLogpFunc, TransformedLogp},
    sampler_stats::{SampleRecord, SampleStats, StatOptions},
    stepsize::DualAverageOptions,
};

/// How `sample` runs the chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ChainMethod {
    /// One task per chain on a thread pool
    #[default]
    Parallel,
    /// All chains one after another on the calling thread
    Sequential,
}

/// Settings for the NUTS sampler
#[derive(Debug, Clone, Serialize)]
pub struct NutsSettings {
    /// The number of warmup draws, where we fit the step size and mass matrix.
    pub num_warmup: u64,
    /// The number of draws after warmup
    pub num_samples: u64,
    pub num_chains: usize,
    pub seed: u64,
    /// Target of the mean acceptance probability during step size adaptation
    pub target_accept_prob: f64,
    /// The maximum tree depth during sampling. The number of leapfrog steps
    /// is smaller than 2 ^ max_tree_depth.
    pub max_tree_depth: u64,
    /// Estimate a full covariance matrix instead of only its diagonal
    pub dense_mass: bool,
    pub init_strategy: InitStrategy,
    /// Number of initial points we try before a chain fails
    pub max_init_tries: usize,
    /// If the energy error is larger than this threshold we treat the leapfrog
    /// step as a divergence.
    pub max_energy_error: f64,
    pub initial_step_size: f64,
    pub adapt_step_size: bool,
    pub adapt_mass_matrix: bool,
    /// Search for a reasonable step size at the start of warmup and after
    /// each mass matrix update
    pub find_heuristic_step_size: bool,
    pub regularize_mass_matrix: bool,
    pub mass_matrix_regularization: MassMatrixRegularization,
    pub windows: WindowSettings,
    pub dual_average: DualAverageOptions,
    /// Keep warmup draws in the trace
    pub store_warmup: bool,
    /// Store the gradient in the SampleStats
    pub store_gradient: bool,
    /// Store each unconstrained parameter vector in the sampler stats
    pub store_unconstrained: bool,
    /// Store detailed information about each divergence in the sampler stats
    pub store_divergences: bool,
    pub chain_method: ChainMethod,
}

impl Default for NutsSettings {
    fn default() -> Self {
        Self {
            num_warmup: 1000,
            num_samples: 1000,
            num_chains: 4,
            seed: 0,
            target_accept_prob: 0.8,
            max_tree_depth: 10,
            dense_mass: false,
            init_strategy: InitStrategy::default(),
            max_init_tries: 100,
            max_energy_error: 1000f64,
            initial_step_size: 1f64,
            adapt_step_size: true,
            adapt_mass_matrix: true,
            find_heuristic_step_size: true,
            regularize_mass_matrix: true,
            mass_matrix_regularization: MassMatrixRegularization::default(),
            windows: WindowSettings::default(),
            dual_average: DualAverageOptions::default(),
            store_warmup: false,
            store_gradient: false,
            store_unconstrained: false,
            store_divergences: false,
            chain_method: ChainMethod::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettingsError {
    #[error("Invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> SettingsError {
    SettingsError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl NutsSettings {
    /// Check the settings that do not depend on the model.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.num_warmup == 0 {
            return Err(invalid("num_warmup", "must be positive"));
        }
        if self.num_samples == 0 {
            return Err(invalid("num_samples", "must be positive"));
        }
        if self.num_chains == 0 {
            return Err(invalid("num_chains", "must be positive"));
        }
        if !(self.target_accept_prob > 0. && self.target_accept_prob < 1.) {
            return Err(invalid(
                "target_accept_prob",
                format!("must be in (0, 1), got {}", self.target_accept_prob),
            ));
        }
        if self.max_tree_depth == 0 || self.max_tree_depth > 30 {
            return Err(invalid(
                "max_tree_depth",
                format!("must be in 1..=30, got {}", self.max_tree_depth),
            ));
        }
        if !(self.max_energy_error > 0.) {
            return Err(invalid("max_energy_error", "must be positive"));
        }
        if !(self.initial_step_size > 0. && self.initial_step_size.is_finite()) {
            return Err(invalid(
                "initial_step_size",
                "must be positive and finite",
            ));
        }
        if self.max_init_tries == 0 {
            return Err(invalid("max_init_tries", "must be positive"));
        }
        match &self.init_strategy {
            InitStrategy::Uniform { radius } if !(*radius > 0. && radius.is_finite()) => {
                return Err(invalid(
                    "init_strategy",
                    format!("uniform radius must be positive and finite, got {radius}"),
                ));
            }
            InitStrategy::Median { num_samples: 0 } => {
                return Err(invalid("init_strategy", "median needs at least one prior draw"));
            }
            InitStrategy::Value(values) if !values.iter().all(|x| x.is_finite()) => {
                return Err(invalid("init_strategy", "initial values must be finite"));
            }
            _ => {}
        }
        let windows = &self.windows;
        if windows.init_buffer == 0 {
            return Err(invalid("windows", "init_buffer must be positive"));
        }
        if windows.term_buffer == 0 {
            return Err(invalid("windows", "term_buffer must be positive"));
        }
        if windows.base_window == 0 {
            return Err(invalid("windows", "base_window must be positive"));
        }
        let dual_average = &self.dual_average;
        if !(dual_average.gamma > 0. && dual_average.t0 >= 0. && dual_average.k > 0.) {
            return Err(invalid(
                "dual_average",
                "gamma and k must be positive and t0 non-negative",
            ));
        }
        let regularization = &self.mass_matrix_regularization;
        if !(regularization.prior_count >= 0. && regularization.scale > 0.) {
            return Err(invalid(
                "mass_matrix_regularization",
                "prior_count must be non-negative and scale positive",
            ));
        }
        Ok(())
    }

    /// Check the settings against a model with `dim` parameters.
    pub fn validate_for_model(&self, dim: usize) -> Result<(), SettingsError> {
        if dim == 0 {
            return Err(invalid("model", "the model has no parameters"));
        }
        if let InitStrategy::Value(values) = &self.init_strategy {
            if values.len() != dim {
                return Err(invalid(
                    "init_strategy",
                    format!(
                        "got {} initial values for a model of dimension {}",
                        values.len(),
                        dim
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn total_draws(&self) -> u64 {
        self.num_warmup + self.num_samples
    }

    pub fn adapt_options(&self) -> AdaptOptions {
        AdaptOptions {
            target_accept: self.target_accept_prob,
            adapt_step_size: self.adapt_step_size,
            adapt_mass_matrix: self.adapt_mass_matrix,
            find_heuristic_step_size: self.find_heuristic_step_size,
            dense_mass: self.dense_mass,
            regularization: self
                .regularize_mass_matrix
                .then_some(self.mass_matrix_regularization),
            dual_average: self.dual_average,
            windows: self.windows,
        }
    }

    pub fn stat_options(&self) -> StatOptions {
        StatOptions {
            store_gradient: self.store_gradient,
            store_unconstrained: self.store_unconstrained,
            store_divergences: self.store_divergences,
        }
    }

    /// A chain with its own random stream, derived from `seed` and `chain`.
    pub fn new_chain<F: CpuLogpFunc>(&self, chain: u64, logp: F) -> NutsChain<F, ChaCha8Rng> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(chain);
        NutsChain::new(logp, self, chain, rng)
    }
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct ChainProgress {
    pub finished_draws: usize,
    pub total_draws: usize,
    pub divergences: usize,
    pub tuning: bool,
    pub started: bool,
    pub latest_num_steps: usize,
    pub total_num_steps: usize,
    pub step_size: f64,
    pub runtime: Duration,
    pub divergent_draws: Vec<usize>,
}

impl ChainProgress {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            finished_draws: 0,
            total_draws: total,
            divergences: 0,
            tuning: true,
            started: false,
            latest_num_steps: 0,
            step_size: 0f64,
            total_num_steps: 0,
            runtime: Duration::ZERO,
            divergent_draws: Vec::new(),
        }
    }

    pub(crate) fn update(&mut self, stats: &SampleStats, draw_duration: Duration) {
        if stats.diverging & !stats.tuning {
            self.divergences += 1;
            self.divergent_draws.push(self.finished_draws);
        }
        self.finished_draws += 1;
        self.tuning = stats.tuning;

        self.latest_num_steps = stats.n_steps as usize;
        self.total_num_steps += stats.n_steps as usize;
        self.step_size = stats.step_size;
        self.runtime += draw_duration;
    }
}

/// The draws of one chain.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub chain_id: u64,
    pub sites: Arc<[Site]>,
    /// Stored draws in order, warmup draws only if they were requested
    pub draws: Vec<SampleRecord>,
    /// Completed draws, stored or not
    pub num_draws: u64,
    pub total_draws: u64,
    /// Divergences after warmup
    pub divergences: u64,
    pub warmup_divergences: u64,
    /// Trajectories after warmup that stopped at the maximum tree depth
    pub maxdepth_reached: u64,
    /// All requested draws were made
    pub finished: bool,
}

impl ChainOutput {
    fn new(chain_id: u64, sites: Arc<[Site]>, total_draws: u64) -> Self {
        Self {
            chain_id,
            sites,
            draws: vec![],
            num_draws: 0,
            total_draws,
            divergences: 0,
            warmup_divergences: 0,
            maxdepth_reached: 0,
            finished: false,
        }
    }

    fn record(&mut self, record: SampleRecord, keep: bool) {
        self.num_draws += 1;
        let stats = &record.stats;
        if stats.tuning {
            self.warmup_divergences += stats.diverging as u64;
        } else {
            self.divergences += stats.diverging as u64;
            self.maxdepth_reached += stats.maxdepth_reached as u64;
        }
        if keep {
            self.draws.push(record);
        }
    }

    /// Draws after warmup
    pub fn posterior(&self) -> impl Iterator<Item = &SampleRecord> + '_ {
        self.draws.iter().filter(|record| !record.stats.tuning)
    }

    pub fn num_posterior_draws(&self) -> usize {
        self.posterior().count()
    }

    /// The posterior draws of one site, or `None` if the model has no such site.
    pub fn site(&self, name: &str) -> Option<Vec<&[f64]>> {
        if !self.sites.iter().any(|site| site.name == name) {
            return None;
        }
        self.posterior()
            .map(|record| record.site(&self.sites, name))
            .collect()
    }

    /// The posterior draws of entry `index` of the flat parameter vector.
    pub fn coordinate(&self, index: usize) -> Vec<f64> {
        self.posterior()
            .map(|record| record.values[index])
            .collect()
    }

    /// Indices of the divergent draws after warmup.
    pub fn divergent_draws(&self) -> Vec<u64> {
        self.posterior()
            .filter(|record| record.stats.diverging)
            .map(|record| record.stats.draw)
            .collect()
    }
}

/// A chain that stopped with an error, with the draws it made before.
#[derive(Debug)]
pub struct ChainFailure {
    pub chain_id: u64,
    pub error: anyhow::Error,
    pub output: ChainOutput,
}

#[derive(Debug, Default)]
pub struct Trace {
    pub chains: Vec<ChainOutput>,
    pub failed: Vec<ChainFailure>,
}

impl Trace {
    fn from_results(results: impl IntoIterator<Item = Result<ChainOutput, ChainFailure>>) -> Self {
        let (mut chains, mut failed): (Vec<_>, Vec<_>) = results.into_iter().partition_result();
        chains.sort_unstable_by_key(|chain| chain.chain_id);
        failed.sort_unstable_by_key(|failure| failure.chain_id);
        Trace { chains, failed }
    }

    /// Divergences after warmup over all successful chains
    pub fn num_divergences(&self) -> u64 {
        self.chains.iter().map(|chain| chain.divergences).sum()
    }

    pub fn num_maxdepth_reached(&self) -> u64 {
        self.chains.iter().map(|chain| chain.maxdepth_reached).sum()
    }

    /// Completed draws over all chains, failed ones included
    pub fn num_draws(&self) -> u64 {
        self.chains
            .iter()
            .chain(self.failed.iter().map(|failure| &failure.output))
            .map(|chain| chain.num_draws)
            .sum()
    }

    /// Chains that made all requested draws
    pub fn num_finished_chains(&self) -> usize {
        self.chains.iter().filter(|chain| chain.finished).count()
    }
}

pub struct ProgressCallback {
    pub callback: Box<dyn FnMut(Duration, Box<[ChainProgress]>) + Send>,
    pub rate: Duration,
}

enum ChainCommand {
    Resume,
    Pause,
}

struct ChainTrace {
    output: ChainOutput,
    error: Option<anyhow::Error>,
}

impl ChainTrace {
    fn inspect(&self) -> Result<ChainOutput, ChainFailure> {
        match &self.error {
            None => Ok(self.output.clone()),
            Some(err) => Err(ChainFailure {
                chain_id: self.output.chain_id,
                error: anyhow!("{err:#}"),
                output: self.output.clone(),
            }),
        }
    }

    fn finalize(self) -> Result<ChainOutput, ChainFailure> {
        match self.error {
            None => Ok(self.output),
            Some(error) => Err(ChainFailure {
                chain_id: self.output.chain_id,
                error,
                output: self.output,
            }),
        }
    }
}

/// Initialize a chain and draw until it is done, the trace is taken away
/// or the command channel is closed.
fn draw_chain<M: Model>(
    model: &M,
    settings: &NutsSettings,
    chain_id: u64,
    trace: &Mutex<Option<ChainTrace>>,
    progress: &Mutex<ChainProgress>,
    commands: Option<&Receiver<ChainCommand>>,
) -> Result<()> {
    let mut chain = settings.new_chain(chain_id, TransformedLogp::new(model));
    progress.lock().expect("Poisoned mutex").started = true;

    initialize_chain(&mut chain, &settings.init_strategy, settings.max_init_tries)
        .with_context(|| format!("Failed to initialize chain {chain_id}"))?;

    let next_command = || match commands {
        Some(commands) => commands.try_recv(),
        None => Err(TryRecvError::Empty),
    };

    let mut msg = next_command();
    loop {
        match msg {
            // The remote end is dead
            Err(TryRecvError::Disconnected) => {
                break;
            }
            Err(TryRecvError::Empty) => {}
            Ok(ChainCommand::Pause) => {
                msg = match commands {
                    Some(commands) => commands.recv().map_err(|e| e.into()),
                    None => Err(TryRecvError::Empty),
                };
                continue;
            }
            Ok(ChainCommand::Resume) => {}
        }

        let now = Instant::now();
        let (values, stats) = chain
            .draw()
            .with_context(|| format!("Sampling failed in chain {chain_id}"))?;
        let mut guard = trace
            .lock()
            .expect("Could not unlock trace lock. Poisoned mutex");

        let Some(val) = guard.as_mut() else {
            // The trace was removed by controller thread. We can stop sampling
            break;
        };
        progress
            .lock()
            .expect("Poisoned mutex")
            .update(&stats, now.elapsed());
        let keep = !stats.tuning || settings.store_warmup;
        val.output.record(SampleRecord { values, stats }, keep);
        if chain.phase() == ChainPhase::Done {
            val.output.finished = true;
            break;
        }
        drop(guard);

        msg = next_command();
    }
    Ok(())
}

fn run_chain<M: Model>(
    model: &M,
    settings: &NutsSettings,
    chain_id: u64,
    trace: &Mutex<Option<ChainTrace>>,
    progress: &Mutex<ChainProgress>,
    commands: Option<&Receiver<ChainCommand>>,
) {
    if let Err(err) = draw_chain(model, settings, chain_id, trace, progress, commands) {
        log::warn!("Chain {chain_id} failed: {err:#}");
        if let Some(trace) = trace.lock().expect("Poisoned mutex").as_mut() {
            trace.error = Some(err);
        }
    }
}

struct ChainProcess {
    stop_marker: Sender<ChainCommand>,
    trace: Arc<Mutex<Option<ChainTrace>>>,
    progress: Arc<Mutex<ChainProgress>>,
}

impl ChainProcess {
    fn finalize_many(chains: Vec<Self>) -> Vec<Result<ChainOutput, ChainFailure>> {
        chains
            .into_iter()
            .filter_map(|chain| chain.finalize())
            .collect_vec()
    }

    fn progress(&self) -> ChainProgress {
        self.progress.lock().expect("Poisoned lock").clone()
    }

    fn current_trace(&self) -> Option<Result<ChainOutput, ChainFailure>> {
        self.trace
            .lock()
            .expect("Poisoned lock")
            .as_ref()
            .map(|trace| trace.inspect())
    }

    fn resume(&self) -> Result<()> {
        self.stop_marker.send(ChainCommand::Resume)?;
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.stop_marker.send(ChainCommand::Pause)?;
        Ok(())
    }

    fn finalize(self) -> Option<Result<ChainOutput, ChainFailure>> {
        drop(self.stop_marker);
        self.trace
            .lock()
            .expect("Poisoned lock")
            .take()
            .map(|trace| trace.finalize())
    }

    fn start<'scope, M: Model>(
        model: &'scope M,
        chain_id: u64,
        settings: &'scope NutsSettings,
        sites: Arc<[Site]>,
        scope: &ScopeFifo<'scope>,
        results: Sender<u64>,
    ) -> Self {
        let (stop_marker_tx, stop_marker_rx) = channel();

        let trace = Arc::new(Mutex::new(Some(ChainTrace {
            output: ChainOutput::new(chain_id, sites, settings.total_draws()),
            error: None,
        })));
        let progress = Arc::new(Mutex::new(ChainProgress::new(
            settings.total_draws() as usize,
        )));

        let trace_inner = trace.clone();
        let progress_inner = progress.clone();

        scope.spawn_fifo(move |_| {
            run_chain(
                model,
                settings,
                chain_id,
                &trace_inner,
                &progress_inner,
                Some(&stop_marker_rx),
            );
            // The receiver is gone if the sampler was dropped without waiting
            let _ = results.send(chain_id);
        });

        Self {
            trace,
            stop_marker: stop_marker_tx,
            progress,
        }
    }
}

#[derive(Debug)]
enum SamplerCommand {
    Pause,
    Continue,
    InspectTrace,
    Progress,
}

enum SamplerResponse {
    Ok(),
    IntermediateTrace(Trace),
    Progress(Box<[ChainProgress]>),
}

pub enum SamplerWaitResult {
    Trace(Trace),
    Timeout(Sampler),
    Err(anyhow::Error, Option<Trace>),
}

/// Chains running in the background on a thread pool.
///
/// Every chain only stops between two draws, so a paused or aborted
/// sampler never contains partial trajectories.
pub struct Sampler {
    main_thread: JoinHandle<Result<Vec<Result<ChainOutput, ChainFailure>>>>,
    commands: SyncSender<SamplerCommand>,
    responses: Receiver<SamplerResponse>,
    results: Receiver<u64>,
}

impl Sampler {
    pub fn new<M: Model>(
        model: M,
        settings: NutsSettings,
        num_cores: usize,
        callback: Option<ProgressCallback>,
    ) -> Result<Self> {
        settings.validate().context("Invalid sampler settings")?;
        settings
            .validate_for_model(model.dim())
            .context("Settings do not fit the model")?;

        let (commands_tx, commands_rx) = sync_channel(0);
        let (responses_tx, responses_rx) = sync_channel(0);
        let (results_tx, results_rx) = channel();

        let main_thread = spawn(move || {
            let pool = ThreadPoolBuilder::new()
                .num_threads(num_cores.max(1) + 1) // One more thread because the controller also uses one
                .thread_name(|i| format!("nuts-sampler-worker-{}", i))
                .build()
                .context("Could not start thread pool")?;

            let settings_ref = &settings;
            let model_ref = &model;
            let sites: Arc<[Site]> = model.sites().into();
            let mut callback = callback;

            pool.scope_fifo(move |scope| {
                let results = results_tx;
                let mut chains = Vec::with_capacity(settings_ref.num_chains);

                for chain_id in 0..settings_ref.num_chains {
                    let chain = ChainProcess::start(
                        model_ref,
                        chain_id as u64,
                        settings_ref,
                        sites.clone(),
                        scope,
                        results.clone(),
                    );
                    chains.push(chain);
                }
                drop(results);

                let mut main_loop = || {
                    let start_time = Instant::now();
                    let mut pause_start = Instant::now();
                    let mut pause_time = Duration::ZERO;

                    let mut progress_rate = Duration::MAX;
                    if let Some(ProgressCallback { callback, rate }) = &mut callback {
                        let progress = chains.iter().map(|chain| chain.progress()).collect_vec();
                        callback(start_time.elapsed(), progress.into());
                        progress_rate = *rate;
                    }
                    let mut last_progress = Instant::now();
                    let mut is_paused = false;

                    loop {
                        let timeout = progress_rate.checked_sub(last_progress.elapsed());
                        let timeout = timeout.unwrap_or_else(|| {
                            if let Some(ProgressCallback { callback, .. }) = &mut callback {
                                let progress =
                                    chains.iter().map(|chain| chain.progress()).collect_vec();
                                let mut elapsed = start_time.elapsed().saturating_sub(pause_time);
                                if is_paused {
                                    elapsed = elapsed.saturating_sub(pause_start.elapsed());
                                }
                                callback(elapsed, progress.into());
                            }
                            last_progress = Instant::now();
                            progress_rate
                        });

                        match commands_rx.recv_timeout(timeout) {
                            Ok(SamplerCommand::Pause) => {
                                for chain in chains.iter() {
                                    // This fails if the chain is done.
                                    let _ = chain.pause();
                                }
                                if !is_paused {
                                    pause_start = Instant::now();
                                }
                                is_paused = true;
                                responses_tx.send(SamplerResponse::Ok())?;
                            }
                            Ok(SamplerCommand::Continue) => {
                                for chain in chains.iter() {
                                    let _ = chain.resume();
                                }
                                if is_paused {
                                    pause_time += pause_start.elapsed();
                                }
                                is_paused = false;
                                responses_tx.send(SamplerResponse::Ok())?;
                            }
                            Ok(SamplerCommand::InspectTrace) => {
                                let trace = Trace::from_results(
                                    chains.iter().filter_map(|chain| chain.current_trace()),
                                );
                                responses_tx.send(SamplerResponse::IntermediateTrace(trace))?;
                            }
                            Ok(SamplerCommand::Progress) => {
                                let progress =
                                    chains.iter().map(|chain| chain.progress()).collect_vec();
                                responses_tx.send(SamplerResponse::Progress(progress.into()))?;
                            }
                            Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => {
                                if let Some(ProgressCallback { callback, .. }) = &mut callback {
                                    let progress =
                                        chains.iter().map(|chain| chain.progress()).collect_vec();
                                    let mut elapsed =
                                        start_time.elapsed().saturating_sub(pause_time);
                                    if is_paused {
                                        elapsed = elapsed.saturating_sub(pause_start.elapsed());
                                    }
                                    callback(elapsed, progress.into());
                                }
                                return Ok(());
                            }
                        };
                    }
                };
                let result: Result<()> = main_loop();
                // Run finalization even if something failed
                let output = Ok(ChainProcess::finalize_many(chains));

                result?;
                output
            })
        });

        Ok(Self {
            main_thread,
            commands: commands_tx,
            responses: responses_rx,
            results: results_rx,
        })
    }

    pub fn pause(&mut self) -> Result<()> {
        self.commands
            .send(SamplerCommand::Pause)
            .context("Could not send pause command to controller thread")?;
        let response = self
            .responses
            .recv()
            .context("Could not recieve pause response from controller thread")?;
        let SamplerResponse::Ok() = response else {
            bail!("Got invalid response from sample controller thread");
        };
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        self.commands
            .send(SamplerCommand::Continue)
            .context("Could not send resume command to controller thread")?;
        let response = self.responses.recv()?;
        let SamplerResponse::Ok() = response else {
            bail!("Got invalid response from sample controller thread");
        };
        Ok(())
    }

    /// Stop all chains after their current draw and return what they sampled.
    pub fn abort(self) -> (Result<()>, Option<Trace>) {
        drop(self.commands);
        let result = self.main_thread.join();
        match result {
            Err(payload) => std::panic::resume_unwind(payload),
            Ok(Ok(traces)) => (Ok(()), Some(Trace::from_results(traces))),
            Ok(Err(err)) => (Err(err), None),
        }
    }

    /// A copy of the draws made so far.
    pub fn inspect_trace(&mut self) -> Result<Trace> {
        self.commands.send(SamplerCommand::InspectTrace)?;
        let response = self.responses.recv()?;
        let SamplerResponse::IntermediateTrace(trace) = response else {
            bail!("Got invalid response from sample controller thread");
        };
        Ok(trace)
    }

    pub fn wait_timeout(self, timeout: Duration) -> SamplerWaitResult {
        let start = Instant::now();
        loop {
            let Some(remaining) = timeout.checked_sub(start.elapsed()) else {
                return SamplerWaitResult::Timeout(self);
            };
            match self.results.recv_timeout(remaining) {
                Ok(_) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return match self.abort() {
                        (Ok(()), Some(trace)) => SamplerWaitResult::Trace(trace),
                        (Ok(()), None) => {
                            SamplerWaitResult::Err(anyhow!("No chains available"), None)
                        }
                        (Err(err), trace) => SamplerWaitResult::Err(err, trace),
                    };
                }
                Err(RecvTimeoutError::Timeout) => return SamplerWaitResult::Timeout(self),
            }
        }
    }

    /// Block until every chain is done.
    pub fn wait(self) -> Result<Trace> {
        while self.results.recv().is_ok() {}
        let (result, trace) = self.abort();
        result?;
        trace.context("Sampler stopped without a trace")
    }

    pub fn progress(&mut self) -> Result<Box<[ChainProgress]>> {
        self.commands.send(SamplerCommand::Progress)?;
        let response = self.responses.recv()?;
        let SamplerResponse::Progress(progress) = response else {
            bail!("Got invalid response from sample controller thread");
        };
        Ok(progress)
    }
}

/// Run all chains, in parallel or one after another depending on
/// `settings.chain_method`.
pub fn sample<M: Model>(model: M, settings: &NutsSettings) -> Result<Trace> {
    match settings.chain_method {
        ChainMethod::Parallel => {
            let num_cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(settings.num_chains);
            Sampler::new(model, settings.clone(), num_cores, None)?.wait()
        }
        ChainMethod::Sequential => {
            settings.validate().context("Invalid sampler settings")?;
            settings
                .validate_for_model(model.dim())
                .context("Settings do not fit the model")?;
            let sites: Arc<[Site]> = model.sites().into();

            let results = (0..settings.num_chains as u64).filter_map(|chain_id| {
                let trace = Mutex::new(Some(ChainTrace {
                    output: ChainOutput::new(chain_id, sites.clone(), settings.total_draws()),
                    error: None,
                }));
                let progress = Mutex::new(ChainProgress::new(settings.total_draws() as usize));
                run_chain(&model, settings, chain_id, &trace, &progress, None);
                trace
                    .into_inner()
                    .expect("Poisoned mutex")
                    .map(|trace| trace.finalize())
            });
            Ok(Trace::from_results(results))
        }
    }
}

/// Run a single chain on the calling thread and return its draws, warmup
/// included, as an iterator.
pub fn sample_sequentially<'model, M: Model>(
    model: &'model M,
    settings: &NutsSettings,
    chain_id: u64,
) -> Result<impl Iterator<Item = Result<SampleRecord>> + 'model> {
    settings.validate().context("Invalid sampler settings")?;
    settings
        .validate_for_model(model.dim())
        .context("Settings do not fit the model")?;

    let mut chain = settings.new_chain(chain_id, TransformedLogp::new(model));
    initialize_chain(&mut chain, &settings.init_strategy, settings.max_init_tries)
        .with_context(|| format!("Failed to initialize chain {chain_id}"))?;

    let draws = chain.total_draws();
    Ok((0..draws).map(move |_| {
        let (values, stats) = chain.draw()?;
        Ok(SampleRecord { values, stats })
    }))
}
