//! Adaptive Hamiltonian Monte Carlo with the No-U-Turn sampler.
//!
//! A [`Model`] provides the log density of its latent [`Site`]s in constrained
//! space and its gradient. The sampler maps every site to an unconstrained
//! space with a [`Transform`], tunes a step size and a mass matrix during
//! warmup and then draws from the posterior with NUTS.
//!
//! ```no_run
//! use nuts_sampler::{sample, NutsSettings};
//! # fn run<M: nuts_sampler::Model>(model: M) -> anyhow::Result<()> {
//! let settings = NutsSettings {
//!     num_chains: 4,
//!     seed: 42,
//!     ..Default::default()
//! };
//! let trace = sample(model, &settings)?;
//! println!("{}", trace.summary());
//! # Ok(())
//! # }
//! ```

pub(crate) mod adapt_strategy;
pub(crate) mod chain;
pub mod diagnostics;
pub(crate) mod hamiltonian;
pub(crate) mod init;
pub(crate) mod integrator;
pub(crate) mod mass_matrix;
pub(crate) mod mass_matrix_adapt;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod nuts;
pub(crate) mod potential;
pub mod progress;
pub(crate) mod sampler;
pub(crate) mod sampler_stats;
pub(crate) mod state;
pub(crate) mod stepsize;
pub(crate) mod transform;

pub use adapt_strategy::{build_adaptation_schedule, AdaptWindow, WindowSettings};
pub use chain::{ChainPhase, NutsChain};
pub use diagnostics::{Summary, TraceSummary};
pub use init::{initialize_chain, InitError, InitStrategy};
pub use mass_matrix::{DenseMassMatrix, DiagMassMatrix, MassMatrix, MassMatrixError};
pub use mass_matrix_adapt::MassMatrixRegularization;
pub use model::{Model, Site};
pub use nuts::{NutsError, NutsOptions};
pub use potential::{CpuLogpFunc, LogpError, Potential, PotentialError, TransformedLogp};
pub use progress::ProgressBars;
pub use sampler::{
    sample, sample_sequentially, ChainFailure, ChainMethod, ChainOutput, ChainProgress,
    NutsSettings, ProgressCallback, Sampler, SamplerWaitResult, SettingsError, Trace,
};
pub use sampler_stats::{SampleRecord, SampleStats};
pub use stepsize::DualAverageOptions;
pub use transform::Transform;
