//! Terminal progress bars for a running [`Sampler`](crate::Sampler).

use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::sampler::{ChainProgress, ProgressCallback};

const TEMPLATE: &str = "{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}";

/// One progress bar per chain, drawn together.
pub struct ProgressBars {
    multi: MultiProgress,
    bars: Vec<ProgressBar>,
}

impl ProgressBars {
    pub fn new(num_chains: usize, draws_per_chain: u64) -> Self {
        Self::with_draw_target(num_chains, draws_per_chain, ProgressDrawTarget::stderr())
    }

    pub fn with_draw_target(
        num_chains: usize,
        draws_per_chain: u64,
        target: ProgressDrawTarget,
    ) -> Self {
        let multi = MultiProgress::with_draw_target(target);
        let style = match ProgressStyle::default_bar().template(TEMPLATE) {
            Ok(style) => style.progress_chars("##-"),
            Err(err) => {
                log::warn!("Invalid progress bar template: {err}");
                ProgressStyle::default_bar()
            }
        };
        let bars = (0..num_chains)
            .map(|chain| {
                let bar = multi.add(ProgressBar::new(draws_per_chain));
                bar.set_style(style.clone());
                bar.set_prefix(format!("Chain {chain}"));
                bar
            })
            .collect();
        Self { multi, bars }
    }

    pub fn update(&self, progress: &[ChainProgress]) {
        for (bar, chain) in self.bars.iter().zip(progress) {
            bar.set_length(chain.total_draws as u64);
            bar.set_position(chain.finished_draws as u64);
            let phase = if !chain.started {
                "waiting"
            } else if chain.tuning {
                "warmup"
            } else {
                "sampling"
            };
            bar.set_message(format!(
                "{phase}, {} divergences, step size {:.2e}, {} steps",
                chain.divergences, chain.step_size, chain.latest_num_steps
            ));
        }
    }

    pub fn finish(&self) {
        for bar in &self.bars {
            bar.finish_with_message("Done!");
        }
    }

    pub fn position(&self, chain: usize) -> Option<u64> {
        self.bars.get(chain).map(|bar| bar.position())
    }

    /// Redraw the bars from the sampler every `rate`.
    pub fn into_callback(self, rate: Duration) -> ProgressCallback {
        ProgressCallback {
            callback: Box::new(move |_elapsed, progress| {
                self.update(&progress);
                if progress
                    .iter()
                    .all(|chain| chain.finished_draws == chain.total_draws)
                {
                    self.finish();
                }
            }),
            rate,
        }
    }

    pub fn multi(&self) -> &MultiProgress {
        &self.multi
    }
}
