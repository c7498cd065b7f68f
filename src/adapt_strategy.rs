use rand::Rng;
use serde::Serialize;

use crate::{
    hamiltonian::EuclideanHamiltonian,
    mass_matrix_adapt::{MassMatrixAdapt, MassMatrixRegularization},
    potential::CpuLogpFunc,
    state::State,
    stepsize::{DualAverage, DualAverageOptions},
};

/// Sizes of the warmup buffers and of the first slow window.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WindowSettings {
    /// Fast adaptation of the step size only, at the start of warmup
    pub init_buffer: u64,
    /// Fast adaptation of the step size only, at the end of warmup
    pub term_buffer: u64,
    /// Length of the first mass matrix window, later windows double
    pub base_window: u64,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            init_buffer: 75,
            term_buffer: 50,
            base_window: 25,
        }
    }
}

/// A warmup window, `start` and `end` are inclusive draw indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptWindow {
    pub start: u64,
    pub end: u64,
}

impl AdaptWindow {
    fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end + 1 - self.start
    }
}

/// Split `num_warmup` draws into an initial buffer, expanding slow windows
/// and a terminal buffer.
///
/// Warmups with fewer than 20 draws get a single window. If the buffers do
/// not fit, 15% of the draws go to the initial and 10% to the terminal
/// buffer. Zero sized buffers and windows are treated as length one, so
/// the first and the last window never adapt the mass matrix.
pub fn build_adaptation_schedule(num_warmup: u64, settings: &WindowSettings) -> Vec<AdaptWindow> {
    if num_warmup == 0 {
        return vec![];
    }
    if num_warmup < 20 {
        return vec![AdaptWindow::new(0, num_warmup - 1)];
    }

    let mut init_buffer = settings.init_buffer.max(1);
    let mut term_buffer = settings.term_buffer.max(1);
    let mut base_window = settings.base_window.max(1);
    if init_buffer
        .saturating_add(base_window)
        .saturating_add(term_buffer)
        > num_warmup
    {
        init_buffer = (0.15 * num_warmup as f64) as u64;
        term_buffer = (0.1 * num_warmup as f64) as u64;
        base_window = num_warmup - init_buffer - term_buffer;
    }

    let mut schedule = vec![AdaptWindow::new(0, init_buffer - 1)];

    let end_window_start = num_warmup - term_buffer;
    let mut next_window_size = base_window;
    let mut next_window_start = init_buffer;
    while next_window_start < end_window_start {
        let cur_window_start = next_window_start;
        let mut cur_window_size = next_window_size;
        if 3 * cur_window_size <= end_window_start - cur_window_start {
            next_window_size = 2 * cur_window_size;
        } else {
            cur_window_size = end_window_start - cur_window_start;
        }
        next_window_start = cur_window_start + cur_window_size;
        schedule.push(AdaptWindow::new(cur_window_start, next_window_start - 1));
    }
    schedule.push(AdaptWindow::new(end_window_start, num_warmup - 1));
    schedule
}

#[derive(Debug, Clone, Copy)]
pub struct AdaptOptions {
    pub target_accept: f64,
    pub adapt_step_size: bool,
    pub adapt_mass_matrix: bool,
    pub find_heuristic_step_size: bool,
    pub dense_mass: bool,
    pub regularization: Option<MassMatrixRegularization>,
    pub dual_average: DualAverageOptions,
    pub windows: WindowSettings,
}

impl Default for AdaptOptions {
    fn default() -> Self {
        Self {
            target_accept: 0.8,
            adapt_step_size: true,
            adapt_mass_matrix: true,
            find_heuristic_step_size: true,
            dense_mass: false,
            regularization: Some(MassMatrixRegularization::default()),
            dual_average: DualAverageOptions::default(),
            windows: WindowSettings::default(),
        }
    }
}

/// Step size and mass matrix adaptation over the warmup schedule.
///
/// The step size is tuned by dual averaging during all windows. Draws of the
/// slow windows (all but the first and the last) feed the mass matrix
/// estimator. At the end of each slow window the new mass matrix is
/// installed, the estimator is reset and the step size search starts over.
pub struct WindowedAdaptation {
    options: AdaptOptions,
    num_warmup: u64,
    schedule: Vec<AdaptWindow>,
    window_idx: usize,
    step_size: DualAverage,
    mass_matrix: MassMatrixAdapt,
    mass_matrix_updates: u64,
}

impl WindowedAdaptation {
    pub fn new(options: AdaptOptions, num_warmup: u64, dim: usize) -> Self {
        Self {
            schedule: build_adaptation_schedule(num_warmup, &options.windows),
            num_warmup,
            window_idx: 0,
            step_size: DualAverage::new(options.dual_average, 1.),
            mass_matrix: MassMatrixAdapt::new(dim, options.dense_mass, options.regularization),
            mass_matrix_updates: 0,
            options,
        }
    }

    pub fn schedule(&self) -> &[AdaptWindow] {
        &self.schedule
    }

    /// Index of the window the next warmup draw belongs to.
    pub fn window_idx(&self) -> usize {
        self.window_idx
    }

    #[cfg(test)]
    pub fn num_mass_matrix_updates(&self) -> u64 {
        self.mass_matrix_updates
    }

    /// The averaged step size of the current dual averaging run
    pub fn step_size_bar(&self) -> f64 {
        self.step_size.current_step_size_adapted()
    }

    fn is_slow_window(&self) -> bool {
        (0 < self.window_idx) & (self.window_idx + 1 < self.schedule.len())
    }

    pub fn init<F: CpuLogpFunc, R: Rng + ?Sized>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<F>,
        state: &State,
        rng: &mut R,
    ) {
        if self.options.adapt_step_size & self.options.find_heuristic_step_size {
            hamiltonian.find_reasonable_step_size(state, rng);
        }
        self.step_size.reset(hamiltonian.step_size(), 10.);
    }

    /// Update the adaptation after warmup draw number `draw`.
    ///
    /// `state` is the new draw, `accept_prob` the mean acceptance
    /// probability of its trajectory.
    pub fn adapt<F: CpuLogpFunc, R: Rng + ?Sized>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<F>,
        draw: u64,
        accept_prob: f64,
        state: &State,
        rng: &mut R,
    ) {
        if draw >= self.num_warmup {
            return;
        }

        if self.options.adapt_step_size {
            self.step_size
                .advance(accept_prob, self.options.target_accept);
            if draw + 1 == self.num_warmup {
                hamiltonian.set_step_size(self.step_size.current_step_size_adapted());
            } else {
                hamiltonian.set_step_size(self.step_size.current_step_size());
            }
        }

        let is_slow_window = self.is_slow_window();
        if self.options.adapt_mass_matrix & is_slow_window {
            self.mass_matrix.add_sample(state.position());
        }

        if draw + 1 == self.num_warmup {
            log::debug!(
                "Warmup finished with {} mass matrix updates",
                self.mass_matrix_updates
            );
        }

        let Some(window) = self.schedule.get(self.window_idx) else {
            return;
        };
        if draw != window.end {
            return;
        }
        self.window_idx += 1;
        if !is_slow_window {
            return;
        }

        log::debug!(
            "End of warmup window {} at draw {}",
            self.window_idx - 1,
            draw
        );

        if self.options.adapt_mass_matrix {
            match self.mass_matrix.estimate() {
                Ok(Some(mass_matrix)) => {
                    hamiltonian.set_mass_matrix(mass_matrix);
                    self.mass_matrix_updates += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!("Keeping previous mass matrix: {err}");
                }
            }
            self.mass_matrix.reset();
        }

        if self.options.adapt_step_size {
            if self.options.find_heuristic_step_size {
                hamiltonian.find_reasonable_step_size(state, rng);
            }
            self.step_size.reset(hamiltonian.step_size(), 10.);
        }
    }
}
