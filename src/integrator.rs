// =============================================================================
// CONVERGENCE DRIVER - Doubling midpoint quadrature on the GPU
// =============================================================================
//
// Each iteration dispatches the kernel over the current split lattice, reads
// the partial sums back, scales them by the cell area and compares the result
// with the previous one. Both split counts double after every iteration.
// The loop stops as soon as either error target is met or the iteration cap
// is reached.

use bytemuck::{Pod, Zeroable};
use std::time::{Duration, Instant};

use ash::vk;

use crate::backend::{
    Buffer, ComputeDevice, ComputePipeline, ParameterBlock, QueueRole, ResourceBinding,
    SubmitMode, SyncPool,
};
use crate::config::{Config, DispatchConfig};
use crate::error::Result;

/// Inline parameter block shared with the kernels (six doubles, std430)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct IntegralParams {
    pub start_x: f64,
    pub end_x: f64,
    pub splits_x: f64,
    pub start_y: f64,
    pub end_y: f64,
    pub splits_y: f64,
}

impl IntegralParams {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

/// Integration rectangle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub x: (f64, f64),
    pub y: (f64, f64),
}

impl Bounds {
    pub fn area(&self) -> f64 {
        (self.x.1 - self.x.0) * (self.y.1 - self.y.0)
    }
}

/// Stopping targets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub abs: f64,
    pub rel: f64,
}

/// Absolute and relative change between two successive results.
///
/// The relative error is `|abs_err / result|` for any nonzero result, however
/// small. At exactly zero it is reported as 0 when nothing changed and as
/// infinity otherwise, never NaN.
pub fn error_estimate(previous: f64, result: f64) -> (f64, f64) {
    let abs_err = (previous - result).abs();
    let rel_err = if result == 0.0 {
        if abs_err == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        (abs_err / result).abs()
    };
    (abs_err, rel_err)
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationState {
    pub bounds: Bounds,
    pub splits: [u64; 2],
    pub result: f64,
    pub previous: f64,
    pub abs_err: f64,
    pub rel_err: f64,
    pub iterations: u32,
    pub tolerance: Tolerance,
    pub max_iter: u32,
}

impl IntegrationState {
    pub fn new(bounds: Bounds, splits: [u64; 2], tolerance: Tolerance, max_iter: u32) -> Self {
        Self {
            bounds,
            splits,
            result: 0.0,
            previous: 0.0,
            abs_err: 0.0,
            rel_err: 0.0,
            iterations: 0,
            tolerance,
            max_iter,
        }
    }

    /// Parameter block for the current resolution
    pub fn params(&self) -> IntegralParams {
        IntegralParams {
            start_x: self.bounds.x.0,
            end_x: self.bounds.x.1,
            splits_x: self.splits[0] as f64,
            start_y: self.bounds.y.0,
            end_y: self.bounds.y.1,
            splits_y: self.splits[1] as f64,
        }
    }

    pub fn cell_area(&self) -> f64 {
        self.bounds.area() / (self.splits[0] as f64 * self.splits[1] as f64)
    }

    /// Fold in the integral computed at the current resolution and move to
    /// the next one
    pub fn record(&mut self, result: f64) {
        let (abs_err, rel_err) = error_estimate(self.previous, result);
        self.result = result;
        self.abs_err = abs_err;
        self.rel_err = rel_err;
        self.previous = result;
        self.splits = self.splits.map(|s| s.saturating_mul(2));
        self.iterations += 1;
    }

    pub fn should_continue(&self) -> bool {
        self.abs_err >= self.tolerance.abs
            && self.rel_err >= self.tolerance.rel
            && self.iterations < self.max_iter
    }

    /// Whether either error target has been met
    pub fn converged(&self) -> bool {
        self.abs_err < self.tolerance.abs || self.rel_err < self.tolerance.rel
    }
}

/// Final report of a run
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub result: f64,
    pub abs_err: f64,
    pub rel_err: f64,
    pub iterations: u32,
    pub splits: [u64; 2],
    pub converged: bool,
    pub elapsed: Duration,
}

/// Drives the refinement loop over already built GPU resources
pub struct ConvergenceDriver<'a> {
    device: &'a dyn ComputeDevice,
    pipeline: &'a mut ComputePipeline,
    pool: &'a SyncPool,
    buffer: &'a mut Buffer,
    groups: [u32; 3],
    mode: SubmitMode,
}

impl<'a> ConvergenceDriver<'a> {
    /// `buffer` must hold one f64 per work group of `groups`
    pub fn new(
        device: &'a dyn ComputeDevice,
        pipeline: &'a mut ComputePipeline,
        pool: &'a SyncPool,
        buffer: &'a mut Buffer,
        groups: [u32; 3],
        mode: SubmitMode,
    ) -> Self {
        Self {
            device,
            pipeline,
            pool,
            buffer,
            groups,
            mode,
        }
    }

    fn partial_sums(&self) -> usize {
        self.groups.iter().map(|&g| g as usize).product()
    }

    pub fn run(&mut self, mut state: IntegrationState) -> Result<Outcome> {
        let count = self.partial_sums();
        self.buffer
            .write(self.device, &vec![0u8; count * std::mem::size_of::<f64>()])?;

        log::info!(
            "Integrating over {:?} x {:?} from {}x{} splits, {}x{} work groups",
            state.bounds.x,
            state.bounds.y,
            state.splits[0],
            state.splits[1],
            self.groups[0],
            self.groups[1]
        );

        let start = Instant::now();
        let mut iteration: u64 = 0;
        loop {
            let params = state.params();
            let slot = self.pipeline.dispatch(
                self.device,
                self.pool,
                iteration,
                ParameterBlock::of(&params),
                self.groups,
                self.mode,
            )?;
            if self.mode == SubmitMode::Async {
                // The host must not read before the fence has signaled
                self.pipeline.wait(self.device, self.pool, slot)?;
            }

            let sums: Vec<f64> = self.buffer.read(self.device, count)?;
            let result = sums.iter().sum::<f64>() * state.cell_area();
            state.record(result);
            iteration += 1;

            log::debug!(
                "Iteration {}: result {:e}, abs_err {:e}, rel_err {:e}",
                state.iterations,
                state.result,
                state.abs_err,
                state.rel_err
            );

            if !state.should_continue() {
                break;
            }
        }
        let elapsed = start.elapsed();

        let outcome = Outcome {
            result: state.result,
            abs_err: state.abs_err,
            rel_err: state.rel_err,
            iterations: state.iterations,
            splits: state.splits,
            converged: state.converged(),
            elapsed,
        };
        if outcome.converged {
            log::info!("Converged after {} iteration(s)", outcome.iterations);
        } else {
            log::warn!(
                "Stopped at the iteration cap ({}) without reaching the target accuracy",
                outcome.iterations
            );
        }
        Ok(outcome)
    }
}

/// Build every GPU object a run needs from `config`, drive the loop with the
/// kernel in `code`, and release everything again, also on failure
pub fn integrate(device: &dyn ComputeDevice, code: &[u32], config: &Config) -> Result<Outcome> {
    let [grid_x, grid_y] = config.gpu.grid;
    let groups = device.limits().clamp_grid([grid_x, grid_y, 1]);
    if groups != [grid_x, grid_y, 1] {
        log::warn!(
            "Dispatch grid {}x{} clamped to {}x{} by device limits",
            grid_x,
            grid_y,
            groups[0],
            groups[1]
        );
    }
    let mode = match config.gpu.dispatch {
        DispatchConfig::Sync => SubmitMode::Sync,
        DispatchConfig::Async => SubmitMode::Async,
    };
    let partial_sums = u64::from(groups[0]) * u64::from(groups[1]);

    let mut buffer = Buffer::allocate(
        device,
        partial_sums * std::mem::size_of::<f64>() as u64,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        vk::SharingMode::EXCLUSIVE,
    )?;
    let mut binding = None;
    let mut pool = None;
    let mut pipeline = None;

    let result = (|| {
        let binding = binding.insert(ResourceBinding::new(device, &buffer)?);
        let pool = pool.insert(SyncPool::new(
            device,
            config.gpu.sync_slots,
            config.gpu.timeline_semaphores,
        )?);
        let pipeline = pipeline.insert(ComputePipeline::from_spirv(
            device,
            code,
            binding,
            IntegralParams::SIZE,
            pool.len(),
        )?);

        let state = IntegrationState::new(
            Bounds {
                x: config.x_range,
                y: config.y_range,
            },
            config.init_steps,
            Tolerance {
                abs: config.abs_err,
                rel: config.rel_err,
            },
            config.max_iter,
        );
        ConvergenceDriver::new(device, pipeline, pool, &mut buffer, groups, mode).run(state)
    })();

    // Nothing may still be executing when objects are released
    if let Err(e) = device.queue_wait_idle(QueueRole::Compute) {
        log::error!("vkQueueWaitIdle failed during teardown: {}", e);
    }
    if let Some(mut pipeline) = pipeline {
        pipeline.destroy(device);
    }
    if let Some(mut pool) = pool {
        pool.destroy(device);
    }
    if let Some(mut binding) = binding {
        binding.destroy(device);
    }
    buffer.destroy(device);

    result
}
