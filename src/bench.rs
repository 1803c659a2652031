//! Measurement engine.
//!
//! Runs the dual timing loop: a computation-only baseline on a private copy
//! of the buffer, then the real collective, both averaged per call and per
//! experiment. Every rank runs the same path; barriers align the timing
//! windows and device synchronization brackets them so asynchronous device
//! work cannot leak across a clock edge.

use std::time::{Duration, Instant};

use tracing::info;

use crate::device::{Buffer, DeviceRuntime};
use crate::error::{BenchError, Result};
use crate::group::{Group, ReduceOp};
use crate::report::MeasuredTimes;

/// Untimed all-reduce calls issued before measurement to prime transport
/// connections and lazy initialization.
pub const WARMUP_CALLS: usize = 5;

#[derive(Debug, Clone)]
pub struct MeasureOptions {
    pub experiments: usize,
    pub calls: usize,
    /// Rest between experiments, letting asynchronous device work drain and
    /// throttling burst load on the transport.
    pub pause: Duration,
}

impl Default for MeasureOptions {
    fn default() -> Self {
        MeasureOptions {
            experiments: 10,
            calls: 10,
            pause: Duration::from_secs(1),
        }
    }
}

/// Synthetic local workload standing in for the compute that shares the
/// timed region with communication in a real training step.
pub trait BaselineWorkload {
    fn run(&mut self, scratch: &mut Buffer);
}

/// Default baseline: element-wise add-to-self over the whole buffer.
pub struct SelfAccumulate;

impl BaselineWorkload for SelfAccumulate {
    fn run(&mut self, scratch: &mut Buffer) {
        scratch.accumulate_in_place();
    }
}

/// Run the measurement session and return per-call times averaged over all
/// experiments.
///
/// Any transport error propagates immediately; a failed collective leaves
/// group state ambiguous, so there is no retry.
pub fn measure(
    group: &mut Group,
    runtime: &dyn DeviceRuntime,
    buffer: &mut Buffer,
    opts: &MeasureOptions,
    baseline: &mut dyn BaselineWorkload,
) -> Result<MeasuredTimes> {
    if opts.experiments == 0 {
        return Err(BenchError::config("experiments must be at least 1"));
    }
    if opts.calls == 0 {
        return Err(BenchError::config("calls must be at least 1"));
    }

    let rank = group.rank()?;
    let world_size = group.world_size()?;
    let device = buffer.device();
    if rank == 0 {
        info!(rank, world_size, "starting measurement");
    }

    group.barrier()?;
    for _ in 0..WARMUP_CALLS {
        group.all_reduce(buffer, ReduceOp::Sum)?;
    }
    runtime.synchronize(device);

    let mut elapsed_total = 0.0_f64;
    let mut computation_total = 0.0_f64;

    for experiment in 0..opts.experiments {
        group.barrier()?;
        if rank == 0 {
            info!(
                experiment = experiment + 1,
                experiments = opts.experiments,
                "experiment"
            );
        }

        // Computation baseline on a private copy, so the timed collective
        // below starts from the same buffer state every experiment.
        let mut scratch = buffer.clone();
        runtime.synchronize(device);
        let started = Instant::now();
        for _ in 0..opts.calls {
            baseline.run(&mut scratch);
        }
        runtime.synchronize(device);
        computation_total += started.elapsed().as_secs_f64() / opts.calls as f64;

        runtime.synchronize(device);
        let started = Instant::now();
        for _ in 0..opts.calls {
            group.all_reduce(buffer, ReduceOp::Sum)?;
        }
        runtime.synchronize(device);
        elapsed_total += started.elapsed().as_secs_f64() / opts.calls as f64;

        if !opts.pause.is_zero() {
            std::thread::sleep(opts.pause);
        }
    }

    Ok(MeasuredTimes {
        elapsed_seconds: elapsed_total / opts.experiments as f64,
        computation_seconds: computation_total / opts.experiments as f64,
    })
}
