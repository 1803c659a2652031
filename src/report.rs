//! Bandwidth derivation and rank-0 reporting.

use serde::Serialize;
use tracing::info;

use crate::device::Dtype;

const MIB: f64 = 1024.0 * 1024.0;

/// Per-call times averaged over all experiments.
#[derive(Debug, Clone, Copy)]
pub struct MeasuredTimes {
    /// Mean per-call wall time of the collective, computation included.
    pub elapsed_seconds: f64,
    /// Mean per-call wall time of the computation-only baseline.
    pub computation_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BandwidthReport {
    pub experiments: usize,
    pub calls: usize,
    pub element_count: usize,
    pub dtype: Dtype,
    pub world_size: usize,
    pub elapsed_seconds: f64,
    pub computation_seconds: f64,
    pub communication_seconds: f64,
    /// Total data moved across the whole group, ring model:
    /// `buffer_mb * 2 * (world_size - 1)`.
    pub total_megabytes: f64,
    /// `None` means unbounded: communication cost was indistinguishable from
    /// zero at measurement resolution (or the group has a single member).
    pub bandwidth_mbps: Option<f64>,
}

/// Derive the bandwidth report from averaged times.
///
/// The subtraction attributes the computation-baseline share of wall time to
/// local work and the remainder to the network; negative differences are
/// measurement noise and clamp to zero.
pub fn derive_report(
    times: MeasuredTimes,
    element_count: usize,
    dtype: Dtype,
    world_size: usize,
    experiments: usize,
    calls: usize,
) -> BandwidthReport {
    let communication_seconds = (times.elapsed_seconds - times.computation_seconds).max(0.0);
    let buffer_mb = (element_count as u64 * dtype.size_in_bytes() as u64) as f64 / MIB;
    let total_megabytes = buffer_mb * 2.0 * world_size.saturating_sub(1) as f64;
    let bandwidth_mbps = if communication_seconds > 0.0 && total_megabytes > 0.0 {
        Some(total_megabytes / communication_seconds)
    } else {
        None
    };
    BandwidthReport {
        experiments,
        calls,
        element_count,
        dtype,
        world_size,
        elapsed_seconds: times.elapsed_seconds,
        computation_seconds: times.computation_seconds,
        communication_seconds,
        total_megabytes,
        bandwidth_mbps,
    }
}

/// Log the final metrics; called on rank 0 only.
pub fn log_report(report: &BandwidthReport) {
    info!(
        experiments = report.experiments,
        calls = report.calls,
        element_count = report.element_count,
        dtype = %report.dtype,
        world_size = report.world_size,
        "results averaged over {} experiments with {} all-reduce calls each",
        report.experiments,
        report.calls
    );
    info!(
        "avg all-reduce elapsed time (including computation): {:.6} seconds",
        report.elapsed_seconds
    );
    info!(
        "avg computation-only baseline time: {:.6} seconds",
        report.computation_seconds
    );
    info!(
        "avg communication (elapsed - computation) time: {:.6} seconds",
        report.communication_seconds
    );
    let speed = report
        .bandwidth_mbps
        .map_or_else(|| "inf".to_string(), |mbps| format!("{mbps:.2}"));
    info!(
        "total data moved across the group: {:.2} MB in {:.6} seconds, communication speed: {speed} MB/s",
        report.total_megabytes, report.communication_seconds
    );
}
