use clap::Parser;
use collbench::bench::{self, MeasureOptions, SelfAccumulate};
use collbench::device::{Buffer, CpuRuntime, DeviceRuntime, Dtype};
use collbench::error::{BenchError, Result};
use collbench::group::{self, Backend, Group, InitMethod};
use collbench::report;
use collbench::session::{self, EnvSnapshot, SessionConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Parser)]
#[command(
    name = "allreduce-bench",
    about = "Measure effective all-reduce bandwidth across a process group"
)]
struct Args {
    /// Transport backend: socket or local
    #[arg(long, default_value = "socket")]
    backend: String,

    /// Group initialization scheme; env reads MASTER_ADDR, MASTER_PORT,
    /// WORLD_SIZE and RANK from the environment
    #[arg(long, default_value = "env")]
    init_method: String,

    /// Number of buffer elements of the chosen dtype
    #[arg(long, default_value_t = 708_000_000)]
    element_count: usize,

    /// Number of experiments to run
    #[arg(long, default_value_t = 10)]
    experiments: usize,

    /// Number of all-reduce calls per experiment
    #[arg(long, default_value_t = 10)]
    calls: usize,

    /// Element dtype: f32, f16 or bf16
    #[arg(long, default_value = "bf16")]
    dtype: String,

    /// Pause between experiments in milliseconds
    #[arg(long, default_value_t = 1000)]
    pause_ms: u64,

    /// Write the rank-0 bandwidth report to this path as JSON
    #[arg(long)]
    report_json: Option<PathBuf>,
}

fn run(args: &Args) -> Result<()> {
    let backend = Backend::parse(&args.backend)?;
    let init_method = InitMethod::parse(&args.init_method)?;
    let dtype = Dtype::parse(&args.dtype)?;

    let env = EnvSnapshot::capture();
    let runtime = CpuRuntime;
    let local_rank = session::resolve_local_rank(&env, runtime.accelerator_count().max(1))?;
    let device = runtime.select(local_rank);
    debug!(local_rank, %device, "resolved process identity");

    let config = SessionConfig::from_env(&env, local_rank)?;
    let transport = group::connect(backend, init_method, &config)?;
    let mut group = Group::new();
    group.initialize(transport)?;

    let mut buffer = Buffer::allocate(&runtime, args.element_count, dtype, device)?;
    buffer.fill_pattern(config.global_rank as u64 + 1);

    let opts = MeasureOptions {
        experiments: args.experiments,
        calls: args.calls,
        pause: Duration::from_millis(args.pause_ms),
    };
    let mut baseline = SelfAccumulate;
    let times = bench::measure(&mut group, &runtime, &mut buffer, &opts, &mut baseline)?;

    if group.rank()? == 0 {
        let report = report::derive_report(
            times,
            args.element_count,
            dtype,
            group.world_size()?,
            args.experiments,
            args.calls,
        );
        report::log_report(&report);
        if let Some(path) = &args.report_json {
            let json = serde_json::to_string_pretty(&report).map_err(|err| {
                BenchError::config(format!("cannot serialize bandwidth report: {err}"))
            })?;
            std::fs::write(path, json).map_err(|err| {
                BenchError::config(format!("cannot write {}: {err}", path.display()))
            })?;
        }
    }

    group.finalize()
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(kind = err.kind(), "benchmark failed: {err}");
            ExitCode::FAILURE
        }
    }
}
