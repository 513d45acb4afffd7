//! pipepool-runner — drives a batch of simulated conversion jobs through a
//! bounded worker pool.
//!
//! Each job stands in for one pipeline execution (image, mesh, or document
//! conversion). Workers are simulated execution contexts that are created on
//! first use and reused afterwards.
//!
//! # Usage
//!
//! ```bash
//! # 12 jobs on the configured pool
//! pipepool-runner
//!
//! # 30 mesh jobs on 3 workers, every 7th job exits non-zero, cancel after 10
//! pipepool-runner --pool-size 3 --jobs 30 --kind mesh --fail-every 7 --cancel-after 10
//!
//! # Via environment variables
//! PIPEPOOL_POOL_SIZE=2 RUST_LOG=pipepool=debug pipepool-runner
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use pipepool::{Invocation, Invoke, PoolConfig, PoolError, Worker, WorkerPool};

// ── CLI ─────────────────────────────────────────────────────────────

/// Run simulated image, mesh, and document conversions on a worker pool.
#[derive(Parser, Debug)]
#[command(name = "pipepool-runner", version, about)]
struct Cli {
    /// Path to the pool config file.
    #[arg(long, env = "PIPEPOOL_CONFIG", default_value = "config/pipepool.toml")]
    config: String,

    /// Number of workers (overrides the config file).
    #[arg(long)]
    pool_size: Option<usize>,

    /// Number of jobs to submit.
    #[arg(long, default_value_t = 12)]
    jobs: usize,

    /// Only submit jobs of this kind (default: cycle through all kinds).
    #[arg(long, value_enum)]
    kind: Option<JobKind>,

    /// Base latency of a simulated pipeline in milliseconds.
    #[arg(long, default_value_t = 40)]
    base_latency_ms: u64,

    /// Every Nth job exits with a non-zero return code (0 = never).
    #[arg(long, default_value_t = 0)]
    fail_every: usize,

    /// Cancel the remaining jobs once this many have completed.
    #[arg(long)]
    cancel_after: Option<usize>,
}

// ── Jobs ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
enum JobKind {
    Image,
    Mesh,
    Document,
}

impl JobKind {
    const ALL: [JobKind; 3] = [JobKind::Image, JobKind::Mesh, JobKind::Document];

    fn pipeline(self) -> &'static str {
        match self {
            JobKind::Image => "image-read-write",
            JobKind::Mesh => "mesh-read-write",
            JobKind::Document => "structured-report-to-html",
        }
    }

    fn extensions(self) -> (&'static str, &'static str) {
        match self {
            JobKind::Image => ("png", "nrrd"),
            JobKind::Mesh => ("stl", "vtk"),
            JobKind::Document => ("dcm", "html"),
        }
    }
}

#[derive(Debug, Clone)]
struct ConversionJob {
    kind: JobKind,
    input: String,
    latency: Duration,
    exit_code: i32,
}

fn build_jobs(cli: &Cli) -> Vec<ConversionJob> {
    (0..cli.jobs)
        .map(|index| {
            let kind = cli.kind.unwrap_or(JobKind::ALL[index % JobKind::ALL.len()]);
            let (input_ext, _) = kind.extensions();
            // deterministic spread between 1x and 5x the base latency
            let factor = 1 + (index as u64 * 7) % 5;
            let fails = cli.fail_every > 0 && (index + 1) % cli.fail_every == 0;
            ConversionJob {
                kind,
                input: format!("{}-{index:03}.{input_ext}", kind.pipeline()),
                latency: Duration::from_millis(cli.base_latency_ms * factor),
                exit_code: if fails { 1 } else { 0 },
            }
        })
        .collect()
}

// ── Simulated pipelines ─────────────────────────────────────────────

/// Simulated execution context. Counts the jobs it has served.
#[derive(Debug)]
struct PipelineWorker {
    id: usize,
    jobs_run: usize,
}

impl Worker for PipelineWorker {
    fn terminate(self) {
        debug!(worker = self.id, jobs = self.jobs_run, "pipeline worker terminated");
    }
}

/// Outcome of one pipeline execution. A non-zero return code is a logical
/// failure of the job, not of the worker.
#[derive(Debug, Serialize)]
struct PipelineOutcome {
    kind: JobKind,
    pipeline: &'static str,
    input: String,
    output: Option<String>,
    worker: usize,
    return_code: i32,
    stderr: String,
}

#[derive(Default)]
struct SimulatedPipelines {
    next_worker: AtomicUsize,
}

#[async_trait]
impl Invoke for SimulatedPipelines {
    type Worker = PipelineWorker;
    type Args = ConversionJob;
    type Output = PipelineOutcome;

    async fn invoke(
        &self,
        worker: Option<PipelineWorker>,
        job: ConversionJob,
    ) -> anyhow::Result<Invocation<PipelineWorker, PipelineOutcome>> {
        let mut worker = match worker {
            Some(worker) => worker,
            None => {
                let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
                debug!(worker = id, "pipeline worker created");
                PipelineWorker { id, jobs_run: 0 }
            }
        };

        tokio::time::sleep(job.latency).await;
        worker.jobs_run += 1;

        let (_, output_ext) = job.kind.extensions();
        let succeeded = job.exit_code == 0;
        let outcome = PipelineOutcome {
            kind: job.kind,
            pipeline: job.kind.pipeline(),
            output: succeeded.then(|| format!("{}.{output_ext}", job.input)),
            stderr: if succeeded {
                String::new()
            } else {
                format!("{}: could not read {}", job.kind.pipeline(), job.input)
            },
            input: job.input,
            worker: worker.id,
            return_code: job.exit_code,
        };
        Ok(Invocation::new(worker, outcome))
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load pool config (fall back to defaults if file not found)
    let mut config = match PoolConfig::from_file(&cli.config) {
        Ok(cfg) => {
            info!(path = %cli.config, "loaded pool config");
            cfg
        }
        Err(e) => {
            warn!(error = %e, path = %cli.config, "failed to load config, using defaults");
            PoolConfig::from_env()?
        }
    };
    if let Some(size) = cli.pool_size {
        config.pool_size = Some(size);
    }

    let pool = WorkerPool::from_config(&config, SimulatedPipelines::default())?;
    let jobs = build_jobs(&cli);
    let total = jobs.len();
    info!(jobs = total, pool_size = pool.pool_size(), "submitting conversion jobs");

    let (progress_tx, mut progress_rx) = watch::channel(0usize);
    let mut handle = pool.submit(
        jobs,
        Some(Box::new(move |done: usize, total: usize| {
            info!(done, total, "job finished");
            let _ = progress_tx.send(done);
        })),
    );
    let run = handle.id();

    let mut watching = cli.cancel_after.is_some();
    let outcome = loop {
        tokio::select! {
            result = &mut handle => break result,
            changed = progress_rx.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let done = *progress_rx.borrow();
                if cli.cancel_after.is_some_and(|limit| done >= limit) {
                    info!(run = %run, done, "cancel threshold reached");
                    pool.cancel(run);
                    watching = false;
                }
            }
        }
    };

    match outcome {
        Ok(outcomes) => {
            let failed = outcomes.iter().filter(|o| o.return_code != 0).count();
            if failed > 0 {
                warn!(failed, total, "some pipelines exited with a non-zero return code");
            }
            println!("{}", serde_json::to_string_pretty(&outcomes)?);
        }
        Err(PoolError::Canceled) => {
            warn!(run = %run, "run canceled before all jobs were dispatched");
        }
        Err(e) => return Err(e.into()),
    }

    pool.terminate_all();
    // An empty run settles only after the terminate command has been processed.
    pool.run(Vec::new()).await?;
    info!(metrics = %serde_json::to_string(&pool.metrics())?, "pool metrics");

    Ok(())
}
