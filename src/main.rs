use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use jobgraph::board::JobBoard;
use jobgraph::config::{BoardConfig, SchedulerConfig};
use jobgraph::graph::MemoryGraph;
use jobgraph::job::JobRecord;
use jobgraph::producer::JobProducer;
use jobgraph::scheduler::{DepJobService, JobState};
use jobgraph::transport::LocalBus;
use jobgraph::worker::{JobConsumer, ReportingWorker};

#[derive(Parser, Debug)]
#[command(name = "jobgraph")]
#[command(version)]
#[command(about = "Dependency-aware job distribution with a negotiating job board")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a self-contained demo pipeline: one board, two workers, a small
    /// dependency graph of jobs
    Demo(DemoArgs),
}

#[derive(Parser, Debug)]
struct DemoArgs {
    /// Number of workers to start
    #[arg(long, default_value = "2")]
    workers: usize,

    /// Milliseconds each demo job sleeps to simulate work
    #[arg(long, default_value = "100")]
    job_millis: u64,

    /// Log the board status summary every N seconds (0 disables)
    #[arg(long, default_value = "0")]
    status_secs: u64,
}

// =============================================================================
// Demo pipeline
// =============================================================================

async fn run_demo(args: DemoArgs) -> Result<(), Box<dyn std::error::Error>> {
    let bus = Arc::new(LocalBus::new());
    let board_addr = "board.demo";

    let mut board_config = BoardConfig::default();
    if args.status_secs > 0 {
        board_config = board_config.with_status_log(Duration::from_secs(args.status_secs), 5);
    }
    let board = JobBoard::new(
        bus.clone(),
        board_addr,
        "demo",
        board_config,
    )
    .spawn();

    let mut consumers = Vec::new();
    for i in 0..args.workers {
        let job_millis = args.job_millis;
        let worker = ReportingWorker::new(bus.clone(), move |job: &JobRecord| {
            tracing::info!(job_id = %job.id, request = %job.request, "Demo worker running job");
            std::thread::sleep(Duration::from_millis(job_millis));
            Ok(())
        });
        let consumer = JobConsumer::new(
            bus.clone(),
            format!("worker.demo.{i}"),
            board_addr,
            Some("demo".to_string()),
            Arc::new(worker),
        );
        consumers.push(consumer.spawn());
    }

    let store = Arc::new(MemoryGraph::new());
    let producer = JobProducer::new(bus.clone(), board_addr);
    let service = DepJobService::spawn(store, producer, SchedulerConfig::default());

    // extract -> transform -> load, plus an independent report job
    let extract = uuid::Uuid::new_v4().to_string();
    let transform = uuid::Uuid::new_v4().to_string();
    let load = uuid::Uuid::new_v4().to_string();
    let report = uuid::Uuid::new_v4().to_string();

    service
        .add_job(
            JobRecord::new(&extract, "demo", json!({"step": "extract"})),
            &[],
        )
        .await?;
    service
        .add_job(
            JobRecord::new(&transform, "demo", json!({"step": "transform"})),
            &[&extract],
        )
        .await?;
    service
        .add_job(
            JobRecord::new(&load, "demo", json!({"step": "load"})),
            &[&transform],
        )
        .await?;
    service
        .add_job(
            JobRecord::new(&report, "demo", json!({"step": "report"})),
            &[],
        )
        .await?;

    let all = [
        ("extract", &extract),
        ("transform", &transform),
        ("load", &load),
        ("report", &report),
    ];

    // Wait for the pipeline to drain.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let mut pending = 0usize;
        for (_, id) in &all {
            match service.get_job_status(id).await? {
                Some(JobState::Done | JobState::Failed | JobState::Cancelled) => {}
                _ => pending += 1,
            }
        }
        if pending == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(pending, "Demo timed out waiting for jobs");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    println!("{:<12} {:<38} STATE", "STEP", "JOB ID");
    println!("{}", "-".repeat(62));
    for (step, id) in &all {
        let state = service
            .get_job_status(id)
            .await?
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unset".to_string());
        println!("{:<12} {:<38} {}", step, id, state);
    }

    for consumer in consumers {
        consumer.join().await;
    }
    board.join().await;
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Demo(demo_args) => run_demo(demo_args).await?,
    }
    Ok(())
}
