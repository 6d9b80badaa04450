//! # Pool Simulation
//!
//! Runs the whole control plane in one process against fake backends: two
//! clouds with different prices, an in-memory store, and a scripted agent.
//! Watch a run go SUBMITTED -> PROVISIONING -> PULLING -> RUNNING -> DONE
//! and its instance get parked as IDLE.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use skypool::{
    AgentJobStatus, BackendRegistry, BackendType, JobStatus, RunService, Scheduler,
    SchedulerConfig,
};
use skypool_testing::{
    offer, task_run_spec, FakeAgent, FakeCompute, InMemoryHeads, InMemoryStateStore,
    RecordingGateway, StaticProjects,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const PROJECT: &str = "demo";

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Two clouds: GCP is cheaper, so the provisioner should pick it first.
    let aws = Arc::new(FakeCompute::new(BackendType::Aws));
    aws.set_offers(vec![offer(BackendType::Aws, "p3.2xlarge", "us-east-1", true, 0.90)]);
    let gcp = Arc::new(FakeCompute::new(BackendType::Gcp));
    gcp.set_offers(vec![offer(
        BackendType::Gcp,
        "n1-standard-8",
        "us-central1",
        false,
        0.20,
    )]);

    let backends = Arc::new(BackendRegistry::new());
    backends.register(aws.clone());
    backends.register(gcp.clone());

    let store = Arc::new(InMemoryStateStore::new());
    let projects = StaticProjects::with_project(PROJECT, vec![BackendType::Aws, BackendType::Gcp]);
    let agent = Arc::new(FakeAgent::new());

    let mut config = SchedulerConfig::from_env()?;
    config.tick = Duration::from_millis(200);

    let scheduler = Arc::new(
        Scheduler::builder(store.clone(), backends.clone())
            .with_projects(projects.clone())
            .with_agent(agent.clone())
            .with_gateway(Arc::new(RecordingGateway::new()))
            .with_heads(Arc::new(InMemoryHeads::new()))
            .with_config(config)
            .build()?,
    );
    let handle = scheduler.start();

    let runs = RunService::new(store.clone(), projects);
    let run = runs.submit(PROJECT, task_run_spec("sim-1", 4, 16384)).await?;
    info!(run = %run.record.run_name, "submitted");

    // Let the loops provision and start the job, then script the container
    // exiting cleanly.
    let mut scripted_done = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let Some(current) = runs.get(PROJECT, "sim-1").await? else {
            continue;
        };
        info!(status = %current.status, cost = current.cost, "run status");
        if !scripted_done && current.status == JobStatus::Running {
            if let Some(data) = current
                .jobs
                .first()
                .and_then(|job| job.provisioning_data.as_ref())
            {
                agent.set_status(&data.instance_id, AgentJobStatus::Done);
                scripted_done = true;
            }
        }
        if current.status.is_finished() {
            break;
        }
    }

    let run = runs
        .get(PROJECT, "sim-1")
        .await?
        .ok_or_else(|| anyhow::anyhow!("run disappeared"))?;
    info!(status = %run.status, cost = run.cost, "final run state");
    for instance in store.all_instances() {
        info!(
            instance = %instance.name,
            status = %instance.status,
            backend = %instance.backend,
            price = instance.price,
            "instance state"
        );
    }

    handle.shutdown().await;
    Ok(())
}
