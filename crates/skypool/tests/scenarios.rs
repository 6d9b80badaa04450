//! End-to-end scheduling scenarios: the real scheduler, the in-memory
//! store, and scripted backends, driven one explicit tick at a time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use skypool::StateStore;
use uuid::Uuid;

use skypool::models::gateway::{GatewayConfiguration, GatewayRecord};
use skypool::models::profile::Profile;
use skypool::models::run::{RunConfiguration, ServiceConfig};
use skypool::{
    AgentJobStatus, BackendError, BackendRegistry, BackendType, CreationPolicy, InstanceStatus,
    JobErrorCode, JobRecord, JobStatus, Requirements, RequestStatus, RetryPolicy, RunRecord,
    RunService, RunSpec, Scheduler,
};
use skypool_testing::{
    new_call_log, offer, ready_instance, task_run_spec, CallLog, FakeAgent, FakeCompute,
    InMemoryHeads, InMemoryStateStore, RecordingGateway, StaticProjects,
};

const PROJECT: &str = "acme";

struct Harness {
    store: Arc<InMemoryStateStore>,
    aws: Arc<FakeCompute>,
    gcp: Arc<FakeCompute>,
    agent: Arc<FakeAgent>,
    gateway: Arc<RecordingGateway>,
    scheduler: Arc<Scheduler<InMemoryStateStore>>,
    runs: RunService<InMemoryStateStore>,
    log: CallLog,
}

fn harness() -> Harness {
    let log = new_call_log();
    let aws = Arc::new(FakeCompute::with_call_log(BackendType::Aws, log.clone()));
    let gcp = Arc::new(FakeCompute::with_call_log(BackendType::Gcp, log.clone()));
    let backends = Arc::new(BackendRegistry::new());
    backends.register(aws.clone());
    backends.register(gcp.clone());

    let store = Arc::new(InMemoryStateStore::new());
    let projects =
        StaticProjects::with_project(PROJECT, vec![BackendType::Aws, BackendType::Gcp]);
    let agent = Arc::new(FakeAgent::new());
    let gateway = Arc::new(RecordingGateway::new());

    let scheduler = Arc::new(
        Scheduler::builder(store.clone(), backends)
            .with_projects(projects.clone())
            .with_agent(agent.clone())
            .with_gateway(gateway.clone())
            .with_heads(Arc::new(InMemoryHeads::new()))
            .build()
            .expect("all collaborators provided"),
    );
    let runs = RunService::new(store.clone(), projects);
    Harness {
        store,
        aws,
        gcp,
        agent,
        gateway,
        scheduler,
        runs,
        log,
    }
}

impl Harness {
    async fn job(&self, run_name: &str) -> JobRecord {
        let run = self
            .store
            .get_run(PROJECT, run_name)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("run {run_name} missing"));
        self.store.list_run_jobs(run.id).await.unwrap().remove(0)
    }

    fn run_job_calls(&self) -> Vec<BackendType> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, event)| event == "run_job")
            .map(|(backend, _)| *backend)
            .collect()
    }

    fn offer_query_calls(&self) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, event)| event == "get_offers")
            .count()
    }

    /// Submit → provision → pulling → running, asserting each hop.
    async fn drive_to_running(&self, run_name: &str) -> JobRecord {
        self.scheduler.process_submitted_jobs().await.unwrap();
        let job = self.job(run_name).await;
        assert_eq!(job.status, JobStatus::Provisioning, "after scheduling tick");

        self.scheduler.process_running_jobs().await.unwrap();
        let job = self.job(run_name).await;
        assert_eq!(job.status, JobStatus::Pulling, "agent reachable");

        let data = job.provisioning_data.clone().expect("provisioned job");
        self.agent
            .set_status(&data.instance_id, AgentJobStatus::Running);
        self.scheduler.process_running_jobs().await.unwrap();
        let job = self.job(run_name).await;
        assert_eq!(job.status, JobStatus::Running, "container started");
        job
    }

    /// I1/I3: busy instances and non-terminal jobs reference each other
    /// one-to-one.
    fn assert_single_ownership(&self) {
        let jobs = self.store.all_jobs();
        let instances = self.store.all_instances();
        let busy: Vec<_> = instances
            .iter()
            .filter(|instance| instance.status == InstanceStatus::Busy)
            .collect();
        let mut owners = HashSet::new();
        for instance in &busy {
            let owner = instance
                .job_id
                .unwrap_or_else(|| panic!("busy instance {} without owner", instance.name));
            assert!(owners.insert(owner), "two busy instances share one job");
            let job = jobs
                .iter()
                .find(|job| job.id == owner)
                .expect("owner job exists");
            assert!(
                !job.status.is_finished(),
                "terminal job {} still owns an instance",
                job.spec.job_name
            );
        }
        let backed = jobs
            .iter()
            .filter(|job| {
                !job.status.is_finished()
                    && instances.iter().any(|instance| instance.job_id == Some(job.id))
            })
            .count();
        assert_eq!(busy.len(), backed, "busy count != backed non-terminal jobs");
    }
}

/// Insert a run and its jobs directly, bypassing the submission service,
/// for tests that need a backdated or partially advanced run.
async fn insert_run(
    store: &InMemoryStateStore,
    run_name: &str,
    profile: Profile,
    submitted_at: chrono::DateTime<Utc>,
    job_statuses: &[JobStatus],
) -> (RunRecord, Vec<JobRecord>) {
    let mut spec = task_run_spec(run_name, 2, 8192);
    spec.profile = profile;
    let run = RunRecord {
        id: Uuid::new_v4(),
        project: PROJECT.to_string(),
        run_name: run_name.to_string(),
        spec: spec.clone(),
        submitted_at,
        gateway_registered: false,
        deleted: false,
    };
    store.create_run(&run).await.unwrap();
    let mut jobs = Vec::new();
    for (job_num, status) in job_statuses.iter().enumerate() {
        let job_spec = skypool::JobSpec {
            job_num: job_num as u32,
            job_name: format!("{run_name}-{job_num}"),
            image: "ubuntu:22.04".to_string(),
            entrypoint: None,
            commands: vec!["python train.py".to_string()],
            env: Default::default(),
            ports: vec![],
            requirements: Requirements {
                cpus: Some(2),
                memory_mib: Some(8192),
                ..Default::default()
            },
            gateway: None,
            pool_name: None,
            working_dir: None,
        };
        let job = JobRecord {
            id: Uuid::new_v4(),
            project: PROJECT.to_string(),
            run_id: run.id,
            run_name: run_name.to_string(),
            job_num: job_num as u32,
            submission_num: 0,
            spec: job_spec,
            status: *status,
            error_code: None,
            provisioning_data: None,
            aborted: false,
            submitted_at,
            last_contact_at: None,
            last_processed_at: submitted_at,
        };
        store.create_job(&job).await.unwrap();
        jobs.push(job);
    }
    (run, jobs)
}

fn service_run_spec(run_name: &str) -> RunSpec {
    RunSpec {
        run_name: Some(run_name.to_string()),
        configuration: RunConfiguration::Service(ServiceConfig {
            port: 8000,
            model: None,
            image: None,
            env: Default::default(),
            commands: vec![],
            resources: Requirements {
                cpus: Some(2),
                ..Default::default()
            },
        }),
        profile: Profile::default(),
        repo: None,
    }
}

// ============================================================================
// Scenario 1: reuse succeeds
// ============================================================================

#[tokio::test]
async fn reuse_matches_ready_instance_without_backend_call() {
    let h = harness();
    let pool = h.store.ensure_pool(PROJECT, "default").await.unwrap();
    let instance = ready_instance(PROJECT, pool.id, "warm-1", 0.50, 4, 16384);
    h.store.create_instance(&instance).await.unwrap();

    h.runs
        .submit(PROJECT, task_run_spec("train-1", 2, 8192))
        .await
        .unwrap();
    h.scheduler.process_submitted_jobs().await.unwrap();

    let job = h.job("train-1").await;
    assert_eq!(job.status, JobStatus::Provisioning);
    assert_eq!(
        job.provisioning_data.as_ref().unwrap(),
        &instance.provisioning_data
    );

    let snapshot = h.store.instance_snapshot(instance.id).unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Busy);
    assert_eq!(snapshot.job_id, Some(job.id));

    assert!(h.run_job_calls().is_empty(), "no backend launch for reuse");
    assert_eq!(h.offer_query_calls(), 0, "no offer query for reuse");
    h.assert_single_ownership();
}

// ============================================================================
// Scenario 2: provision after no reuse
// ============================================================================

#[tokio::test]
async fn provisioner_walks_offers_cheapest_first_with_fall_through() {
    let h = harness();
    h.aws
        .set_offers(vec![offer(BackendType::Aws, "p3.2xlarge", "us-east-1", true, 0.90)]);
    h.gcp.set_offers(vec![offer(
        BackendType::Gcp,
        "n1-standard-4",
        "us-central1",
        false,
        0.20,
    )]);
    // The cheap offer flakes; the walk must fall through to AWS.
    h.gcp
        .push_launch_failure(BackendError::Transient("api flake".into()));

    h.runs
        .submit(PROJECT, task_run_spec("train-2", 2, 8192))
        .await
        .unwrap();
    h.scheduler.process_submitted_jobs().await.unwrap();

    assert_eq!(
        h.run_job_calls(),
        vec![BackendType::Gcp, BackendType::Aws],
        "cheapest offer tried first, retriable failure falls through"
    );
    let job = h.job("train-2").await;
    assert_eq!(job.status, JobStatus::Provisioning);
    assert_eq!(
        job.provisioning_data.as_ref().unwrap().backend,
        BackendType::Aws
    );
    h.assert_single_ownership();
}

#[tokio::test]
async fn all_offers_fail_without_retry_means_failed_within_one_tick() {
    let h = harness();
    h.aws
        .set_offers(vec![offer(BackendType::Aws, "p3.2xlarge", "us-east-1", true, 0.90)]);
    h.gcp.set_offers(vec![offer(
        BackendType::Gcp,
        "n1-standard-4",
        "us-central1",
        false,
        0.20,
    )]);
    h.gcp
        .push_launch_failure(BackendError::NoCapacity("zone drained".into()));
    h.aws
        .push_launch_failure(BackendError::QuotaExceeded("gpu quota".into()));

    h.runs
        .submit(PROJECT, task_run_spec("train-3", 2, 8192))
        .await
        .unwrap();
    h.scheduler.process_submitted_jobs().await.unwrap();

    let job = h.job("train-3").await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_code,
        Some(JobErrorCode::FailedToStartDueToNoCapacity)
    );
    assert!(h.store.all_instances().is_empty(), "nothing was provisioned");
}

#[tokio::test]
async fn fatal_backend_error_aborts_the_walk() {
    let h = harness();
    h.aws
        .set_offers(vec![offer(BackendType::Aws, "p3.2xlarge", "us-east-1", true, 0.90)]);
    h.gcp.set_offers(vec![offer(
        BackendType::Gcp,
        "n1-standard-4",
        "us-central1",
        false,
        0.20,
    )]);
    h.gcp
        .push_launch_failure(BackendError::InvalidCredentials("expired key".into()));

    h.runs
        .submit(PROJECT, task_run_spec("train-4", 2, 8192))
        .await
        .unwrap();
    h.scheduler.process_submitted_jobs().await.unwrap();

    assert_eq!(
        h.run_job_calls(),
        vec![BackendType::Gcp],
        "fatal error must not fall through to the next offer"
    );
    let job = h.job("train-4").await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_code,
        Some(JobErrorCode::FailedToStartDueToBackendError)
    );
}

// ============================================================================
// Scenario 3: spot interruption with retry
// ============================================================================

#[tokio::test]
async fn spot_interruption_goes_pending_and_reschedules() {
    let h = harness();
    h.gcp.set_offers(vec![offer(
        BackendType::Gcp,
        "n1-standard-4",
        "us-central1",
        true,
        0.20,
    )]);

    let mut spec = task_run_spec("spot-1", 2, 8192);
    spec.profile.retry = RetryPolicy::Window(Duration::from_secs(2 * 3600));
    h.runs.submit(PROJECT, spec).await.unwrap();

    let job = h.drive_to_running("spot-1").await;
    let data = job.provisioning_data.clone().unwrap();

    // The spot VM is reclaimed: agent gone, backend reports NO_CAPACITY.
    h.agent.set_unreachable(&data.instance_id, true);
    h.gcp
        .set_request_head(&data.instance_id, RequestStatus::NoCapacity);
    h.scheduler.process_running_jobs().await.unwrap();

    let job = h.job("spot-1").await;
    assert_eq!(job.status, JobStatus::Pending, "retry active, not FAILED");
    assert_eq!(job.error_code, None);
    let old_instance = h
        .store
        .all_instances()
        .into_iter()
        .find(|instance| instance.provisioning_data.instance_id == data.instance_id)
        .unwrap();
    assert_eq!(old_instance.status, InstanceStatus::Terminated);
    assert_eq!(old_instance.job_id, None);

    // Next tick resubmits, the one after re-enters the scheduling decision.
    h.scheduler.process_submitted_jobs().await.unwrap();
    let job = h.job("spot-1").await;
    assert_eq!(job.status, JobStatus::Submitted);
    assert_eq!(job.submission_num, 1);

    h.scheduler.process_submitted_jobs().await.unwrap();
    let job = h.job("spot-1").await;
    assert_eq!(job.status, JobStatus::Provisioning);
    assert_ne!(
        job.provisioning_data.unwrap().instance_id,
        data.instance_id,
        "rescheduled onto a fresh instance"
    );
}

#[tokio::test]
async fn pending_job_fails_once_the_window_lapses() {
    let h = harness();
    let profile = Profile {
        retry: RetryPolicy::Window(Duration::from_secs(3600)),
        ..Default::default()
    };
    // Submitted two hours ago: the 1h window is gone.
    let submitted_at = Utc::now() - chrono::Duration::hours(2);
    insert_run(&h.store, "stale-1", profile, submitted_at, &[JobStatus::Pending]).await;

    h.scheduler.process_submitted_jobs().await.unwrap();
    let job = h.job("stale-1").await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_code,
        Some(JobErrorCode::FailedToStartDueToNoCapacity)
    );
}

// ============================================================================
// Scenario 4: idle reap
// ============================================================================

#[tokio::test]
async fn idle_instance_reaped_after_termination_idle_time() {
    let h = harness();
    let pool = h.store.ensure_pool(PROJECT, "default").await.unwrap();

    let mut old = ready_instance(PROJECT, pool.id, "old", 0.50, 4, 16384);
    old.status = InstanceStatus::Idle;
    old.created_at = Utc::now() - chrono::Duration::days(4);
    old.idle_since = Some(Utc::now() - chrono::Duration::days(3) - chrono::Duration::seconds(1));
    h.store.create_instance(&old).await.unwrap();

    let mut fresh = ready_instance(PROJECT, pool.id, "fresh", 0.50, 4, 16384);
    fresh.status = InstanceStatus::Idle;
    fresh.idle_since = Some(Utc::now() - chrono::Duration::hours(1));
    h.store.create_instance(&fresh).await.unwrap();

    // One instance per tick; two ticks cover both.
    h.scheduler.process_idle_instances().await.unwrap();
    h.scheduler.process_idle_instances().await.unwrap();

    assert_eq!(
        h.store.instance_snapshot(old.id).unwrap().status,
        InstanceStatus::Terminated
    );
    assert_eq!(
        h.store.instance_snapshot(fresh.id).unwrap().status,
        InstanceStatus::Idle,
        "an hour idle is nowhere near the 3d policy"
    );
    assert_eq!(
        h.aws.terminate_calls(),
        vec![old.provisioning_data.instance_id.clone()]
    );
}

#[tokio::test]
async fn dont_destroy_policy_is_never_reaped() {
    let h = harness();
    let pool = h.store.ensure_pool(PROJECT, "default").await.unwrap();
    let mut instance = ready_instance(PROJECT, pool.id, "keeper", 0.50, 4, 16384);
    instance.status = InstanceStatus::Idle;
    instance.termination_policy = skypool::TerminationPolicy::DontDestroy;
    instance.idle_since = Some(Utc::now() - chrono::Duration::days(30));
    h.store.create_instance(&instance).await.unwrap();

    h.scheduler.process_idle_instances().await.unwrap();
    assert_eq!(
        h.store.instance_snapshot(instance.id).unwrap().status,
        InstanceStatus::Idle
    );
    assert!(h.aws.terminate_calls().is_empty());
}

// ============================================================================
// Scenario 5: graceful stop
// ============================================================================

#[tokio::test]
async fn graceful_stop_parks_the_instance_idle() {
    let h = harness();
    h.gcp.set_offers(vec![offer(
        BackendType::Gcp,
        "n1-standard-4",
        "us-central1",
        false,
        0.20,
    )]);
    h.runs
        .submit(PROJECT, task_run_spec("svc-1", 2, 8192))
        .await
        .unwrap();
    let job = h.drive_to_running("svc-1").await;
    let data = job.provisioning_data.clone().unwrap();

    h.runs
        .stop(PROJECT, &["svc-1".to_string()], false)
        .await
        .unwrap();
    let job = h.job("svc-1").await;
    assert_eq!(job.status, JobStatus::Terminating);

    h.scheduler.process_terminating_jobs().await.unwrap();
    let job = h.job("svc-1").await;
    assert_eq!(job.status, JobStatus::Terminated);
    assert_eq!(h.agent.stop_calls(), vec![data.instance_id.clone()]);

    let instance = h
        .store
        .all_instances()
        .into_iter()
        .find(|instance| instance.provisioning_data.instance_id == data.instance_id)
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Idle, "not destroyed");
    assert!(instance.idle_since.is_some());
    assert!(h.gcp.terminate_calls().is_empty());
}

#[tokio::test]
async fn abort_skips_graceful_stop_and_destroys() {
    let h = harness();
    h.gcp.set_offers(vec![offer(
        BackendType::Gcp,
        "n1-standard-4",
        "us-central1",
        false,
        0.20,
    )]);
    h.runs
        .submit(PROJECT, task_run_spec("kill-1", 2, 8192))
        .await
        .unwrap();
    let job = h.drive_to_running("kill-1").await;
    let data = job.provisioning_data.clone().unwrap();

    h.runs
        .stop(PROJECT, &["kill-1".to_string()], true)
        .await
        .unwrap();
    h.scheduler.process_terminating_jobs().await.unwrap();

    let job = h.job("kill-1").await;
    assert_eq!(job.status, JobStatus::Aborted);
    assert!(h.agent.stop_calls().is_empty(), "abort skips the agent");
    assert_eq!(h.gcp.terminate_calls(), vec![data.instance_id.clone()]);
}

#[tokio::test]
async fn failed_graceful_stop_falls_back_to_instance_termination() {
    let h = harness();
    h.gcp.set_offers(vec![offer(
        BackendType::Gcp,
        "n1-standard-4",
        "us-central1",
        false,
        0.20,
    )]);
    h.runs
        .submit(PROJECT, task_run_spec("stuck-1", 2, 8192))
        .await
        .unwrap();
    let job = h.drive_to_running("stuck-1").await;
    let data = job.provisioning_data.clone().unwrap();
    h.agent.fail_stops(&data.instance_id);

    h.runs
        .stop(PROJECT, &["stuck-1".to_string()], false)
        .await
        .unwrap();
    h.scheduler.process_terminating_jobs().await.unwrap();

    let job = h.job("stuck-1").await;
    assert_eq!(job.status, JobStatus::Terminated);
    assert_eq!(h.gcp.terminate_calls(), vec![data.instance_id]);
}

// ============================================================================
// Scenario 6: concurrent claim race
// ============================================================================

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let h = harness();
    let pool = h.store.ensure_pool(PROJECT, "default").await.unwrap();
    let instance = ready_instance(PROJECT, pool.id, "contested", 0.50, 4, 16384);
    h.store.create_instance(&instance).await.unwrap();

    let store_a = h.store.clone();
    let store_b = h.store.clone();
    let id = instance.id;
    let (a, b) = tokio::join!(
        tokio::spawn(async move { store_a.claim_instance(id, Uuid::new_v4()).await.unwrap() }),
        tokio::spawn(async move { store_b.claim_instance(id, Uuid::new_v4()).await.unwrap() }),
    );
    let wins = [a.unwrap(), b.unwrap()].iter().filter(|w| **w).count();
    assert_eq!(wins, 1, "CAS admits exactly one claimer");
}

#[tokio::test]
async fn claim_loser_falls_through_to_the_provisioner() {
    let h = harness();
    let pool = h.store.ensure_pool(PROJECT, "default").await.unwrap();
    let instance = ready_instance(PROJECT, pool.id, "single", 0.50, 4, 16384);
    h.store.create_instance(&instance).await.unwrap();
    h.gcp.set_offers(vec![offer(
        BackendType::Gcp,
        "n1-standard-4",
        "us-central1",
        false,
        0.20,
    )]);

    h.runs
        .submit(PROJECT, task_run_spec("race-a", 2, 8192))
        .await
        .unwrap();
    h.runs
        .submit(PROJECT, task_run_spec("race-b", 2, 8192))
        .await
        .unwrap();

    // Two ticks schedule both jobs; only one can win the pool instance.
    h.scheduler.process_submitted_jobs().await.unwrap();
    h.scheduler.process_submitted_jobs().await.unwrap();

    let job_a = h.job("race-a").await;
    let job_b = h.job("race-b").await;
    assert_eq!(job_a.status, JobStatus::Provisioning);
    assert_eq!(job_b.status, JobStatus::Provisioning);

    let reused = [&job_a, &job_b]
        .iter()
        .filter(|job| {
            job.provisioning_data.as_ref().unwrap().instance_id
                == instance.provisioning_data.instance_id
        })
        .count();
    assert_eq!(reused, 1, "exactly one job reuses the pool instance");
    assert_eq!(h.run_job_calls(), vec![BackendType::Gcp], "loser provisions");
    h.assert_single_ownership();
}

// ============================================================================
// Boundary behaviors
// ============================================================================

#[tokio::test]
async fn creation_policy_reuse_fails_fast_without_provisioning() {
    let h = harness();
    h.gcp.set_offers(vec![offer(
        BackendType::Gcp,
        "n1-standard-4",
        "us-central1",
        false,
        0.20,
    )]);
    let mut spec = task_run_spec("reuse-only", 2, 8192);
    spec.profile.creation_policy = CreationPolicy::Reuse;
    h.runs.submit(PROJECT, spec).await.unwrap();

    h.scheduler.process_submitted_jobs().await.unwrap();
    let job = h.job("reuse-only").await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_code,
        Some(JobErrorCode::FailedToStartDueToNoCapacity)
    );
    assert_eq!(h.offer_query_calls(), 0, "the provisioner was never consulted");
    assert!(h.run_job_calls().is_empty());
}

#[tokio::test]
async fn retry_true_parks_the_job_pending_within_the_window() {
    let h = harness();
    // No offers anywhere.
    let mut spec = task_run_spec("patient-1", 2, 8192);
    spec.profile.retry = RetryPolicy::Flag(true);
    h.runs.submit(PROJECT, spec).await.unwrap();

    h.scheduler.process_submitted_jobs().await.unwrap();
    let job = h.job("patient-1").await;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.error_code, None);
}

#[tokio::test]
async fn unreachable_agent_beyond_grace_terminates_the_job() {
    let h = harness();
    h.gcp.set_offers(vec![offer(
        BackendType::Gcp,
        "n1-standard-4",
        "us-central1",
        false,
        0.20,
    )]);
    h.runs
        .submit(PROJECT, task_run_spec("lost-1", 2, 8192))
        .await
        .unwrap();
    let mut job = h.drive_to_running("lost-1").await;
    let data = job.provisioning_data.clone().unwrap();

    // Backend still thinks the VM runs; only the agent is gone.
    h.agent.set_unreachable(&data.instance_id, true);

    // Within the grace window nothing changes.
    h.scheduler.process_running_jobs().await.unwrap();
    assert_eq!(h.job("lost-1").await.status, JobStatus::Running);

    // Backdate the last successful contact beyond the 10 min default.
    job = h.job("lost-1").await;
    job.last_contact_at = Some(Utc::now() - chrono::Duration::minutes(11));
    h.store.update_job(&job).await.unwrap();

    h.scheduler.process_running_jobs().await.unwrap();
    let job = h.job("lost-1").await;
    assert_eq!(job.status, JobStatus::Terminating);
    assert_eq!(job.error_code, Some(JobErrorCode::InstanceTerminated));

    // The terminator then destroys rather than parking the instance.
    h.scheduler.process_terminating_jobs().await.unwrap();
    let job = h.job("lost-1").await;
    assert_eq!(job.status, JobStatus::Terminated);
    assert_eq!(job.error_code, Some(JobErrorCode::InstanceTerminated));
    assert_eq!(h.gcp.terminate_calls(), vec![data.instance_id]);
}

#[tokio::test]
async fn container_failure_releases_the_instance_for_reuse() {
    let h = harness();
    h.gcp.set_offers(vec![offer(
        BackendType::Gcp,
        "n1-standard-4",
        "us-central1",
        false,
        0.20,
    )]);
    h.runs
        .submit(PROJECT, task_run_spec("crash-1", 2, 8192))
        .await
        .unwrap();
    let job = h.drive_to_running("crash-1").await;
    let data = job.provisioning_data.clone().unwrap();

    h.agent
        .set_status(&data.instance_id, AgentJobStatus::Exited(137));
    h.scheduler.process_running_jobs().await.unwrap();

    let job = h.job("crash-1").await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_code, Some(JobErrorCode::ContainerExitedWithError));
    let instance = h
        .store
        .all_instances()
        .into_iter()
        .find(|instance| instance.provisioning_data.instance_id == data.instance_id)
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Idle, "host is still good");
    h.assert_single_ownership();
}

// ============================================================================
// Multi-job runs
// ============================================================================

#[tokio::test]
async fn later_jobs_wait_for_earlier_siblings() {
    let h = harness();
    h.gcp.set_offers(vec![offer(
        BackendType::Gcp,
        "n1-standard-4",
        "us-central1",
        false,
        0.20,
    )]);
    let (run, _) = insert_run(
        &h.store,
        "multi-1",
        Profile::default(),
        Utc::now(),
        &[JobStatus::Submitted, JobStatus::Submitted],
    )
    .await;

    // First tick: whichever job is claimed, only job 0 may proceed.
    h.scheduler.process_submitted_jobs().await.unwrap();
    let jobs = h.store.list_run_jobs(run.id).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Provisioning);
    assert_eq!(jobs[1].status, JobStatus::Submitted, "job 1 waits");

    // Second tick: job 0 is past SUBMITTED, job 1 unblocks.
    h.scheduler.process_submitted_jobs().await.unwrap();
    let jobs = h.store.list_run_jobs(run.id).await.unwrap();
    assert_eq!(jobs[1].status, JobStatus::Provisioning);
}

// ============================================================================
// Idempotence and resubmission
// ============================================================================

#[tokio::test]
async fn terminate_instance_is_idempotent() {
    let h = harness();
    let pool = h.store.ensure_pool(PROJECT, "default").await.unwrap();
    let mut instance = ready_instance(PROJECT, pool.id, "gone", 0.50, 4, 16384);
    instance.status = InstanceStatus::Idle;
    instance.idle_since = Some(Utc::now() - chrono::Duration::days(4));
    h.store.create_instance(&instance).await.unwrap();

    h.scheduler.process_idle_instances().await.unwrap();
    let after_first = h.store.instance_snapshot(instance.id).unwrap();
    assert_eq!(after_first.status, InstanceStatus::Terminated);

    // A second terminate of the same VM changes nothing.
    use skypool::Compute;
    h.aws
        .terminate_instance(&instance.provisioning_data)
        .await
        .unwrap();
    let after_second = h.store.instance_snapshot(instance.id).unwrap();
    assert_eq!(after_second.status, after_first.status);
    assert_eq!(h.aws.terminate_calls().len(), 2);
}

#[tokio::test]
async fn resubmitting_a_used_run_name_soft_deletes_the_old_run() {
    let h = harness();
    // No offers: the first submission fails within a tick.
    h.runs
        .submit(PROJECT, task_run_spec("rerun-1", 2, 8192))
        .await
        .unwrap();
    h.scheduler.process_submitted_jobs().await.unwrap();
    let old = h.store.get_run(PROJECT, "rerun-1").await.unwrap().unwrap();
    assert_eq!(h.job("rerun-1").await.status, JobStatus::Failed);

    h.runs
        .submit(PROJECT, task_run_spec("rerun-1", 2, 8192))
        .await
        .unwrap();
    let new = h.store.get_run(PROJECT, "rerun-1").await.unwrap().unwrap();
    assert_ne!(new.id, old.id);
    let job = h.job("rerun-1").await;
    assert_eq!(job.submission_num, 0);
    assert_eq!(job.status, JobStatus::Submitted);

    let old_record = h.store.get_run_by_id(old.id).await.unwrap().unwrap();
    assert!(old_record.deleted, "old run is tombstoned, not removed");
}

#[tokio::test]
async fn resubmitting_an_active_run_name_is_rejected() {
    let h = harness();
    h.gcp.set_offers(vec![offer(
        BackendType::Gcp,
        "n1-standard-4",
        "us-central1",
        false,
        0.20,
    )]);
    h.runs
        .submit(PROJECT, task_run_spec("busy-1", 2, 8192))
        .await
        .unwrap();
    h.scheduler.process_submitted_jobs().await.unwrap();

    let err = h
        .runs
        .submit(PROJECT, task_run_spec("busy-1", 2, 8192))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<skypool::ClientError>(),
        Some(skypool::ClientError::RunsActive(_))
    ));
}

// ============================================================================
// Gateways
// ============================================================================

#[tokio::test]
async fn service_runs_register_and_unregister_with_the_gateway() {
    let h = harness();
    h.store.add_gateway(GatewayRecord {
        id: Uuid::new_v4(),
        project: PROJECT.to_string(),
        name: "edge".to_string(),
        backend: BackendType::Aws,
        region: "us-east-1".to_string(),
        wildcard_domain: Some("apps.example.com".to_string()),
        configuration: GatewayConfiguration::default(),
        created_at: Utc::now(),
    });
    h.gcp.set_offers(vec![offer(
        BackendType::Gcp,
        "n1-standard-4",
        "us-central1",
        false,
        0.20,
    )]);

    let run = h.runs.submit(PROJECT, service_run_spec("web-1")).await.unwrap();
    assert_eq!(
        run.jobs[0].spec.gateway.as_ref().unwrap().hostname,
        "web-1.apps.example.com"
    );

    // Not running yet: no registration.
    h.scheduler.process_gateways().await.unwrap();
    assert!(h.gateway.events().is_empty());

    h.drive_to_running("web-1").await;
    h.scheduler.process_gateways().await.unwrap();
    assert_eq!(h.gateway.events(), vec!["register acme/web-1".to_string()]);

    let run = h.runs.get(PROJECT, "web-1").await.unwrap().unwrap();
    assert!(run.record.gateway_registered);
    assert_eq!(run.service.as_ref().unwrap().url, "https://web-1.apps.example.com");

    h.runs
        .stop(PROJECT, &["web-1".to_string()], false)
        .await
        .unwrap();
    h.scheduler.process_terminating_jobs().await.unwrap();
    h.scheduler.process_gateways().await.unwrap();
    assert_eq!(
        h.gateway.events(),
        vec![
            "register acme/web-1".to_string(),
            "unregister acme/web-1".to_string()
        ]
    );
}

// ============================================================================
// Fleets and pools
// ============================================================================

#[tokio::test]
async fn fleet_populates_the_pool_with_ready_instances() {
    use skypool::fleet::FleetService;
    use skypool::models::fleet::{FleetConfiguration, FleetSpec, FleetStatus, NodeRange};
    use skypool::SchedulerConfig;

    let h = harness();
    h.gcp.set_offers(vec![offer(
        BackendType::Gcp,
        "n1-standard-8",
        "us-central1",
        false,
        0.40,
    )]);

    let backends = Arc::new(BackendRegistry::new());
    backends.register(h.gcp.clone());
    backends.register(h.aws.clone());
    let projects =
        StaticProjects::with_project(PROJECT, vec![BackendType::Aws, BackendType::Gcp]);
    let fleets = FleetService::new(
        h.store.clone(),
        backends,
        projects,
        SchedulerConfig::default(),
    );

    let spec = FleetSpec {
        configuration: FleetConfiguration {
            name: "warm".to_string(),
            nodes: NodeRange { min: 2, max: None },
            placement: None,
            resources: Requirements {
                cpus: Some(4),
                ..Default::default()
            },
            backends: None,
            regions: None,
            instance_types: None,
            spot_policy: None,
            retry: None,
            max_price: None,
            termination_policy: None,
            termination_idle_time: None,
        },
        profile: Profile::default(),
    };
    let fleet = fleets.apply(PROJECT, spec).await.unwrap();
    assert_eq!(fleet.status, FleetStatus::Active);

    let instances = h.store.all_instances();
    assert_eq!(instances.len(), 2);
    assert!(instances
        .iter()
        .all(|instance| instance.status == InstanceStatus::Creating));

    // The instance loop brings each node up in two hops.
    for _ in 0..4 {
        h.scheduler.process_idle_instances().await.unwrap();
    }
    let instances = h.store.all_instances();
    assert!(
        instances
            .iter()
            .all(|instance| instance.status == InstanceStatus::Ready),
        "statuses: {:?}",
        instances
            .iter()
            .map(|instance| instance.status)
            .collect::<Vec<_>>()
    );

    // Fleet capacity is now reusable by a plain submission.
    h.runs
        .submit(PROJECT, task_run_spec("borrower", 2, 8192))
        .await
        .unwrap();
    // The run goes to the default pool; point it at the fleet pool instead.
    let mut spec = task_run_spec("borrower-2", 2, 8192);
    spec.profile.pool_name = Some("warm".to_string());
    h.runs.submit(PROJECT, spec).await.unwrap();
    h.scheduler.process_submitted_jobs().await.unwrap();
    h.scheduler.process_submitted_jobs().await.unwrap();

    let job = h.job("borrower-2").await;
    assert_eq!(job.status, JobStatus::Provisioning);
    assert!(job
        .provisioning_data
        .unwrap()
        .instance_id
        .starts_with("gcp-i-"));
    h.assert_single_ownership();
}

#[tokio::test]
async fn deleting_an_occupied_pool_is_rejected() {
    use skypool::pool::delete_pool;

    let h = harness();
    let pool = h.store.ensure_pool(PROJECT, "gpu").await.unwrap();
    let instance = ready_instance(PROJECT, pool.id, "lodger", 0.50, 4, 16384);
    h.store.create_instance(&instance).await.unwrap();

    let err = delete_pool(h.store.as_ref(), PROJECT, "gpu")
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<skypool::ClientError>(),
        Some(skypool::ClientError::PoolInUse(_))
    ));

    let mut gone = instance;
    gone.status = InstanceStatus::Terminated;
    h.store.update_instance(&gone).await.unwrap();
    delete_pool(h.store.as_ref(), PROJECT, "gpu").await.unwrap();
    assert!(h.store.get_pool(PROJECT, "gpu").await.unwrap().is_none());
}
