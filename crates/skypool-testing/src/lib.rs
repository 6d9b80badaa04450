//! Testing utilities for the skypool control plane.
//!
//! Everything here is deterministic and in-process: an in-memory
//! [`StateStore`] with the same CAS semantics as the PostgreSQL store,
//! scriptable compute backends and agents, and fixture builders for the
//! common specs. Scenario tests drive the real scheduler against these
//! fakes, one tick at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use uuid::Uuid;

use skypool::models::fleet::FleetRecord;
use skypool::models::gateway::GatewayRecord;
use skypool::models::pool::PoolRecord;
use skypool::models::run::{RunConfiguration, TaskConfig};
use skypool::{
    Agent, AgentJobStatus, Availability, BackendError, BackendType, Compute, GatewayService,
    HeadStore, InstanceConfiguration, InstanceRecord, InstanceStatus, JobProvisioningData,
    JobRecord, JobSpec, JobStatus, LaunchedInstanceInfo, Offer, ProjectConfig,
    ProjectConfigStore, ReleaseOutcome, Requirements, Resources, RunRecord, RunSpec, SshKeys,
    StateStore, TerminationPolicy,
};
use skypool::models::instance::InstanceType;
use skypool::models::job::GatewayHint;
use skypool::models::profile::Profile;
use skypool::RequestStatus;

// ============================================================================
// In-memory state store
// ============================================================================

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, RunRecord>,
    jobs: HashMap<Uuid, JobRecord>,
    instances: HashMap<Uuid, InstanceRecord>,
    pools: HashMap<Uuid, PoolRecord>,
    fleets: HashMap<Uuid, FleetRecord>,
    gateways: Vec<GatewayRecord>,
}

/// In-memory [`StateStore`]. One mutex spans each call, which gives the
/// same atomicity the PostgreSQL store gets from conditional UPDATEs.
#[derive(Default)]
pub struct InMemoryStateStore {
    inner: Mutex<Inner>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a gateway row (tests only; gateways are otherwise owned by the
    /// API collaborator).
    pub fn add_gateway(&self, gateway: GatewayRecord) {
        self.lock().gateways.push(gateway);
    }

    /// Direct snapshot of an instance, bypassing the trait.
    pub fn instance_snapshot(&self, instance_id: Uuid) -> Option<InstanceRecord> {
        self.lock().instances.get(&instance_id).cloned()
    }

    /// All instances, for invariant assertions.
    pub fn all_instances(&self) -> Vec<InstanceRecord> {
        self.lock().instances.values().cloned().collect()
    }

    /// All jobs, for invariant assertions.
    pub fn all_jobs(&self) -> Vec<JobRecord> {
        self.lock().jobs.values().cloned().collect()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_run(&self, run: &RunRecord) -> Result<()> {
        self.lock().runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, project: &str, run_name: &str) -> Result<Option<RunRecord>> {
        Ok(self
            .lock()
            .runs
            .values()
            .find(|run| run.project == project && run.run_name == run_name && !run.deleted)
            .cloned())
    }

    async fn get_run_by_id(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        Ok(self.lock().runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, project: &str) -> Result<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = self
            .lock()
            .runs
            .values()
            .filter(|run| run.project == project && !run.deleted)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(runs)
    }

    async fn soft_delete_runs(&self, project: &str, run_names: &[String]) -> Result<()> {
        let mut inner = self.lock();
        for run in inner.runs.values_mut() {
            if run.project == project && run_names.contains(&run.run_name) {
                run.deleted = true;
            }
        }
        Ok(())
    }

    async fn list_service_runs(&self, registered: bool) -> Result<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = self
            .lock()
            .runs
            .values()
            .filter(|run| {
                !run.deleted
                    && run.gateway_registered == registered
                    && run.spec.configuration.is_service()
            })
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(runs)
    }

    async fn set_gateway_registered(&self, run_id: Uuid, registered: bool) -> Result<()> {
        if let Some(run) = self.lock().runs.get_mut(&run_id) {
            run.gateway_registered = registered;
        }
        Ok(())
    }

    async fn create_job(&self, job: &JobRecord) -> Result<()> {
        self.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn list_run_jobs(&self, run_id: Uuid) -> Result<Vec<JobRecord>> {
        let mut jobs: Vec<JobRecord> = self
            .lock()
            .jobs
            .values()
            .filter(|job| job.run_id == run_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.job_num);
        Ok(jobs)
    }

    async fn next_job_in_statuses(
        &self,
        statuses: &[JobStatus],
        exclude: &[Uuid],
    ) -> Result<Option<JobRecord>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|job| statuses.contains(&job.status) && !exclude.contains(&job.id))
            .min_by_key(|job| (job.submitted_at, job.id))
            .cloned())
    }

    async fn update_job(&self, job: &JobRecord) -> Result<()> {
        self.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn create_instance(&self, instance: &InstanceRecord) -> Result<()> {
        self.lock().instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, instance_id: Uuid) -> Result<Option<InstanceRecord>> {
        Ok(self.lock().instances.get(&instance_id).cloned())
    }

    async fn get_job_instance(&self, job_id: Uuid) -> Result<Option<InstanceRecord>> {
        Ok(self
            .lock()
            .instances
            .values()
            .find(|instance| instance.job_id == Some(job_id))
            .cloned())
    }

    async fn list_pool_instances(&self, pool_id: Uuid) -> Result<Vec<InstanceRecord>> {
        let mut instances: Vec<InstanceRecord> = self
            .lock()
            .instances
            .values()
            .filter(|instance| {
                instance.pool_id == pool_id && instance.status != InstanceStatus::Terminated
            })
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }

    async fn next_instance_in_statuses(
        &self,
        statuses: &[InstanceStatus],
        exclude: &[Uuid],
    ) -> Result<Option<InstanceRecord>> {
        Ok(self
            .lock()
            .instances
            .values()
            .filter(|instance| {
                statuses.contains(&instance.status) && !exclude.contains(&instance.id)
            })
            .min_by_key(|instance| (instance.created_at, instance.id))
            .cloned())
    }

    async fn update_instance(&self, instance: &InstanceRecord) -> Result<()> {
        self.lock().instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn claim_instance(&self, instance_id: Uuid, job_id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        let Some(instance) = inner.instances.get_mut(&instance_id) else {
            return Ok(false);
        };
        if instance.status != InstanceStatus::Ready {
            return Ok(false);
        }
        instance.status = InstanceStatus::Busy;
        instance.job_id = Some(job_id);
        instance.idle_since = None;
        Ok(true)
    }

    async fn release_instance(
        &self,
        instance_id: Uuid,
        outcome: ReleaseOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let Some(instance) = inner.instances.get_mut(&instance_id) else {
            return Ok(false);
        };
        if instance.status != InstanceStatus::Busy {
            return Ok(false);
        }
        instance.job_id = None;
        match outcome {
            ReleaseOutcome::Reuse => {
                instance.status = InstanceStatus::Idle;
                instance.idle_since = Some(now);
            }
            ReleaseOutcome::Destroy => {
                instance.status = InstanceStatus::Terminating;
                instance.idle_since = None;
            }
        }
        Ok(true)
    }

    async fn transition_instance(
        &self,
        instance_id: Uuid,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool> {
        anyhow::ensure!(
            from.can_transition_to(to),
            "illegal instance transition {from} -> {to}"
        );
        let mut inner = self.lock();
        let Some(instance) = inner.instances.get_mut(&instance_id) else {
            return Ok(false);
        };
        if instance.status != from {
            return Ok(false);
        }
        instance.status = to;
        Ok(true)
    }

    async fn ensure_pool(&self, project: &str, name: &str) -> Result<PoolRecord> {
        let mut inner = self.lock();
        if let Some(pool) = inner
            .pools
            .values()
            .find(|pool| pool.project == project && pool.name == name && !pool.deleted)
        {
            return Ok(pool.clone());
        }
        let pool = PoolRecord::new(project, name, Utc::now());
        inner.pools.insert(pool.id, pool.clone());
        Ok(pool)
    }

    async fn get_pool(&self, project: &str, name: &str) -> Result<Option<PoolRecord>> {
        Ok(self
            .lock()
            .pools
            .values()
            .find(|pool| pool.project == project && pool.name == name && !pool.deleted)
            .cloned())
    }

    async fn list_pools(&self, project: &str) -> Result<Vec<PoolRecord>> {
        let mut pools: Vec<PoolRecord> = self
            .lock()
            .pools
            .values()
            .filter(|pool| pool.project == project && !pool.deleted)
            .cloned()
            .collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pools)
    }

    async fn soft_delete_pool(&self, pool_id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        let occupied = inner
            .instances
            .values()
            .any(|instance| {
                instance.pool_id == pool_id && instance.status != InstanceStatus::Terminated
            });
        if occupied {
            return Ok(false);
        }
        let Some(pool) = inner.pools.get_mut(&pool_id) else {
            return Ok(false);
        };
        if pool.deleted {
            return Ok(false);
        }
        pool.deleted = true;
        Ok(true)
    }

    async fn create_fleet(&self, fleet: &FleetRecord) -> Result<()> {
        self.lock().fleets.insert(fleet.id, fleet.clone());
        Ok(())
    }

    async fn get_fleet(&self, project: &str, name: &str) -> Result<Option<FleetRecord>> {
        Ok(self
            .lock()
            .fleets
            .values()
            .find(|fleet| fleet.project == project && fleet.name == name)
            .cloned())
    }

    async fn update_fleet(&self, fleet: &FleetRecord) -> Result<()> {
        self.lock().fleets.insert(fleet.id, fleet.clone());
        Ok(())
    }

    async fn list_gateways(&self, project: &str) -> Result<Vec<GatewayRecord>> {
        Ok(self
            .lock()
            .gateways
            .iter()
            .filter(|gateway| gateway.project == project)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Fake compute backend
// ============================================================================

/// Shared, ordered log of backend calls across every fake in a test, so
/// call order between backends is assertable.
pub type CallLog = Arc<Mutex<Vec<(BackendType, String)>>>;

pub fn new_call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// A scriptable [`Compute`] backend.
///
/// Offers are whatever was last set; launches succeed unless failures were
/// queued with [`FakeCompute::push_launch_failure`] (consumed in order).
pub struct FakeCompute {
    backend: BackendType,
    offers: Mutex<Vec<Offer>>,
    launch_failures: Mutex<VecDeque<BackendError>>,
    request_heads: DashMap<String, RequestStatus>,
    terminate_calls: Mutex<Vec<String>>,
    calls: CallLog,
    counter: AtomicU64,
}

impl FakeCompute {
    pub fn new(backend: BackendType) -> Self {
        Self::with_call_log(backend, new_call_log())
    }

    pub fn with_call_log(backend: BackendType, calls: CallLog) -> Self {
        Self {
            backend,
            offers: Mutex::new(Vec::new()),
            launch_failures: Mutex::new(VecDeque::new()),
            request_heads: DashMap::new(),
            terminate_calls: Mutex::new(Vec::new()),
            calls,
            counter: AtomicU64::new(0),
        }
    }

    pub fn set_offers(&self, offers: Vec<Offer>) {
        *lock(&self.offers) = offers;
    }

    /// Queue a failure for the next launch attempt.
    pub fn push_launch_failure(&self, error: BackendError) {
        lock(&self.launch_failures).push_back(error);
    }

    /// Override the request head reported for an instance id.
    pub fn set_request_head(&self, instance_id: &str, status: RequestStatus) {
        self.request_heads.insert(instance_id.to_string(), status);
    }

    /// Instance ids passed to `terminate_instance`, in call order.
    pub fn terminate_calls(&self) -> Vec<String> {
        lock(&self.terminate_calls).clone()
    }

    /// The shared call log.
    pub fn calls(&self) -> Vec<(BackendType, String)> {
        lock(&self.calls).clone()
    }

    fn record(&self, event: &str) {
        lock(&self.calls).push((self.backend, event.to_string()));
    }

    fn launch(&self, region: &str) -> Result<LaunchedInstanceInfo, BackendError> {
        if let Some(error) = lock(&self.launch_failures).pop_front() {
            return Err(error);
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let instance_id = format!("{}-i-{n}", self.backend);
        self.request_heads
            .insert(instance_id.clone(), RequestStatus::Running);
        Ok(LaunchedInstanceInfo {
            instance_id,
            hostname: format!("10.0.{n}.1"),
            region: region.to_string(),
            username: "ubuntu".to_string(),
            ssh_port: 22,
            dockerized: true,
            backend_data: None,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Compute for FakeCompute {
    fn backend_type(&self) -> BackendType {
        self.backend
    }

    async fn get_offers(&self, requirements: &Requirements) -> Result<Vec<Offer>, BackendError> {
        self.record("get_offers");
        Ok(lock(&self.offers)
            .iter()
            .filter(|offer| offer.instance_type.resources.satisfies(requirements))
            .cloned()
            .collect())
    }

    async fn run_job(
        &self,
        _run: &RunSpec,
        _job: &JobSpec,
        offer: &Offer,
        _ssh_keys: &SshKeys,
    ) -> Result<LaunchedInstanceInfo, BackendError> {
        self.record("run_job");
        self.launch(&offer.region)
    }

    async fn create_instance(
        &self,
        _project: &str,
        offer: &Offer,
        _config: &InstanceConfiguration,
    ) -> Result<LaunchedInstanceInfo, BackendError> {
        self.record("create_instance");
        self.launch(&offer.region)
    }

    async fn terminate_instance(&self, data: &JobProvisioningData) -> Result<(), BackendError> {
        self.record("terminate_instance");
        lock(&self.terminate_calls).push(data.instance_id.clone());
        self.request_heads
            .insert(data.instance_id.clone(), RequestStatus::Terminated);
        Ok(())
    }

    async fn get_request_head(
        &self,
        data: &JobProvisioningData,
    ) -> Result<RequestStatus, BackendError> {
        self.record("get_request_head");
        Ok(self
            .request_heads
            .get(&data.instance_id)
            .map(|entry| *entry.value())
            .unwrap_or(RequestStatus::Provisioning))
    }
}

// ============================================================================
// Fake agent
// ============================================================================

/// A scriptable on-host agent, keyed by backend instance id.
#[derive(Default)]
pub struct FakeAgent {
    statuses: DashMap<String, AgentJobStatus>,
    unreachable: DashSet<String>,
    stop_failures: DashSet<String>,
    stop_calls: Mutex<Vec<String>>,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, instance_id: &str, status: AgentJobStatus) {
        self.statuses.insert(instance_id.to_string(), status);
    }

    pub fn set_unreachable(&self, instance_id: &str, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(instance_id.to_string());
        } else {
            self.unreachable.remove(instance_id);
        }
    }

    /// Make graceful stops fail for an instance without making it
    /// unreachable.
    pub fn fail_stops(&self, instance_id: &str) {
        self.stop_failures.insert(instance_id.to_string());
    }

    pub fn stop_calls(&self) -> Vec<String> {
        lock(&self.stop_calls).clone()
    }

    fn check_reachable(&self, instance_id: &str) -> Result<()> {
        if self.unreachable.contains(instance_id) {
            anyhow::bail!("host unreachable: {instance_id}");
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for FakeAgent {
    async fn healthcheck(&self, data: &JobProvisioningData) -> Result<()> {
        self.check_reachable(&data.instance_id)
    }

    async fn job_status(&self, data: &JobProvisioningData) -> Result<AgentJobStatus> {
        self.check_reachable(&data.instance_id)?;
        Ok(self
            .statuses
            .get(&data.instance_id)
            .map(|entry| *entry.value())
            .unwrap_or(AgentJobStatus::Pulling))
    }

    async fn stop_job(&self, data: &JobProvisioningData) -> Result<()> {
        lock(&self.stop_calls).push(data.instance_id.clone());
        self.check_reachable(&data.instance_id)?;
        if self.stop_failures.contains(&data.instance_id) {
            anyhow::bail!("agent refused to stop {}", data.instance_id);
        }
        Ok(())
    }
}

// ============================================================================
// Other collaborators
// ============================================================================

/// Fixed project configurations.
#[derive(Default)]
pub struct StaticProjects {
    projects: DashMap<String, ProjectConfig>,
}

impl StaticProjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, config: ProjectConfig) {
        self.projects.insert(config.name.clone(), config);
    }

    /// A project with the given backends and throwaway SSH keys.
    pub fn with_project(name: &str, backends: Vec<BackendType>) -> Arc<Self> {
        let projects = Self::new();
        projects.insert(ProjectConfig {
            name: name.to_string(),
            backends,
            ssh_keys: SshKeys {
                public: "ssh-ed25519 AAAA-test".to_string(),
                private: "-----BEGIN TEST KEY-----".to_string(),
            },
        });
        Arc::new(projects)
    }
}

#[async_trait]
impl ProjectConfigStore for StaticProjects {
    async fn get_project(&self, project: &str) -> Result<Option<ProjectConfig>> {
        Ok(self.projects.get(project).map(|entry| entry.value().clone()))
    }
}

/// Head store on a concurrent map.
#[derive(Default)]
pub struct InMemoryHeads {
    objects: DashMap<String, serde_json::Value>,
}

impl InMemoryHeads {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HeadStore for InMemoryHeads {
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.objects.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.objects.get(key).map(|entry| entry.value().clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.remove(key);
        Ok(())
    }
}

/// Gateway service that records registrations instead of proxying.
#[derive(Default)]
pub struct RecordingGateway {
    events: Mutex<Vec<String>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl GatewayService for RecordingGateway {
    async fn register_service(
        &self,
        project: &str,
        run_name: &str,
        _jobs: &[JobRecord],
    ) -> Result<()> {
        lock(&self.events).push(format!("register {project}/{run_name}"));
        Ok(())
    }

    async fn unregister_service(&self, project: &str, run_name: &str) -> Result<()> {
        lock(&self.events).push(format!("unregister {project}/{run_name}"));
        Ok(())
    }

    async fn set_config(
        &self,
        project: &str,
        _settings: &skypool::models::gateway::AcmeSettings,
    ) -> Result<()> {
        lock(&self.events).push(format!("set_config {project}"));
        Ok(())
    }
}

// ============================================================================
// Fixture builders
// ============================================================================

/// A task run spec asking for the given CPU and memory.
pub fn task_run_spec(run_name: &str, cpus: u32, memory_mib: u64) -> RunSpec {
    RunSpec {
        run_name: Some(run_name.to_string()),
        configuration: RunConfiguration::Task(TaskConfig {
            commands: vec!["python train.py".to_string()],
            image: None,
            env: Default::default(),
            ports: vec![],
            resources: Requirements {
                cpus: Some(cpus),
                memory_mib: Some(memory_mib),
                ..Default::default()
            },
        }),
        profile: Profile::default(),
        repo: None,
    }
}

/// A concrete offer with plain CPU/memory resources.
pub fn offer(
    backend: BackendType,
    instance_type: &str,
    region: &str,
    spot: bool,
    price: f64,
) -> Offer {
    Offer {
        backend,
        instance_type: InstanceType {
            name: instance_type.to_string(),
            resources: Resources {
                cpus: 8,
                memory_mib: 32768,
                ..Default::default()
            },
        },
        region: region.to_string(),
        spot,
        price,
        availability: Availability::Available,
    }
}

/// A `READY` pool instance priced as given.
pub fn ready_instance(
    project: &str,
    pool_id: Uuid,
    name: &str,
    price: f64,
    cpus: u32,
    memory_mib: u64,
) -> InstanceRecord {
    let resources = Resources {
        cpus,
        memory_mib,
        ..Default::default()
    };
    let instance_type = InstanceType {
        name: format!("{name}-type"),
        resources,
    };
    let backend = BackendType::Aws;
    let region = "us-east-1".to_string();
    InstanceRecord {
        id: Uuid::new_v4(),
        project: project.to_string(),
        pool_id,
        name: name.to_string(),
        status: InstanceStatus::Ready,
        offer: Offer {
            backend,
            instance_type: instance_type.clone(),
            region: region.clone(),
            spot: false,
            price,
            availability: Availability::Available,
        },
        provisioning_data: JobProvisioningData {
            backend,
            instance_type,
            instance_id: format!("i-{name}"),
            hostname: "10.1.0.1".to_string(),
            region: region.clone(),
            price,
            username: "ubuntu".to_string(),
            ssh_port: 22,
            dockerized: true,
            backend_data: None,
            pool_id: Some(pool_id),
        },
        termination_policy: TerminationPolicy::DestroyAfterIdle,
        termination_idle_time: Duration::from_secs(3 * 24 * 3600),
        backend,
        region,
        price,
        job_id: None,
        idle_since: None,
        created_at: Utc::now(),
    }
}

/// A gateway hint as the API collaborator would attach to service jobs.
pub fn gateway_hint(run_name: &str, domain: &str) -> GatewayHint {
    GatewayHint {
        hostname: format!("{run_name}.{domain}"),
        public_port: 443,
        secure: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_is_a_cas() {
        let store = InMemoryStateStore::new();
        let pool = store.ensure_pool("acme", "default").await.unwrap();
        let instance = ready_instance("acme", pool.id, "a", 0.5, 4, 16384);
        store.create_instance(&instance).await.unwrap();

        let first = store
            .claim_instance(instance.id, Uuid::new_v4())
            .await
            .unwrap();
        let second = store
            .claim_instance(instance.id, Uuid::new_v4())
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn release_requires_busy() {
        let store = InMemoryStateStore::new();
        let pool = store.ensure_pool("acme", "default").await.unwrap();
        let instance = ready_instance("acme", pool.id, "a", 0.5, 4, 16384);
        store.create_instance(&instance).await.unwrap();

        let released = store
            .release_instance(instance.id, ReleaseOutcome::Reuse, Utc::now())
            .await
            .unwrap();
        assert!(!released);

        store
            .claim_instance(instance.id, Uuid::new_v4())
            .await
            .unwrap();
        let released = store
            .release_instance(instance.id, ReleaseOutcome::Reuse, Utc::now())
            .await
            .unwrap();
        assert!(released);
        let snapshot = store.instance_snapshot(instance.id).unwrap();
        assert_eq!(snapshot.status, InstanceStatus::Idle);
        assert!(snapshot.idle_since.is_some());
        assert!(snapshot.job_id.is_none());
    }

    #[tokio::test]
    async fn ensure_pool_is_idempotent() {
        let store = InMemoryStateStore::new();
        let first = store.ensure_pool("acme", "default").await.unwrap();
        let second = store.ensure_pool("acme", "default").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn pool_delete_rejected_while_occupied() {
        let store = InMemoryStateStore::new();
        let pool = store.ensure_pool("acme", "default").await.unwrap();
        let instance = ready_instance("acme", pool.id, "a", 0.5, 4, 16384);
        store.create_instance(&instance).await.unwrap();

        assert!(!store.soft_delete_pool(pool.id).await.unwrap());

        let mut gone = instance;
        gone.status = InstanceStatus::Terminated;
        store.update_instance(&gone).await.unwrap();
        assert!(store.soft_delete_pool(pool.id).await.unwrap());
    }
}
