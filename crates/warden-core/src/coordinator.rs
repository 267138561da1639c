//! The coordinator: single writer to the workload registry, router for
//! control requests, recovery arbiter, and event fan-out point.
//!
//! Mutations are serialized behind one async mutex; reads run concurrently
//! against shared maps. Per-workload commands are forwarded to the owning
//! supervisor and awaited with a bounded timeout (extended by the grace
//! period for stops).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DaemonConfig;
use crate::error::ControlError;
use crate::events::{Bus, Event, EventKind};
use crate::models::{
    Phase, RestartPolicy, Schedule, ScheduleKind, Workload, WorkloadDetail, WorkloadSummary,
};
use crate::runner::RunnerFactory;
use crate::scheduler::{initial_next_fire, Registry, SchedulerHandle};
use crate::store::{LogFilter, Store, StoreGateway};
use crate::supervisor::{Command, Supervisor, SupervisorDeps, SupervisorHandle};
use crate::timer::TimerWheel;

/// Capacity of the event fan-out bus; slow subscribers lag past this.
const BUS_CAPACITY: usize = 1024;

/// Inputs for `create_workload`.
#[derive(Debug, Clone, Default)]
pub struct CreateWorkload {
    pub name: String,
    pub argv: Vec<String>,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub group: Option<String>,
    /// Defaults to the built-in `none` policy.
    pub policy: Option<String>,
    pub schedules: Vec<NewSchedule>,
}

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub kind: ScheduleKind,
    pub expression: String,
    pub enabled: bool,
}

/// Partial update for `update_workload`. `None` leaves a field untouched;
/// the nested options clear optional fields.
#[derive(Debug, Clone, Default)]
pub struct UpdateWorkload {
    pub name: Option<String>,
    pub argv: Option<Vec<String>>,
    pub cwd: Option<Option<String>>,
    pub env: Option<BTreeMap<String, String>>,
    pub group: Option<Option<String>>,
    pub policy: Option<String>,
}

/// Filter for `list_workloads`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub name_contains: Option<String>,
    pub group: Option<String>,
    pub phase: Option<Phase>,
}

/// Aggregated health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub phase_counts: BTreeMap<String, usize>,
    pub persistence_lag: bool,
    pub scheduler_drift_ms: u64,
}

/// Full validation of a schedule expression, including the requirement
/// that a one-shot instant lies in the future. Returns the computed next
/// fire.
fn validate_expression(
    kind: ScheduleKind,
    expression: &str,
    tz: Tz,
    now: chrono::DateTime<Utc>,
) -> Result<Option<chrono::DateTime<Utc>>, ControlError> {
    let next_fire = initial_next_fire(kind, expression, tz, now).map_err(|e| {
        ControlError::InvalidExpression {
            expression: expression.to_string(),
            reason: e,
        }
    })?;
    if kind == ScheduleKind::Once {
        if let Some(at) = next_fire {
            if at <= now {
                return Err(ControlError::InvalidExpression {
                    expression: expression.to_string(),
                    reason: "one-shot instant is in the past".to_string(),
                });
            }
        }
    }
    Ok(next_fire)
}

/// Runs migrations and seeds the built-in policies. Called by `init` and
/// again on every daemon start (seeding is idempotent).
pub async fn init_store<S: Store>(store: &S) -> anyhow::Result<()> {
    store.run_migrations().await?;
    let existing: Vec<String> = store
        .load_policies()
        .await?
        .into_iter()
        .map(|p| p.name)
        .collect();
    for policy in RestartPolicy::builtins() {
        if !existing.contains(&policy.name) {
            store.put_policy(&policy).await?;
        }
    }
    Ok(())
}

pub struct Coordinator<S: Store + 'static> {
    inner: Arc<Inner<S>>,
}

impl<S: Store + 'static> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S: Store + 'static> {
    config: DaemonConfig,
    tz: Tz,
    gateway: StoreGateway<S>,
    bus: Bus,
    timer: TimerWheel,
    registry: Registry,
    workloads: RwLock<HashMap<Uuid, Workload>>,
    policies: RwLock<HashMap<String, RestartPolicy>>,
    schedules: RwLock<HashMap<Uuid, Schedule>>,
    scheduler: SchedulerHandle,
    deps: SupervisorDeps<S>,
    /// Serializes registry mutations; reads stay concurrent.
    mutate: Mutex<()>,
    shutdown: CancellationToken,
}

impl<S: Store + 'static> Coordinator<S> {
    /// Boots the core: spawns the gateway, timer wheel, and scheduler, then
    /// runs recovery (supervisors in `Idle`, `lost_on_recovery` for pids
    /// from the prior generation, schedules re-registered).
    pub async fn start(
        config: DaemonConfig,
        store: Arc<S>,
        factory: Arc<dyn RunnerFactory>,
    ) -> Result<Self, ControlError> {
        config.validate()?;
        let tz = config.tz()?;

        init_store(store.as_ref())
            .await
            .map_err(ControlError::store)?;

        let bus = Bus::new(BUS_CAPACITY);
        let gateway = StoreGateway::spawn(store.clone(), &config, bus.clone());
        let timer = TimerWheel::spawn();
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));

        let deps = SupervisorDeps {
            factory,
            gateway: gateway.clone(),
            bus: bus.clone(),
            timer: timer.clone(),
            config: config.clone(),
        };

        // Declared state.
        let policies: HashMap<String, RestartPolicy> = store
            .load_policies()
            .await
            .map_err(ControlError::store)?
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        let workloads: Vec<Workload> =
            store.load_workloads().await.map_err(ControlError::store)?;
        let prior_runtime = store
            .load_workload_runtime()
            .await
            .map_err(ControlError::store)?;
        let schedules: Vec<Schedule> =
            store.load_schedules().await.map_err(ControlError::store)?;

        // Backoff timers are not persisted: every supervisor starts in
        // Idle with a clean failure streak. Pids recorded by the prior
        // generation are lost, never re-adopted.
        let mut registry_map = HashMap::new();
        let mut workload_map = HashMap::new();
        for workload in workloads {
            let policy = policies.get(&workload.policy).cloned().unwrap_or_else(|| {
                warn!(
                    workload = %workload.name,
                    "policy '{}' missing; falling back to 'none'",
                    workload.policy
                );
                RestartPolicy::builtins()
                    .into_iter()
                    .find(|p| p.name == "none")
                    .expect("builtin 'none' policy")
            });
            let initial_log_seq = store.max_log_seq(workload.id).await.unwrap_or(0);
            let handle =
                Supervisor::spawn(workload.clone(), policy, deps.clone(), initial_log_seq);

            if let Some((phase, Some(pid))) = prior_runtime.get(&workload.id) {
                if phase.is_active() {
                    let _ = handle.send(Command::MarkLost { pid: *pid });
                }
            }

            registry_map.insert(workload.id, handle);
            workload_map.insert(workload.id, workload);
        }
        info!(
            "recovered {} workload(s), {} policy(ies), {} schedule(s)",
            workload_map.len(),
            policies.len(),
            schedules.len()
        );
        *registry.write().await = registry_map;

        // Re-register schedules; a stale next_fire is re-anchored and a
        // past-due one yields the single catch-up fire.
        let now = Utc::now();
        let mut schedule_map = HashMap::new();
        let mut seed = Vec::new();
        for mut schedule in schedules {
            if schedule.enabled && schedule.next_fire.is_none() {
                schedule.next_fire =
                    initial_next_fire(schedule.kind, &schedule.expression, tz, now)
                        .ok()
                        .flatten();
            }
            schedule_map.insert(schedule.id, schedule.clone());
            seed.push(schedule);
        }
        let scheduler = SchedulerHandle::spawn(registry.clone(), gateway.clone(), tz, seed);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                tz,
                gateway,
                bus,
                timer,
                registry,
                workloads: RwLock::new(workload_map),
                policies: RwLock::new(policies),
                schedules: RwLock::new(schedule_map),
                scheduler,
                deps,
                mutate: Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    // --- Workload CRUD -----------------------------------------------------

    pub async fn create_workload(&self, req: CreateWorkload) -> Result<Uuid, ControlError> {
        let _guard = self.inner.mutate.lock().await;

        if self.resolve_name(&req.name).await.is_some() {
            return Err(ControlError::NameConflict(req.name));
        }
        let policy_name = req.policy.unwrap_or_else(|| "none".to_string());
        let policy = self
            .inner
            .policies
            .read()
            .await
            .get(&policy_name)
            .cloned()
            .ok_or_else(|| ControlError::UnknownPolicy(policy_name.clone()))?;

        let now = Utc::now();
        let workload = Workload {
            id: Uuid::new_v4(),
            name: req.name,
            argv: req.argv,
            cwd: req.cwd,
            env: req.env,
            group: req.group,
            policy: policy_name,
            created_at: now,
            updated_at: now,
        };
        workload.validate()?;
        // Validate schedules before anything persists, so a bad expression
        // never leaves a half-created workload behind.
        for spec in &req.schedules {
            validate_expression(spec.kind, &spec.expression, self.inner.tz, now)?;
        }

        self.inner.gateway.upsert_workload(&workload).await?;

        let handle = Supervisor::spawn(workload.clone(), policy, self.inner.deps.clone(), 0);
        self.inner
            .registry
            .write()
            .await
            .insert(workload.id, handle);
        self.inner
            .workloads
            .write()
            .await
            .insert(workload.id, workload.clone());

        for spec in &req.schedules {
            self.put_schedule_locked(workload.id, spec.kind, &spec.expression, spec.enabled)
                .await?;
        }

        Ok(workload.id)
    }

    pub async fn update_workload(
        &self,
        id: Uuid,
        patch: UpdateWorkload,
    ) -> Result<(), ControlError> {
        let _guard = self.inner.mutate.lock().await;

        let mut workload = self
            .inner
            .workloads
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(id.to_string()))?;

        if let Some(name) = patch.name {
            if let Some(existing) = self.resolve_name(&name).await {
                if existing != id {
                    return Err(ControlError::NameConflict(name));
                }
            }
            workload.name = name;
        }
        if let Some(argv) = patch.argv {
            workload.argv = argv;
        }
        if let Some(cwd) = patch.cwd {
            workload.cwd = cwd;
        }
        if let Some(env) = patch.env {
            workload.env = env;
        }
        if let Some(group) = patch.group {
            workload.group = group;
        }
        if let Some(policy) = patch.policy {
            if !self.inner.policies.read().await.contains_key(&policy) {
                return Err(ControlError::UnknownPolicy(policy));
            }
            workload.policy = policy;
        }
        workload.validate()?;
        workload.updated_at = Utc::now();

        self.inner.gateway.upsert_workload(&workload).await?;
        self.inner
            .workloads
            .write()
            .await
            .insert(id, workload.clone());
        if let Some(handle) = self.handle_for(id).await {
            let _ = handle.send(Command::UpdateWorkload(Box::new(workload.clone())));
            let policy = self.inner.policies.read().await.get(&workload.policy).cloned();
            if let Some(policy) = policy {
                let _ = handle.send(Command::UpdatePolicy(Box::new(policy)));
            }
        }
        Ok(())
    }

    pub async fn delete_workload(&self, id: Uuid, force: bool) -> Result<(), ControlError> {
        let _guard = self.inner.mutate.lock().await;

        let detail = self.describe(id).await?;
        if detail.runtime.phase == Phase::Running && !force {
            return Err(ControlError::Busy);
        }

        self.inner.gateway.delete_workload(id).await?;

        if let Some(handle) = self.inner.registry.write().await.remove(&id) {
            let (tx, rx) = oneshot::channel();
            if handle.send(Command::Delete { reply: tx }).is_ok() {
                let _ = tokio::time::timeout(self.inner.config.command_timeout(), rx).await;
            }
        }
        self.inner.scheduler.delete_workload(id);
        self.inner.workloads.write().await.remove(&id);
        self.inner
            .schedules
            .write()
            .await
            .retain(|_, s| s.workload_id != id);
        Ok(())
    }

    // --- Per-workload commands --------------------------------------------

    pub async fn start(&self, id: Uuid) -> Result<(), ControlError> {
        let handle = self.require_handle(id).await?;
        let (tx, rx) = oneshot::channel();
        handle.send(Command::Start { reply: tx })?;
        self.await_reply(rx, self.inner.config.command_timeout()).await
    }

    pub async fn stop(
        &self,
        id: Uuid,
        grace: Option<Duration>,
        force: bool,
    ) -> Result<(), ControlError> {
        let handle = self.require_handle(id).await?;
        let grace = if force {
            Duration::ZERO
        } else {
            grace.unwrap_or_else(|| self.inner.config.default_stop_grace())
        };
        let (tx, rx) = oneshot::channel();
        handle.send(Command::Stop { grace, reply: tx })?;
        // Stops legitimately take up to the grace period longer.
        self.await_reply(rx, self.inner.config.command_timeout() + grace)
            .await
    }

    pub async fn restart(&self, id: Uuid, delay: Option<Duration>) -> Result<(), ControlError> {
        let handle = self.require_handle(id).await?;
        let (tx, rx) = oneshot::channel();
        handle.send(Command::Restart { delay, reply: tx })?;
        let timeout = self.inner.config.command_timeout()
            + self.inner.config.default_stop_grace()
            + delay.unwrap_or(Duration::ZERO);
        self.await_reply(rx, timeout).await
    }

    pub async fn describe(&self, id: Uuid) -> Result<WorkloadDetail, ControlError> {
        let handle = self.require_handle(id).await?;
        let (tx, rx) = oneshot::channel();
        handle.send(Command::Describe { reply: tx })?;
        match tokio::time::timeout(self.inner.config.command_timeout(), rx).await {
            Ok(Ok(detail)) => Ok(detail),
            Ok(Err(_)) => Err(ControlError::Internal(
                "supervisor dropped the reply".to_string(),
            )),
            Err(_) => Err(ControlError::Timeout),
        }
    }

    pub async fn list_workloads(
        &self,
        filter: ListFilter,
    ) -> Result<Vec<WorkloadSummary>, ControlError> {
        let handles: Vec<SupervisorHandle> = {
            let registry = self.inner.registry.read().await;
            registry.values().cloned().collect()
        };

        let details = join_all(handles.iter().map(|handle| async {
            let (tx, rx) = oneshot::channel();
            if handle.send(Command::Describe { reply: tx }).is_err() {
                return None;
            }
            tokio::time::timeout(self.inner.config.command_timeout(), rx)
                .await
                .ok()
                .and_then(|r| r.ok())
        }))
        .await;

        let mut summaries: Vec<WorkloadSummary> = details
            .into_iter()
            .flatten()
            .filter(|detail| {
                filter
                    .name_contains
                    .as_ref()
                    .is_none_or(|n| detail.workload.name.contains(n.as_str()))
                    && filter
                        .group
                        .as_ref()
                        .is_none_or(|g| detail.workload.group.as_deref() == Some(g.as_str()))
                    && filter.phase.is_none_or(|p| detail.runtime.phase == p)
            })
            .map(|detail| WorkloadSummary {
                id: detail.workload.id,
                name: detail.workload.name,
                phase: detail.runtime.phase,
                pid: detail.runtime.pid,
                started_at: detail.runtime.started_at,
                consecutive_failures: detail.runtime.consecutive_failures,
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    /// Resolves a workload name to its id.
    pub async fn resolve_name(&self, name: &str) -> Option<Uuid> {
        self.inner
            .workloads
            .read()
            .await
            .values()
            .find(|w| w.name == name)
            .map(|w| w.id)
    }

    // --- Policies ----------------------------------------------------------

    pub async fn put_policy(&self, policy: RestartPolicy) -> Result<(), ControlError> {
        policy.validate()?;
        let _guard = self.inner.mutate.lock().await;

        self.inner.gateway.put_policy(&policy).await?;
        self.inner
            .policies
            .write()
            .await
            .insert(policy.name.clone(), policy.clone());

        // Push the new definition to every supervisor bound to it.
        let bound: Vec<Uuid> = self
            .inner
            .workloads
            .read()
            .await
            .values()
            .filter(|w| w.policy == policy.name)
            .map(|w| w.id)
            .collect();
        let registry = self.inner.registry.read().await;
        for id in bound {
            if let Some(handle) = registry.get(&id) {
                let _ = handle.send(Command::UpdatePolicy(Box::new(policy.clone())));
            }
        }
        Ok(())
    }

    pub async fn delete_policy(&self, name: &str) -> Result<(), ControlError> {
        if RestartPolicy::is_builtin(name) {
            return Err(ControlError::InvalidPolicy(format!(
                "cannot delete built-in policy '{name}'"
            )));
        }
        let _guard = self.inner.mutate.lock().await;
        let in_use = self
            .inner
            .workloads
            .read()
            .await
            .values()
            .any(|w| w.policy == name);
        if in_use {
            return Err(ControlError::InvalidPolicy(format!(
                "policy '{name}' is in use"
            )));
        }
        if !self.inner.policies.read().await.contains_key(name) {
            return Err(ControlError::NotFound(name.to_string()));
        }
        self.inner.gateway.delete_policy(name).await?;
        self.inner.policies.write().await.remove(name);
        Ok(())
    }

    pub async fn list_policies(&self) -> Vec<RestartPolicy> {
        let mut policies: Vec<RestartPolicy> =
            self.inner.policies.read().await.values().cloned().collect();
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        policies
    }

    // --- Schedules ---------------------------------------------------------

    pub async fn put_schedule(
        &self,
        workload_id: Uuid,
        kind: ScheduleKind,
        expression: &str,
        enabled: bool,
    ) -> Result<Uuid, ControlError> {
        let _guard = self.inner.mutate.lock().await;
        self.put_schedule_locked(workload_id, kind, expression, enabled)
            .await
    }

    async fn put_schedule_locked(
        &self,
        workload_id: Uuid,
        kind: ScheduleKind,
        expression: &str,
        enabled: bool,
    ) -> Result<Uuid, ControlError> {
        if !self.inner.workloads.read().await.contains_key(&workload_id) {
            return Err(ControlError::NotFound(workload_id.to_string()));
        }
        let now = Utc::now();
        let next_fire = validate_expression(kind, expression, self.inner.tz, now)?;

        let schedule = Schedule {
            id: Uuid::new_v4(),
            workload_id,
            kind,
            expression: expression.to_string(),
            enabled,
            last_fire: None,
            next_fire: if enabled { next_fire } else { None },
            created_at: now,
            updated_at: now,
        };
        self.inner.gateway.put_schedule(&schedule).await?;
        self.inner
            .schedules
            .write()
            .await
            .insert(schedule.id, schedule.clone());
        self.inner.scheduler.put(schedule.clone());
        Ok(schedule.id)
    }

    pub async fn enable_schedule(&self, id: Uuid) -> Result<(), ControlError> {
        let _guard = self.inner.mutate.lock().await;
        let mut schedule = self
            .inner
            .schedules
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(id.to_string()))?;

        schedule.enabled = true;
        schedule.updated_at = Utc::now();
        schedule.next_fire =
            initial_next_fire(schedule.kind, &schedule.expression, self.inner.tz, Utc::now())
                .map_err(|e| ControlError::InvalidExpression {
                    expression: schedule.expression.clone(),
                    reason: e,
                })?;
        self.inner.gateway.put_schedule(&schedule).await?;
        self.inner
            .schedules
            .write()
            .await
            .insert(id, schedule.clone());
        self.inner.scheduler.put(schedule);
        Ok(())
    }

    pub async fn disable_schedule(&self, id: Uuid) -> Result<(), ControlError> {
        let _guard = self.inner.mutate.lock().await;
        let mut schedule = self
            .inner
            .schedules
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(id.to_string()))?;

        schedule.enabled = false;
        schedule.next_fire = None;
        schedule.updated_at = Utc::now();
        self.inner.gateway.put_schedule(&schedule).await?;
        self.inner
            .schedules
            .write()
            .await
            .insert(id, schedule.clone());
        self.inner.scheduler.disable(id);
        Ok(())
    }

    pub async fn list_schedules(&self, workload_id: Option<Uuid>) -> Vec<Schedule> {
        // Fire times are written behind the coordinator's back by the
        // scheduler, so the store is the source of truth here.
        let loaded = match self.inner.gateway.store().load_schedules().await {
            Ok(schedules) => schedules,
            Err(_) => self.inner.schedules.read().await.values().cloned().collect(),
        };
        let mut schedules: Vec<Schedule> = loaded
            .into_iter()
            .filter(|s| workload_id.is_none_or(|id| s.workload_id == id))
            .collect();
        schedules.sort_by_key(|s| s.created_at);
        schedules
    }

    // --- Logs, metrics, events, health -------------------------------------

    pub async fn query_logs(
        &self,
        id: Uuid,
        filter: LogFilter,
    ) -> Result<Vec<crate::models::LogRecord>, ControlError> {
        self.require_known(id).await?;
        self.inner
            .gateway
            .store()
            .query_logs(id, &filter)
            .await
            .map_err(ControlError::store)
    }

    pub async fn query_metrics(
        &self,
        id: Uuid,
        since: Option<chrono::DateTime<Utc>>,
        until: Option<chrono::DateTime<Utc>>,
    ) -> Result<Vec<crate::models::MetricSample>, ControlError> {
        self.require_known(id).await?;
        self.inner
            .gateway
            .store()
            .query_metrics(id, since, until)
            .await
            .map_err(ControlError::store)
    }

    /// Subscribes to the event stream. The receiver's queue is bounded; a
    /// subscriber that falls behind observes a lag error instead of ever
    /// blocking the emitters.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.inner.bus.subscribe()
    }

    pub async fn health(&self) -> HealthSnapshot {
        let mut phase_counts: BTreeMap<String, usize> = BTreeMap::new();
        if let Ok(summaries) = self.list_workloads(ListFilter::default()).await {
            for summary in summaries {
                *phase_counts
                    .entry(summary.phase.as_str().to_string())
                    .or_default() += 1;
            }
        }
        HealthSnapshot {
            phase_counts,
            persistence_lag: self.inner.gateway.persistence_lag(),
            scheduler_drift_ms: self.inner.scheduler.drift_ms(),
        }
    }

    /// Graceful daemon shutdown: stop active workloads, then the scheduler,
    /// timer wheel, and persistence pipeline.
    pub async fn shutdown(&self) {
        self.inner.bus.publish(Event::now(EventKind::ShutdownRequested));
        self.inner.shutdown.cancel();

        let handles: Vec<SupervisorHandle> = {
            let registry = self.inner.registry.read().await;
            registry.values().cloned().collect()
        };
        let grace = self.inner.config.default_stop_grace();
        join_all(handles.iter().map(|handle| async move {
            let (tx, rx) = oneshot::channel();
            if handle.send(Command::Stop { grace, reply: tx }).is_ok() {
                let _ = tokio::time::timeout(grace + Duration::from_secs(1), rx).await;
            }
        }))
        .await;

        self.inner.scheduler.shutdown();
        self.inner.timer.shutdown();
        self.inner.gateway.shutdown();
        info!("coordinator shut down");
    }

    // --- Internals ----------------------------------------------------------

    async fn handle_for(&self, id: Uuid) -> Option<SupervisorHandle> {
        self.inner.registry.read().await.get(&id).cloned()
    }

    async fn require_handle(&self, id: Uuid) -> Result<SupervisorHandle, ControlError> {
        self.handle_for(id)
            .await
            .ok_or_else(|| ControlError::NotFound(id.to_string()))
    }

    async fn require_known(&self, id: Uuid) -> Result<(), ControlError> {
        if self.inner.workloads.read().await.contains_key(&id) {
            Ok(())
        } else {
            Err(ControlError::NotFound(id.to_string()))
        }
    }

    async fn await_reply(
        &self,
        rx: oneshot::Receiver<Result<(), ControlError>>,
        timeout: Duration,
    ) -> Result<(), ControlError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                warn!("supervisor dropped a command reply");
                Err(ControlError::Internal(
                    "supervisor dropped the reply".to_string(),
                ))
            }
            Err(_) => Err(ControlError::Timeout),
        }
    }
}
