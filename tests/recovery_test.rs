//! Recovery semantics: declared state survives a daemon generation,
//! runtime state resets, and pids from the prior generation are reported
//! lost (and restarted when the policy says so) rather than re-adopted.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use common::{wait_for_phase, FakeRun, FakeRunnerFactory};
use warden_core::coordinator::CreateWorkload;
use warden_core::models::{Phase, RestartPolicy, ScheduleKind, Workload};
use warden_core::store::{LogFilter, Store};
use warden_core::{Coordinator, DaemonConfig};
use warden_state::MemoryStore;

fn workload_named(name: &str, policy: &str) -> Workload {
    let now = Utc::now();
    Workload {
        id: Uuid::new_v4(),
        name: name.to_string(),
        argv: vec!["/bin/sleep".to_string(), "60".to_string()],
        cwd: None,
        env: Default::default(),
        group: None,
        policy: policy.to_string(),
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test(start_paused = true)]
async fn test_declared_state_survives_restart_and_runtime_resets() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let factory = FakeRunnerFactory::always(FakeRun::RunUntilStopped);

    let first = Coordinator::start(DaemonConfig::default(), store.clone(), factory.clone())
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let id = first
        .create_workload(CreateWorkload {
            name: "svc2".to_string(),
            argv: vec!["/bin/sleep".to_string(), "60".to_string()],
            cwd: Some("/tmp".to_string()),
            policy: Some("standard".to_string()),
            ..CreateWorkload::default()
        })
        .await
        .unwrap();
    let schedule_id = first
        .put_schedule(id, ScheduleKind::Cron, "30 2 * * *", true)
        .await
        .unwrap();
    first.start(id).await.unwrap();
    assert!(wait_for_phase(&first, id, Phase::Running, Duration::from_secs(5)).await);
    first.shutdown().await;

    // Next generation over the same store.
    let second = Coordinator::start(DaemonConfig::default(), store, factory)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let detail = second.describe(id).await.unwrap();
    assert_eq!(detail.workload.name, "svc2");
    assert_eq!(detail.workload.cwd.as_deref(), Some("/tmp"));
    assert_eq!(detail.workload.policy, "standard");
    // Runtime is rebuilt, not restored: a graceful shutdown left the
    // workload stopped, so recovery begins at Idle.
    assert_eq!(detail.runtime.phase, Phase::Idle);
    assert_eq!(detail.runtime.consecutive_failures, 0);
    assert_eq!(detail.runtime.pid, None);

    let schedules = second.list_schedules(Some(id)).await;
    assert!(schedules.iter().any(|s| s.id == schedule_id && s.enabled));

    let policies = second.list_policies().await;
    assert!(policies.iter().any(|p| p.name == "standard"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_lost_pid_is_reported_and_policy_restarts_it() -> Result<()> {
    // Fabricate the aftermath of a daemon killed mid-run: the store says
    // the workload was Running with a pid.
    let store = Arc::new(MemoryStore::new());
    let mut policy = RestartPolicy::named("bring-back");
    policy.restart_on_lost = true;
    store.put_policy(&policy).await?;
    let workload = workload_named("svc2", "bring-back");
    let id = workload.id;
    store.upsert_workload(&workload).await?;
    store
        .update_workload_runtime(id, Phase::Running, Some(4242))
        .await?;

    let factory = FakeRunnerFactory::always(FakeRun::RunUntilStopped);
    let coordinator = Coordinator::start(DaemonConfig::default(), store, factory.clone())
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    // The lost pid is never re-adopted; the policy brings up a fresh run.
    assert!(wait_for_phase(&coordinator, id, Phase::Running, Duration::from_secs(5)).await);
    assert_eq!(factory.spawns(), 1);
    let detail = coordinator.describe(id).await.unwrap();
    assert_ne!(detail.runtime.pid, Some(4242));
    assert_eq!(detail.runtime.consecutive_failures, 0);

    // The loss is on the record.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let logs = coordinator
        .query_logs(
            id,
            LogFilter {
                grep: Some("lost".to_string()),
                ..LogFilter::default()
            },
        )
        .await
        .unwrap();
    assert!(logs.iter().any(|r| r.line.contains("4242")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_lost_pid_without_restart_policy_stays_idle() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let workload = workload_named("svc3", "none");
    let id = workload.id;
    store.upsert_workload(&workload).await?;
    store
        .update_workload_runtime(id, Phase::Running, Some(777))
        .await?;

    let factory = FakeRunnerFactory::always(FakeRun::RunUntilStopped);
    let coordinator = Coordinator::start(DaemonConfig::default(), store, factory.clone())
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    tokio::time::sleep(Duration::from_secs(2)).await;
    let detail = coordinator.describe(id).await.unwrap();
    assert_eq!(detail.runtime.phase, Phase::Idle);
    assert_eq!(factory.spawns(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_log_sequence_continues_across_generations() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let factory = FakeRunnerFactory::always(FakeRun::quick_exit(0));

    let first = Coordinator::start(DaemonConfig::default(), store.clone(), factory.clone())
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let id = first
        .create_workload(CreateWorkload {
            name: "seq".to_string(),
            argv: vec!["/bin/true".to_string()],
            policy: Some("none".to_string()),
            ..CreateWorkload::default()
        })
        .await
        .unwrap();
    first.start(id).await.unwrap();
    assert!(wait_for_phase(&first, id, Phase::Stopped, Duration::from_secs(5)).await);
    first.shutdown().await;

    let second = Coordinator::start(DaemonConfig::default(), store.clone(), factory)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    second.start(id).await.unwrap();
    assert!(wait_for_phase(&second, id, Phase::Stopped, Duration::from_secs(5)).await);
    tokio::time::sleep(Duration::from_secs(1)).await;
    second.shutdown().await;

    let logs = store.query_logs(id, &LogFilter::default()).await?;
    let seqs: Vec<i64> = logs.iter().map(|r| r.seq).collect();
    assert!(!seqs.is_empty());
    for pair in seqs.windows(2) {
        assert!(pair[1] > pair[0], "sequences must keep increasing: {seqs:?}");
    }
    Ok(())
}
