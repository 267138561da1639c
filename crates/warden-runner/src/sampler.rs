//! Resource sampling for a running child: cpu fraction, resident memory,
//! and thread count at a fixed cadence. Cheap enough to skip entirely when
//! the process exits within the first interval.

use std::time::Duration;

use chrono::Utc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use warden_core::models::MetricSample;
use warden_core::runner::RunnerEvent;

pub(crate) async fn sample_loop(
    workload_id: Uuid,
    pid: u32,
    interval: Duration,
    events: mpsc::UnboundedSender<RunnerEvent>,
    cancel: CancellationToken,
) {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    let mut tick = tokio::time::interval(interval.max(Duration::from_millis(100)));
    // The first tick completes immediately; skip it so a short-lived
    // process produces no samples at all.
    tick.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        let Some(process) = system.process(target) else {
            break;
        };

        let sample = MetricSample {
            workload_id,
            at: Utc::now(),
            // sysinfo reports percent of one core; the sample carries a
            // core fraction (0.0..=N for N cores).
            cpu: f64::from(process.cpu_usage()) / 100.0,
            rss_bytes: process.memory(),
            threads: process
                .tasks()
                .map(|tasks| tasks.len() as u32)
                .unwrap_or(1),
        };
        let _ = events.send(RunnerEvent::Sample(sample));
    }
}
