//! Timer wheel: accepts `(deadline, token)` pairs and delivers the tokens
//! on or after their deadline.
//!
//! Tokens with equal deadlines are delivered in insertion order.
//! Cancellation by id is O(log n). This is the only component that sleeps
//! on absolute time; everything else measures durations.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Handle for cancelling a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Delivered to the owner's channel when a deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFire {
    pub id: TimerId,
    pub token: u64,
}

struct Entry {
    id: TimerId,
    token: u64,
    tx: mpsc::UnboundedSender<TimerFire>,
}

#[derive(Default)]
struct WheelState {
    queue: BTreeMap<(Instant, u64), Entry>,
    index: HashMap<u64, (Instant, u64)>,
    next_seq: u64,
    next_id: u64,
}

/// Shared timer wheel backed by a single driver task.
#[derive(Clone)]
pub struct TimerWheel {
    state: Arc<Mutex<WheelState>>,
    wakeup: Arc<Notify>,
    shutdown: CancellationToken,
}

impl TimerWheel {
    /// Creates the wheel and spawns its driver task.
    pub fn spawn() -> Self {
        let wheel = Self {
            state: Arc::new(Mutex::new(WheelState::default())),
            wakeup: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        };
        let driver = wheel.clone();
        tokio::spawn(async move { driver.run().await });
        wheel
    }

    /// Schedules `token` for delivery to `tx` at `deadline`.
    pub fn schedule_at(
        &self,
        deadline: Instant,
        token: u64,
        tx: mpsc::UnboundedSender<TimerFire>,
    ) -> TimerId {
        let mut state = self.state.lock().expect("timer wheel poisoned");
        let id = TimerId(state.next_id);
        state.next_id += 1;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.insert((deadline, seq), Entry { id, token, tx });
        state.index.insert(id.0, (deadline, seq));
        drop(state);
        self.wakeup.notify_one();
        id
    }

    pub fn schedule_after(
        &self,
        delay: Duration,
        token: u64,
        tx: mpsc::UnboundedSender<TimerFire>,
    ) -> TimerId {
        self.schedule_at(Instant::now() + delay, token, tx)
    }

    /// Cancels a pending timer. Returns false when it already fired
    /// or was never scheduled.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.state.lock().expect("timer wheel poisoned");
        match state.index.remove(&id.0) {
            Some(key) => state.queue.remove(&key).is_some(),
            None => false,
        }
    }

    /// Stops the driver task. Pending timers are dropped.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn run(self) {
        loop {
            let next_deadline = self.fire_due();

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = async {
                    match next_deadline {
                        Some(deadline) => sleep_until(deadline).await,
                        // Nothing queued; park until a schedule call.
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }
        }
    }

    /// Delivers everything due and returns the next pending deadline.
    fn fire_due(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut state = self.state.lock().expect("timer wheel poisoned");
        loop {
            let key = match state.queue.keys().next() {
                Some(&(deadline, seq)) if deadline <= now => (deadline, seq),
                Some(&(deadline, _)) => return Some(deadline),
                None => return None,
            };
            let entry = state.queue.remove(&key).expect("peeked key");
            state.index.remove(&entry.id.0);
            // A closed owner just discards its fire.
            let _ = entry.tx.send(TimerFire {
                id: entry.id,
                token: entry.token,
            });
        }
    }
}
