use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ethersim_bus::{BusError, BusStats, LogEntry, Scheduler, StepReport};
use ethersim_core::{SimTime, Transmission, TransmissionId};
use log::{error, info};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::time::MissedTickBehavior;

use crate::ApiError;

/// Frames pushed to `/ws` subscribers.
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusUpdate {
    LogEntry(LogEntry),
    /// Counters after a tick that changed something.
    Stats(BusStats),
}

type Waiters = HashMap<TransmissionId, Vec<oneshot::Sender<Transmission>>>;

/// Everything the handlers and the driver share.
///
/// Lock order is scheduler, then waiters. Waiters are registered while the
/// scheduler is still locked, so no outcome can slip past a request.
#[derive(Clone)]
pub struct SharedState {
    pub scheduler: Arc<Mutex<Scheduler>>,
    waiters: Arc<Mutex<Waiters>>,
    pub updates: broadcast::Sender<BusUpdate>,
    running: Arc<AtomicBool>,
    started: Instant,
    pub request_timeout: Duration,
}

impl SharedState {
    pub fn new(scheduler: Scheduler, request_timeout: Duration) -> Self {
        let (updates, _) = broadcast::channel(1000);
        Self {
            scheduler: Arc::new(Mutex::new(scheduler)),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            updates,
            running: Arc::new(AtomicBool::new(true)),
            started: Instant::now(),
            request_timeout,
        }
    }

    /// Wall-clock time since start, used as simulation time by the driver.
    pub fn now(&self) -> SimTime {
        self.started.elapsed()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), ApiError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ApiError::Unavailable)
        }
    }

    /// Must run under the scheduler lock so subscribers see log order.
    fn publish(&self, entries: &[LogEntry]) {
        for entry in entries {
            // no subscribers is fine
            let _ = self.updates.send(BusUpdate::LogEntry(entry.clone()));
        }
    }

    pub async fn submit(&self, sender: i64, receiver: i64, msg: &str) -> Result<TransmissionId, ApiError> {
        self.ensure_running()?;
        let mut scheduler = self.scheduler.lock().await;
        let mark = scheduler.log().len();
        let id = scheduler.submit(sender, receiver, msg)?;
        self.publish(scheduler.log().since(mark));
        Ok(id)
    }

    /// Submits a frame and returns a receiver for its terminal state.
    pub async fn submit_and_watch(
        &self,
        sender: i64,
        receiver: i64,
        msg: &str,
    ) -> Result<(TransmissionId, oneshot::Receiver<Transmission>), ApiError> {
        self.ensure_running()?;
        let mut scheduler = self.scheduler.lock().await;
        let mark = scheduler.log().len();
        let id = scheduler.submit(sender, receiver, msg)?;
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.entry(id).or_default().push(tx);
        self.publish(scheduler.log().since(mark));
        Ok((id, rx))
    }

    pub async fn cancel(&self, id: TransmissionId) -> Result<Transmission, ApiError> {
        self.ensure_running()?;
        let mut scheduler = self.scheduler.lock().await;
        let mark = scheduler.log().len();
        let t = scheduler.cancel(id)?;
        self.publish(scheduler.log().since(mark));
        self.notify(std::slice::from_ref(&t)).await;
        Ok(t)
    }

    async fn notify(&self, finished: &[Transmission]) {
        let mut waiters = self.waiters.lock().await;
        for t in finished {
            for tx in waiters.remove(&t.id).unwrap_or_default() {
                // the request may have timed out already
                let _ = tx.send(t.clone());
            }
        }
    }

    /// Runs one scheduler tick and hands the results to waiters and
    /// WebSocket subscribers.
    pub async fn advance(&self, now: SimTime) -> Result<StepReport, BusError> {
        let mut scheduler = self.scheduler.lock().await;
        let report = scheduler.step(now)?;
        self.notify(&report.finished).await;
        self.publish(&report.entries);
        if !report.entries.is_empty() {
            let _ = self.updates.send(BusUpdate::Stats(scheduler.stats().clone()));
        }
        Ok(report)
    }

    /// Stops serving. Pending requests see their waiter dropped.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.waiters.lock().await.clear();
    }
}

/// Steps the simulation at a fixed wall-clock rate until a tick fails.
pub async fn run_driver(state: SharedState, tick: Duration) {
    info!("Simulation driver started with a {:?} tick", tick);
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if !state.is_running() {
            break;
        }
        if let Err(e) = state.advance(state.now()).await {
            error!("Simulation tick failed, stopping the driver: {}", e);
            state.stop().await;
            break;
        }
    }
    info!("Simulation driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethersim_bus::BusConfig;
    use ethersim_core::TransmissionStatus;

    fn state() -> SharedState {
        let config = BusConfig {
            slot_time: Duration::from_millis(10),
            collision_window: Duration::from_millis(10),
            propagation_delay: Duration::from_millis(30),
            seed: Some(5),
            ..Default::default()
        };
        SharedState::new(Scheduler::new(config).unwrap(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_waiter_gets_terminal_transmission() {
        let state = state();
        let (id, rx) = state.submit_and_watch(1, 2, "hi").await.unwrap();
        state.advance(Duration::ZERO).await.unwrap();
        state.advance(Duration::from_millis(30)).await.unwrap();

        let t = rx.await.unwrap();
        assert_eq!(t.id, id);
        assert_eq!(t.status(), TransmissionStatus::Delivered);
    }

    #[tokio::test]
    async fn test_updates_stream_log_entries() {
        let state = state();
        let mut updates = state.updates.subscribe();
        state.submit(1, 2, "hi").await.unwrap();
        state.advance(Duration::ZERO).await.unwrap();

        let mut indices = Vec::new();
        while let Ok(update) = updates.try_recv() {
            match update {
                BusUpdate::LogEntry(entry) => indices.push(entry.index),
                BusUpdate::Stats(stats) => assert_eq!(stats.granted, 1),
            }
        }
        assert_eq!(indices, [0, 1]);
    }

    #[test]
    fn test_update_frames_are_tagged() {
        let entry = LogEntry {
            index: 4,
            at: Duration::from_millis(1500),
            kind: ethersim_bus::EventKind::Delivered,
            transmission: Some(2),
            sender: 1,
            receiver: 3,
            detail: "done".to_string(),
        };
        let json = serde_json::to_value(BusUpdate::LogEntry(entry)).unwrap();
        assert_eq!(json["type"], "log_entry");
        assert_eq!(json["kind"], "delivered");
        assert_eq!(json["at"], 1.5);

        let json = serde_json::to_value(BusUpdate::Stats(BusStats::default())).unwrap();
        assert_eq!(json["type"], "stats");
        assert_eq!(json["delivered"], 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_updates_keep_log_order_under_load() {
        let state = state();
        let mut updates = state.updates.subscribe();

        let consumer = tokio::spawn(async move {
            let mut last = None;
            let mut seen = 0usize;
            loop {
                match tokio::time::timeout(Duration::from_millis(500), updates.recv()).await {
                    Ok(Ok(BusUpdate::LogEntry(entry))) => {
                        if let Some(prev) = last {
                            assert!(entry.index > prev, "entry {} arrived after {}", entry.index, prev);
                        }
                        last = Some(entry.index);
                        seen += 1;
                    }
                    Ok(Ok(BusUpdate::Stats(_))) => {}
                    Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                    Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
                }
            }
            seen
        });

        let driver = {
            let state = state.clone();
            tokio::spawn(async move {
                for ms in 0..2000u64 {
                    state.advance(Duration::from_millis(ms)).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let submitters: Vec<_> = (1..=3i64)
            .map(|sender| {
                let state = state.clone();
                tokio::spawn(async move {
                    for i in 0..300 {
                        state.submit(sender, sender + 3, &format!("frame {i}")).await.unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        driver.await.unwrap();
        for s in submitters {
            s.await.unwrap();
        }
        assert!(consumer.await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_cancel_notifies_waiter() {
        let state = state();
        let (id, rx) = state.submit_and_watch(1, 2, "hi").await.unwrap();
        state.cancel(id).await.unwrap();
        assert_eq!(rx.await.unwrap().status(), TransmissionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_stop_rejects_new_work() {
        let state = state();
        let (_, rx) = state.submit_and_watch(1, 2, "hi").await.unwrap();
        state.stop().await;
        assert!(rx.await.is_err());
        assert!(matches!(state.submit(1, 2, "again").await, Err(ApiError::Unavailable)));
    }

    #[tokio::test]
    async fn test_driver_delivers_in_real_time() {
        let state = state();
        let (_, rx) = state.submit_and_watch(2, 4, "tick tock").await.unwrap();
        let driver = tokio::spawn(run_driver(state.clone(), Duration::from_millis(1)));

        let t = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(t.status(), TransmissionStatus::Delivered);

        state.stop().await;
        driver.await.unwrap();
    }
}
