use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::manager::StatsSource;
use crate::messages::{Event, EventSink};

/// Periodically publishes whether any device is connected.
pub struct Heartbeat {
    stats: Arc<dyn StatsSource>,
    sink: EventSink,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    pub fn new(stats: Arc<dyn StatsSource>, sink: EventSink, interval: Duration) -> Self {
        Heartbeat {
            stats,
            sink,
            interval,
            task: Mutex::new(None),
        }
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.lock_task().is_some()
    }

    /// First beat goes out one interval after starting.
    pub fn start(&self) {
        let mut task = self.lock_task();
        if task.is_some() {
            warn!("Heartbeat already running");
            return;
        }

        let stats = self.stats.clone();
        let sink = self.sink.clone();
        let period = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let stats = stats.connection_stats();
                if sink.push(Event::Heartbeat {
                    run: stats.connected > 0,
                }) {
                    debug!("Heartbeat sent ({} devices connected)", stats.connected);
                }
            }
        }));
        info!("Heartbeat started, interval {:?}", period);
    }

    /// No heartbeat is emitted once this returns.
    pub async fn stop(&self) {
        let Some(task) = self.lock_task().take() else {
            return;
        };
        task.abort();
        let _ = task.await;
        info!("Heartbeat stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ConnectionStats;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeStats {
        connected: AtomicUsize,
    }

    impl StatsSource for FakeStats {
        fn connection_stats(&self) -> ConnectionStats {
            ConnectionStats {
                total: 2,
                connected: self.connected.load(Ordering::SeqCst),
                reconnecting: 0,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_on_interval() {
        let stats = Arc::new(FakeStats::default());
        let (sink, mut rx) = EventSink::channel("test", 16);
        let heartbeat = Heartbeat::new(stats.clone(), sink, Duration::from_secs(2));

        heartbeat.start();
        heartbeat.start();
        assert!(heartbeat.is_running());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rx.try_recv().unwrap(), Event::Heartbeat { run: false });

        stats.connected.store(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv().unwrap(), Event::Heartbeat { run: true });
        assert!(rx.try_recv().is_err());

        heartbeat.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_final_and_idempotent() {
        let (sink, mut rx) = EventSink::channel("test", 16);
        let heartbeat = Heartbeat::new(Arc::new(FakeStats::default()), sink, Duration::from_secs(2));

        heartbeat.stop().await;
        heartbeat.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        heartbeat.stop().await;
        heartbeat.stop().await;
        assert!(!heartbeat.is_running());

        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());

        // Restart after stop works.
        heartbeat.start();
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(rx.try_recv().is_ok());
        heartbeat.stop().await;
    }
}
