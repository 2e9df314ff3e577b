use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::time::DelayQueue;
use tracing::{error, trace};

type TimerTask = Box<dyn Fn() + Send + Sync + 'static>;

struct TimerEntry {
    task: TimerTask,
    cancelled: Arc<AtomicBool>,
    /// Some(period) reschedules the entry after each firing.
    period: Option<Duration>,
}

enum TimerOp {
    Insert(TimerEntry, Duration),
}

/// One-shot timeout handle.  Cancelling a timeout that has already fired (or
/// was already cancelled) is a safe no-op; a fired task that finds its
/// triggering condition resolved is expected to do nothing.
#[derive(Clone)]
pub struct Timeout {
    cancelled: Arc<AtomicBool>,
}

impl Timeout {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Periodic tick handle returned by [`Timer::every`].
#[derive(Clone)]
pub struct TickClock {
    cancelled: Arc<AtomicBool>,
}

impl TickClock {
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Shared timer service.  All timeouts and tick clocks for a runtime are
/// driven by a single DelayQueue task; tasks run on that task, so they must
/// be short and non-blocking (hand real work off to channels).
#[derive(Clone)]
pub struct Timer {
    op_tx: Sender<TimerOp>,
}

impl Timer {
    pub fn new() -> Timer {
        let (op_tx, op_rx) = mpsc::channel(1000);
        tokio::spawn(Self::drive(op_rx));
        Timer { op_tx }
    }

    /// Run `task` once after `delay`.
    pub fn after(&self, delay: Duration, task: impl Fn() + Send + Sync + 'static) -> Timeout {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.submit(TimerEntry {
            task: Box::new(task),
            cancelled: cancelled.clone(),
            period: None,
        }, delay);
        Timeout { cancelled }
    }

    /// Run `task` every `period` until the returned clock is stopped.
    pub fn every(&self, period: Duration, task: impl Fn() + Send + Sync + 'static) -> TickClock {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.submit(TimerEntry {
            task: Box::new(task),
            cancelled: cancelled.clone(),
            period: Some(period),
        }, period);
        TickClock { cancelled }
    }

    fn submit(&self, entry: TimerEntry, delay: Duration) {
        if self.op_tx.try_send(TimerOp::Insert(entry, delay)).is_err() {
            error!("timer queue overflow, dropping timer entry");
        }
    }

    async fn drive(mut op_rx: Receiver<TimerOp>) {
        let mut delay_queue = DelayQueue::new();
        loop {
            tokio::select! {
                op = op_rx.recv() => {
                    match op {
                        Some(TimerOp::Insert(entry, delay)) => {
                            trace!("timer insert, delay {}ms", delay.as_millis());
                            delay_queue.insert(entry, delay);
                        }
                        // all Timer handles dropped
                        None => break,
                    }
                }
                Some(expired) = delay_queue.next() => {
                    let entry = expired.into_inner();
                    if !entry.cancelled.load(Ordering::Acquire) {
                        (entry.task)();
                        if let Some(period) = entry.period {
                            delay_queue.insert(entry, period);
                        }
                    }
                }
            }
        }
        trace!("timer driver exited");
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn after_fires_once() {
        let timer = Timer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        timer.after(Duration::from_millis(50), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timeout_does_not_fire() {
        let timer = Timer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let timeout = timer.after(Duration::from_millis(50), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        timeout.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // cancelling again after the (non-)fire is a no-op
        timeout.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn every_ticks_until_stopped() {
        let timer = Timer::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();
        let clock = timer.every(Duration::from_millis(100), move || {
            ticks_clone.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(350)).await;
        clock.stop();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected at least 2 ticks, got {}", seen);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
