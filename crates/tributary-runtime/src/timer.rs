//! Timers for scheduled operator flushes
//!
//! A timer never calls an operator directly. It posts a
//! [`UnitMessage::Timer`] into the mailbox of the task that owns the
//! operator, so the flush runs on the same thread as `execute` and needs
//! no locking.

use crate::cron::CronSchedule;
use crate::unit::UnitMessage;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tributary_core::Period;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerSchedule {
    Every(Period),
    Cron(CronSchedule),
}

impl fmt::Display for TimerSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerSchedule::Every(p) => write!(f, "every {}", p),
            TimerSchedule::Cron(c) => write!(f, "cron '{}'", c),
        }
    }
}

/// Spawn a timer task that posts `Timer` messages for `operator_id`
///
/// # Arguments
/// * `runtime` - Runtime the timer task runs on
/// * `operator_id` - Operator the messages are addressed to
/// * `schedule` - Fixed period or cron expression
/// * `mailbox` - Mailbox of the owning task
///
/// # Returns
/// A JoinHandle for the spawned timer task
pub fn spawn_timer(
    runtime: &Handle,
    operator_id: u32,
    schedule: TimerSchedule,
    mailbox: mpsc::UnboundedSender<UnitMessage>,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        match schedule {
            TimerSchedule::Every(period) => {
                let interval = Duration::from_secs(period.secs().max(1) as u64);
                debug!("Timer {} starting with interval: {:?}", operator_id, interval);

                let mut interval_timer = tokio::time::interval(interval);
                // Skip the immediate first tick
                interval_timer.tick().await;

                loop {
                    interval_timer.tick().await;
                    if mailbox.send(UnitMessage::Timer { operator_id }).is_err() {
                        debug!("Timer {} stopping: mailbox closed", operator_id);
                        break;
                    }
                }
            }
            TimerSchedule::Cron(cron) => loop {
                let now = chrono::Utc::now();
                let Some(next) = cron.next_after(now) else {
                    warn!("Timer {}: cron '{}' never fires", operator_id, cron);
                    break;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                if mailbox.send(UnitMessage::Timer { operator_id }).is_err() {
                    debug!("Timer {} stopping: mailbox closed", operator_id);
                    break;
                }
            },
        }
    })
}

/// Timers of one task, at most one per operator.
///
/// Every per-key instance of an operator registers on `prepare`; only the
/// first registration starts a timer, and each tick is delivered to all
/// instances of that operator.
#[derive(Clone)]
pub struct TimerRegistry {
    runtime: Handle,
    mailbox: mpsc::UnboundedSender<UnitMessage>,
    handles: Arc<Mutex<HashMap<u32, JoinHandle<()>>>>,
}

impl TimerRegistry {
    pub fn new(runtime: Handle, mailbox: mpsc::UnboundedSender<UnitMessage>) -> Self {
        Self {
            runtime,
            mailbox,
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts a timer for `operator_id` unless one is running.
    /// Returns whether a timer was started.
    pub fn register(&self, operator_id: u32, schedule: TimerSchedule) -> bool {
        let Ok(mut handles) = self.handles.lock() else {
            return false;
        };
        if handles.contains_key(&operator_id) {
            return false;
        }
        debug!("Registering timer for operator {}: {}", operator_id, schedule);
        let handle = spawn_timer(&self.runtime, operator_id, schedule, self.mailbox.clone());
        handles.insert(operator_id, handle);
        true
    }

    pub fn len(&self) -> usize {
        self.handles.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop all timer tasks
    pub fn stop_all(&self) {
        if let Ok(mut handles) = self.handles.lock() {
            for (_, handle) in handles.drain() {
                handle.abort();
            }
        }
    }
}

impl fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("timers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interval_timer_posts_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = TimerRegistry::new(Handle::current(), tx);
        assert!(registry.register(7, TimerSchedule::Every(Period::from_secs(1))));
        assert!(!registry.register(7, TimerSchedule::Every(Period::from_secs(1))));
        assert_eq!(registry.len(), 1);

        for _ in 0..2 {
            match rx.recv().await {
                Some(UnitMessage::Timer { operator_id }) => assert_eq!(operator_id, 7),
                other => panic!("unexpected message: {:?}", other),
            }
        }

        registry.stop_all();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_schedule_display() {
        assert_eq!(
            TimerSchedule::Every(Period::from_secs(30)).to_string(),
            "every 30sec"
        );
        let cron = CronSchedule::parse("0 * * * *").unwrap();
        assert_eq!(TimerSchedule::Cron(cron).to_string(), "cron '0 * * * *'");
    }
}
