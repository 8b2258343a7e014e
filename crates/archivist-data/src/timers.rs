//! Contact, replace and retry timers for data senders.
//!
//! A fired timer only reports its key and generation. The owner checks the
//! report against [`TimerRegistry::take_fired`] before acting on it, so a
//! timer that raced with a cancel or re-arm has no effect.

use std::collections::HashMap;
use std::time::Duration;

use archivist_core::PublicKey;
use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// No valid push from the sender in time.
    Contact,
    /// Periodic rotation of the sender.
    Replace,
    /// Another attempt at subscribing after every candidate failed. Keyed by
    /// the archiver's own key.
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub public_key: PublicKey,
    pub kind: TimerKind,
    pub generation: u64,
}

struct Armed {
    generation: u64,
    task: JoinHandle<()>,
}

pub struct TimerRegistry {
    fired: mpsc::UnboundedSender<TimerFired>,
    armed: HashMap<(PublicKey, TimerKind), Armed>,
    next_generation: u64,
}

impl TimerRegistry {
    pub fn new(fired: mpsc::UnboundedSender<TimerFired>) -> Self {
        TimerRegistry {
            fired,
            armed: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Arms (or re-arms) the `kind` timer for `public_key`.
    pub fn arm(&mut self, public_key: &str, kind: TimerKind, after: Duration) {
        self.cancel(public_key, kind);
        self.next_generation += 1;
        let generation = self.next_generation;
        let report = TimerFired {
            public_key: public_key.to_string(),
            kind,
            generation,
        };
        let tx = self.fired.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(report);
        });
        debug!("armed {:?} timer #{} for {} ({:?})", kind, generation, public_key, after);
        self.armed
            .insert((public_key.to_string(), kind), Armed { generation, task });
    }

    pub fn cancel(&mut self, public_key: &str, kind: TimerKind) {
        if let Some(old) = self.armed.remove(&(public_key.to_string(), kind)) {
            old.task.abort();
        }
    }

    pub fn cancel_all(&mut self, public_key: &str) {
        self.cancel(public_key, TimerKind::Contact);
        self.cancel(public_key, TimerKind::Replace);
        self.cancel(public_key, TimerKind::Retry);
    }

    pub fn is_armed(&self, public_key: &str, kind: TimerKind) -> bool {
        self.armed.contains_key(&(public_key.to_string(), kind))
    }

    /// Consumes the registration behind `fired`. Returns false when the
    /// timer was cancelled or re-armed after it was scheduled.
    pub fn take_fired(&mut self, fired: &TimerFired) -> bool {
        let key = (fired.public_key.clone(), fired.kind);
        match self.armed.get(&key) {
            Some(armed) if armed.generation == fired.generation => {
                self.armed.remove(&key);
                true
            }
            _ => {
                debug!(
                    "ignoring stale {:?} timer #{} for {}",
                    fired.kind, fired.generation, fired.public_key
                );
                false
            }
        }
    }

    pub fn clear(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.task.abort();
        }
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerRegistry::new(tx);
        timers.arm("pk", TimerKind::Contact, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(2)).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.kind, TimerKind::Contact);
        assert!(timers.take_fired(&fired));
        assert!(!timers.take_fired(&fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_makes_earlier_report_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerRegistry::new(tx);
        timers.arm("pk", TimerKind::Replace, Duration::from_secs(5));
        let stale = TimerFired {
            public_key: "pk".into(),
            kind: TimerKind::Replace,
            generation: 1,
        };
        timers.arm("pk", TimerKind::Replace, Duration::from_secs(5));
        assert!(!timers.take_fired(&stale));

        tokio::time::sleep(Duration::from_secs(6)).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.generation, 2);
        assert!(timers.take_fired(&fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_reports() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerRegistry::new(tx);
        timers.arm("pk", TimerKind::Contact, Duration::from_secs(1));
        timers.arm("pk", TimerKind::Replace, Duration::from_secs(1));
        timers.cancel_all("pk");
        assert!(!timers.is_armed("pk", TimerKind::Contact));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }
}
