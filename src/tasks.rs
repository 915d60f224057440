//! Cooperative non-I/O task queue.
//!
//! The pagers decompose into a parent task (orchestrator) and one child
//! task per vBucket. Tasks are named; the queue can be driven manually
//! (tests run the next ready task and assert on its name) or by the tokio
//! background driver.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::storage::clock;

pub type TaskId = u64;

/// Snooze used by tasks that only ever run when explicitly woken.
pub const IDLE_SLEEP_SECS: u64 = 60 * 60 * 24;

pub enum TaskOutcome {
    /// Drop the task from the queue
    Done,
    /// Run again as soon as the queue gets back to it
    Reschedule,
    /// Sleep in the future queue for this many seconds
    Snooze(u64),
}

pub trait NonIoTask: Send + Sync {
    fn description(&self) -> String;
    fn run(&self, queue: &Arc<TaskQueue>) -> TaskOutcome;
}

struct Scheduled {
    id: TaskId,
    /// 0 = ready now
    wake_at_ms: i64,
    /// FIFO order among ready tasks
    seq: u64,
    task: Arc<dyn NonIoTask>,
}

pub struct TaskQueue {
    tasks: Mutex<Vec<Scheduled>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

impl TaskQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
        })
    }

    pub fn schedule(&self, task: Arc<dyn NonIoTask>, delay_secs: u64) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.insert(id, task, delay_secs);
        id
    }

    fn insert(&self, id: TaskId, task: Arc<dyn NonIoTask>, delay_secs: u64) {
        let wake_at_ms = if delay_secs == 0 {
            0
        } else {
            clock::now_ms().saturating_add((delay_secs as i64).saturating_mul(1000))
        };
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().push(Scheduled {
            id,
            wake_at_ms,
            seq,
            task,
        });
    }

    /// Promote a snoozed task to the ready queue. Unknown ids are a
    /// no-op, so repeated wakes coalesce.
    pub fn wake(&self, id: TaskId) {
        let mut tasks = self.tasks.lock();
        if let Some(entry) = tasks.iter_mut().find(|t| t.id == id) {
            entry.wake_at_ms = 0;
        }
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        tasks.len() != before
    }

    pub fn ready_len(&self) -> usize {
        let now = clock::now_ms();
        self.tasks.lock().iter().filter(|t| t.wake_at_ms <= now).count()
    }

    pub fn future_len(&self) -> usize {
        let now = clock::now_ms();
        self.tasks.lock().iter().filter(|t| t.wake_at_ms > now).count()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Milliseconds until the next task is due, if any are scheduled.
    pub fn next_due_ms(&self) -> Option<i64> {
        let now = clock::now_ms();
        self.tasks
            .lock()
            .iter()
            .map(|t| (t.wake_at_ms - now).max(0))
            .min()
    }

    /// Execute the earliest ready task and return its name. The queue
    /// lock is not held across the task body, so tasks may schedule
    /// children or wake peers.
    pub fn run_next_ready(self: &Arc<Self>) -> Option<String> {
        let entry = {
            let mut tasks = self.tasks.lock();
            let now = clock::now_ms();
            let idx = tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.wake_at_ms <= now)
                .min_by_key(|(_, t)| t.seq)
                .map(|(i, _)| i)?;
            tasks.swap_remove(idx)
        };

        let description = entry.task.description();
        match entry.task.run(self) {
            TaskOutcome::Done => {}
            TaskOutcome::Reschedule => self.insert(entry.id, entry.task, 0),
            TaskOutcome::Snooze(secs) => self.insert(entry.id, entry.task, secs.max(1)),
        }
        Some(description)
    }
}

/// Drive the queue from a tokio background task, the way the server's
/// cron loop runs. Aborting the returned handle stops the driver.
pub fn spawn_driver(queue: Arc<TaskQueue>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            while queue.run_next_ready().is_some() {}
            let idle = queue
                .next_due_ms()
                .map(|ms| ms.clamp(10, 1000) as u64)
                .unwrap_or(200);
            tokio::time::sleep(Duration::from_millis(idle)).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingTask {
        name: &'static str,
        runs: AtomicUsize,
        outcome: fn(usize) -> TaskOutcome,
    }

    impl NonIoTask for CountingTask {
        fn description(&self) -> String {
            self.name.to_string()
        }

        fn run(&self, _queue: &Arc<TaskQueue>) -> TaskOutcome {
            let n = self.runs.fetch_add(1, Ordering::Relaxed);
            (self.outcome)(n)
        }
    }

    #[test]
    fn fifo_among_ready_tasks() {
        let queue = TaskQueue::new();
        queue.schedule(
            Arc::new(CountingTask {
                name: "first",
                runs: AtomicUsize::new(0),
                outcome: |_| TaskOutcome::Done,
            }),
            0,
        );
        queue.schedule(
            Arc::new(CountingTask {
                name: "second",
                runs: AtomicUsize::new(0),
                outcome: |_| TaskOutcome::Done,
            }),
            0,
        );
        assert_eq!(queue.run_next_ready().as_deref(), Some("first"));
        assert_eq!(queue.run_next_ready().as_deref(), Some("second"));
        assert_eq!(queue.run_next_ready(), None);
    }

    #[test]
    fn snoozed_tasks_need_a_wake() {
        let queue = TaskQueue::new();
        let id = queue.schedule(
            Arc::new(CountingTask {
                name: "sleeper",
                runs: AtomicUsize::new(0),
                outcome: |_| TaskOutcome::Snooze(IDLE_SLEEP_SECS),
            }),
            IDLE_SLEEP_SECS,
        );
        assert_eq!(queue.ready_len(), 0);
        assert_eq!(queue.future_len(), 1);
        assert_eq!(queue.run_next_ready(), None);

        queue.wake(id);
        assert_eq!(queue.ready_len(), 1);
        assert_eq!(queue.run_next_ready().as_deref(), Some("sleeper"));
        // It snoozed itself again.
        assert_eq!(queue.future_len(), 1);

        // Waking twice in a row is harmless.
        queue.wake(id);
        queue.wake(id);
        assert_eq!(queue.ready_len(), 1);
    }

    #[test]
    fn reschedule_runs_again_after_newcomers() {
        let queue = TaskQueue::new();
        queue.schedule(
            Arc::new(CountingTask {
                name: "worker",
                runs: AtomicUsize::new(0),
                outcome: |n| {
                    if n < 2 {
                        TaskOutcome::Reschedule
                    } else {
                        TaskOutcome::Done
                    }
                },
            }),
            0,
        );
        assert_eq!(queue.run_next_ready().as_deref(), Some("worker"));
        assert_eq!(queue.run_next_ready().as_deref(), Some("worker"));
        assert_eq!(queue.run_next_ready().as_deref(), Some("worker"));
        assert_eq!(queue.run_next_ready(), None);
    }

    #[test]
    fn cancel_removes_the_task() {
        let queue = TaskQueue::new();
        let id = queue.schedule(
            Arc::new(CountingTask {
                name: "gone",
                runs: AtomicUsize::new(0),
                outcome: |_| TaskOutcome::Done,
            }),
            10,
        );
        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn driver_runs_scheduled_tasks() {
        let queue = TaskQueue::new();
        let runs = Arc::new(AtomicUsize::new(0));

        struct OneShot {
            runs: Arc<AtomicUsize>,
        }

        impl NonIoTask for OneShot {
            fn description(&self) -> String {
                "oneshot".to_string()
            }

            fn run(&self, _queue: &Arc<TaskQueue>) -> TaskOutcome {
                self.runs.fetch_add(1, Ordering::Relaxed);
                TaskOutcome::Done
            }
        }

        queue.schedule(
            Arc::new(OneShot {
                runs: Arc::clone(&runs),
            }),
            0,
        );
        let handle = spawn_driver(Arc::clone(&queue));
        for _ in 0..100 {
            if runs.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert!(queue.is_empty());
    }
}
