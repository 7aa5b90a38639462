//! Lane-based cooperative task scheduler (spec.md §4.8).
//!
//! Generalizes the teacher's background-committer-thread pattern (a
//! `mpsc` channel plus a dedicated thread, see `db/group_commit.rs`) into
//! four independent lanes (`reader`, `writer`, `aux_io`, `non_io`), each a
//! fixed pool of worker threads draining a priority heap of runnable
//! tasks and a time-ordered heap of snoozed ones.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// One schedulable unit of background work. `run` returns
/// `(run_again, sleep_seconds)`: `run_again = false` ends the task for
/// good; `sleep_seconds = f64::INFINITY` means "do not run again until
/// explicitly woken".
pub trait Task: Send {
    /// Executes one slice of work.
    fn run(&mut self) -> (bool, f64);

    /// Name used in logging; defaults to a generic label.
    fn name(&self) -> &str {
        "task"
    }
}

/// The four scheduling lanes (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Disk/network reads: background fetch, DCP backfill.
    Reader,
    /// Disk writes: the flusher.
    Writer,
    /// Secondary I/O: access scanner, collection purge.
    AuxIo,
    /// CPU-only work: eviction pager, stat rollups.
    NonIo,
}

const LANES: [Lane; 4] = [Lane::Reader, Lane::Writer, Lane::AuxIo, Lane::NonIo];

/// Opaque handle to a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

struct RunnableEntry {
    priority: i32,
    id: TaskId,
}

impl PartialEq for RunnableEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}
impl Eq for RunnableEntry {}
impl PartialOrd for RunnableEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for RunnableEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority.cmp(&other.priority)
    }
}

struct SnoozedEntry {
    wake_at: Instant,
    id: TaskId,
}

impl PartialEq for SnoozedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at
    }
}
impl Eq for SnoozedEntry {}
impl PartialOrd for SnoozedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SnoozedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.wake_at.cmp(&other.wake_at)
    }
}

struct LaneState {
    tasks: HashMap<TaskId, (Box<dyn Task>, i32)>,
    runnable: BinaryHeap<RunnableEntry>,
    /// Tasks asleep until a deadline; absent from both heaps if snoozed
    /// indefinitely (`sleep_seconds = INFINITY`) — those only move via
    /// an explicit `wake`.
    snoozed: BinaryHeap<Reverse<SnoozedEntry>>,
    parked: HashSet<TaskId>,
    cancelled: HashSet<TaskId>,
    shutdown: bool,
}

impl LaneState {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            runnable: BinaryHeap::new(),
            snoozed: BinaryHeap::new(),
            parked: HashSet::new(),
            cancelled: HashSet::new(),
            shutdown: false,
        }
    }

    fn wake_due_snoozed(&mut self, now: Instant) {
        while let Some(Reverse(top)) = self.snoozed.peek() {
            if top.wake_at > now {
                break;
            }
            let Reverse(entry) = self.snoozed.pop().unwrap();
            if let Some((_, priority)) = self.tasks.get(&entry.id) {
                self.runnable.push(RunnableEntry { priority: *priority, id: entry.id });
            }
        }
    }
}

struct LaneHandle {
    state: Arc<(Mutex<LaneState>, Condvar)>,
    workers: Vec<thread::JoinHandle<()>>,
}

/// The task pool: one [`LaneHandle`] per lane, each backed by a fixed
/// worker-thread pool.
pub struct Scheduler {
    lanes: HashMap<Lane, LaneHandle>,
    next_id: AtomicU64,
}

fn worker_loop(state: Arc<(Mutex<LaneState>, Condvar)>) {
    let (mutex, condvar) = &*state;
    loop {
        let mut guard = mutex.lock().unwrap();
        loop {
            if guard.shutdown {
                return;
            }
            let now = Instant::now();
            guard.wake_due_snoozed(now);
            if let Some(entry) = guard.runnable.pop() {
                if guard.cancelled.remove(&entry.id) {
                    guard.tasks.remove(&entry.id);
                    continue;
                }
                let Some((mut task, priority)) = guard.tasks.remove(&entry.id) else { continue };
                drop(guard);
                let (run_again, sleep_seconds) = task.run();
                let mut guard2 = mutex.lock().unwrap();
                if guard2.cancelled.remove(&entry.id) {
                    // cancel() observed termination; drop the task.
                } else if run_again {
                    guard2.tasks.insert(entry.id, (task, priority));
                    if sleep_seconds.is_infinite() {
                        guard2.parked.insert(entry.id);
                    } else if sleep_seconds <= 0.0 {
                        guard2.runnable.push(RunnableEntry { priority, id: entry.id });
                    } else {
                        guard2.snoozed.push(Reverse(SnoozedEntry {
                            wake_at: Instant::now() + Duration::from_secs_f64(sleep_seconds),
                            id: entry.id,
                        }));
                    }
                }
                guard = guard2;
                continue;
            }

            let next_deadline = guard.snoozed.peek().map(|Reverse(e)| e.wake_at);
            match next_deadline {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    let (g, _) = condvar.wait_timeout(guard, wait).unwrap();
                    guard = g;
                }
                None => {
                    guard = condvar.wait(guard).unwrap();
                }
            }
        }
    }
}

impl Scheduler {
    /// Spawns `threads_per_lane` worker threads for each of the four
    /// lanes.
    pub fn new(threads_per_lane: usize) -> Self {
        let mut lanes = HashMap::new();
        for lane in LANES {
            let state = Arc::new((Mutex::new(LaneState::new()), Condvar::new()));
            let workers = (0..threads_per_lane.max(1))
                .map(|_| {
                    let state = state.clone();
                    thread::spawn(move || worker_loop(state))
                })
                .collect();
            lanes.insert(lane, LaneHandle { state, workers });
        }
        Self { lanes, next_id: AtomicU64::new(1) }
    }

    /// Schedules `task` to run immediately in `lane` at `priority`
    /// (higher runs first).
    pub fn schedule(&self, lane: Lane, task: Box<dyn Task>, priority: i32) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = &self.lanes[&lane];
        let (mutex, condvar) = &*handle.state;
        let mut guard = mutex.lock().unwrap();
        guard.tasks.insert(id, (task, priority));
        guard.runnable.push(RunnableEntry { priority, id });
        drop(guard);
        condvar.notify_one();
        id
    }

    /// Cancels `task_id` in `lane`. If the task is mid-`run()`, the
    /// cancellation is observed as soon as `run()` returns (it will not
    /// be rescheduled); if it is idle, it is dropped immediately.
    pub fn cancel(&self, lane: Lane, task_id: TaskId) {
        let handle = &self.lanes[&lane];
        let (mutex, condvar) = &*handle.state;
        let mut guard = mutex.lock().unwrap();
        if guard.tasks.remove(&task_id).is_some() {
            guard.parked.remove(&task_id);
        } else {
            // Currently executing (removed from `tasks` by the worker);
            // mark it so the worker drops it on completion instead of
            // rescheduling.
            guard.cancelled.insert(task_id);
        }
        drop(guard);
        condvar.notify_all();
    }

    /// Moves `task_id` from snoozed/parked to runnable immediately.
    /// Idempotent: waking an already-runnable task is a no-op.
    pub fn wake(&self, lane: Lane, task_id: TaskId) {
        let handle = &self.lanes[&lane];
        let (mutex, condvar) = &*handle.state;
        let mut guard = mutex.lock().unwrap();
        guard.parked.remove(&task_id);
        guard.snoozed = guard.snoozed.drain().filter(|Reverse(e)| e.id != task_id).collect();
        if let Some((_, priority)) = guard.tasks.get(&task_id) {
            if !guard.runnable.iter().any(|e| e.id == task_id) {
                guard.runnable.push(RunnableEntry { priority: *priority, id: task_id });
            }
        }
        drop(guard);
        condvar.notify_all();
    }

    /// Requests a lane's worker threads stop after their current task.
    pub fn shutdown(&mut self) {
        for handle in self.lanes.values_mut() {
            {
                let (mutex, condvar) = &*handle.state;
                mutex.lock().unwrap().shutdown = true;
                condvar.notify_all();
            }
            for worker in handle.workers.drain(..) {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct OnceTask(mpsc::Sender<()>);
    impl Task for OnceTask {
        fn run(&mut self) -> (bool, f64) {
            let _ = self.0.send(());
            (false, 0.0)
        }
    }

    struct CountdownTask {
        remaining: u32,
        done: mpsc::Sender<()>,
    }
    impl Task for CountdownTask {
        fn run(&mut self) -> (bool, f64) {
            if self.remaining == 0 {
                let _ = self.done.send(());
                return (false, 0.0);
            }
            self.remaining -= 1;
            (true, 0.0)
        }
    }

    #[test]
    fn scheduled_task_runs() {
        let scheduler = Scheduler::new(1);
        let (tx, rx) = mpsc::channel();
        scheduler.schedule(Lane::NonIo, Box::new(OnceTask(tx)), 0);
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn run_again_is_rescheduled_until_done() {
        let scheduler = Scheduler::new(1);
        let (tx, rx) = mpsc::channel();
        scheduler.schedule(Lane::NonIo, Box::new(CountdownTask { remaining: 3, done: tx }), 0);
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }
}
