//! Dependency-aware task dispatch, GPU arbitration, and deadlock detection
//! (C1). Ported from `original_source`'s `Worker` class: a fixed pool of OS
//! threads repeatedly scans a single protected deque front-to-back for the
//! first ready task, picking it up, running it outside the lock, then
//! re-acquiring the lock to record completion and wake everyone else.
//!
//! This stays plain `std::thread` + `Mutex`/`Condvar` rather than an async
//! task model: the pipeline's tasks run synchronously to completion (§5
//! "Individual tasks are not interrupted mid-execution"), so there is
//! nothing for an executor to interleave within a task body. The only
//! asynchronous code in the crate is the small amount needed to drive
//! `wgpu`'s buffer-mapping futures from inside a worker thread (`src/gpu.rs`),
//! which borrows a `tokio` runtime the way the teacher's own GPU error
//! handling does.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::logger::Logger;
use crate::task::{Task, TaskState};

/// Single-holder GPU arbitration token (I3: GPU task runtimes never
/// overlap). Mirrors the teacher's `Arc<Mutex<OptimizedMazeRenderer>>`
/// device-serialization idiom in `concurrent_renderer.rs`'s
/// `RenderCoordinator`, but as a bare claim/release flag since the tasks
/// here own their own GPU resources (`src/gpu.rs`) rather than sharing one
/// renderer object.
struct GpuSlot {
    held: AtomicBool,
}

impl GpuSlot {
    fn new() -> Self {
        Self { held: AtomicBool::new(false) }
    }

    fn try_claim(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

struct Shared {
    deque: Mutex<VecDeque<Arc<dyn Task>>>,
    running: Mutex<Vec<Arc<dyn Task>>>,
    wakeup: Condvar,
    gpu_slot: GpuSlot,
    shutdown: AtomicBool,
    failed: AtomicBool,
    error_message: Mutex<Option<String>>,
    total: AtomicU32,
    completed: AtomicU32,
    logger: Logger,
}

impl Shared {
    fn notify_all(&self) {
        self.wakeup.notify_all();
    }
}

/// Fixed-size worker pool driving the dependency graph to completion.
pub struct Scheduler {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

/// Result of `wait_all`: whether the run completed cleanly, and the first
/// recorded failure message if not.
pub struct WaitOutcome {
    pub success: bool,
    pub error_message: Option<String>,
}

impl Scheduler {
    /// `num_threads` workers; spec's default is hardware concurrency + 1 to
    /// leave room for a thread that is blocked submitting GPU work.
    pub fn new(num_threads: usize, logger: Logger) -> Self {
        let shared = Arc::new(Shared {
            deque: Mutex::new(VecDeque::new()),
            running: Mutex::new(Vec::new()),
            wakeup: Condvar::new(),
            gpu_slot: GpuSlot::new(),
            shutdown: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            error_message: Mutex::new(None),
            total: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            logger,
        });

        let threads = (0..num_threads.max(1))
            .map(|idx| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("focus-stack-worker-{idx}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, threads }
    }

    /// Appends a task to the back of the deque; no-op once shutting down.
    pub fn add(&self, task: Arc<dyn Task>) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.shared.total.fetch_add(1, Ordering::AcqRel);
        self.shared.deque.lock().unwrap().push_back(task);
        self.shared.notify_all();
    }

    /// Priority-inserts at the front of the deque (used for the reference
    /// image's tasks so they are picked up before the rest of the stream).
    pub fn prepend(&self, task: Arc<dyn Task>) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.shared.total.fetch_add(1, Ordering::AcqRel);
        self.shared.deque.lock().unwrap().push_front(task);
        self.shared.notify_all();
    }

    /// Blocks until the queue drains or a task fails. `timeout: None` blocks
    /// indefinitely (running the deadlock watchdog periodically);
    /// `Some(d)` returns after `d` regardless, without unwinding.
    pub fn wait_all(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|d| Instant::now() + d);
        let watchdog_interval = Duration::from_secs(10);
        let mut next_watchdog = Instant::now() + watchdog_interval;

        loop {
            if self.is_drained() || self.shared.failed.load(Ordering::Acquire) {
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(20));
            if Instant::now() >= next_watchdog {
                self.run_deadlock_watchdog();
                next_watchdog = Instant::now() + watchdog_interval;
            }
        }

        WaitOutcome {
            success: !self.shared.failed.load(Ordering::Acquire),
            error_message: self.shared.error_message.lock().unwrap().clone(),
        }
    }

    fn is_drained(&self) -> bool {
        self.shared.deque.lock().unwrap().is_empty() && self.shared.running.lock().unwrap().is_empty()
    }

    /// `(total, completed)` snapshot for progress reporting.
    pub fn get_status(&self) -> (u32, u32) {
        (
            self.shared.total.load(Ordering::Acquire),
            self.shared.completed.load(Ordering::Acquire),
        )
    }

    /// Every ~10s while blocked in `wait_all` with no caller timeout: check
    /// that every pending task's dependencies are Done, Running, or
    /// themselves still pending. A dependency that is none of those is an
    /// orchestrator bug (it was dropped without ever being scheduled).
    fn run_deadlock_watchdog(&self) {
        let pending: Vec<Arc<dyn Task>> = self.shared.deque.lock().unwrap().iter().cloned().collect();
        let running: Vec<Arc<dyn Task>> = self.shared.running.lock().unwrap().clone();
        for task in pending.iter().chain(running.iter()) {
            for dep in task.depends_on() {
                let known = dep.state() == TaskState::Done
                    || dep.state() == TaskState::Running
                    || pending.iter().any(|t| Arc::ptr_eq(t, &dep));
                if !known {
                    self.shared.logger.error(format!(
                        "watchdog: task '{}' depends on '{}' which is neither scheduled nor done",
                        task.name(),
                        dep.name()
                    ));
                }
            }
        }
    }

    /// Clears the deque, flips shutdown, wakes workers, and joins threads.
    pub fn shutdown(mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.deque.lock().unwrap().clear();
        self.shared.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.deque.lock().unwrap().clear();
        self.shared.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }

        let picked = {
            let mut deque = shared.deque.lock().unwrap();
            let gpu_free = || !shared.gpu_slot.held.load(Ordering::Acquire);

            let mut found_idx = None;
            if !shared.failed.load(Ordering::Acquire) {
                for (idx, task) in deque.iter().enumerate() {
                    if task.ready_to_run() && (!task.uses_gpu() || gpu_free()) {
                        found_idx = Some(idx);
                        break;
                    }
                }
            }

            match found_idx {
                Some(idx) => {
                    let task = deque.remove(idx).unwrap();
                    if task.uses_gpu() {
                        // No other worker can have claimed it: we are still
                        // holding `deque`'s lock (which covers the GPU-free
                        // check above) when we claim it here.
                        shared.gpu_slot.try_claim();
                    }
                    shared.running.lock().unwrap().push(task.clone());
                    Some(task)
                }
                None => {
                    if shared.shutdown.load(Ordering::Acquire) || deque.is_empty() && shared.failed.load(Ordering::Acquire) {
                        None
                    } else {
                        let (_guard, _timeout) = shared
                            .wakeup
                            .wait_timeout(deque, Duration::from_millis(200))
                            .unwrap();
                        None
                    }
                }
            }
        };

        let Some(task) = picked else {
            continue;
        };

        let outcome = task.run(&shared.logger);

        if task.uses_gpu() {
            shared.gpu_slot.release();
        }

        retire(&shared, &task, outcome);
    }
}

fn retire(shared: &Arc<Shared>, task: &Arc<dyn Task>, outcome: std::result::Result<(), String>) {
    shared.running.lock().unwrap().retain(|t| !Arc::ptr_eq(t, task));
    shared.completed.fetch_add(1, Ordering::AcqRel);

    if let Err(message) = outcome {
        shared.logger.error(&message);
        let mut err_slot = shared.error_message.lock().unwrap();
        if err_slot.is_none() {
            *err_slot = Some(message);
        }
        shared.failed.store(true, Ordering::Release);
    }

    shared.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::task::{Artifact, TaskBase};
    use std::sync::Mutex as StdMutex;

    struct RecordingTask {
        base: TaskBase,
        order: Arc<StdMutex<Vec<String>>>,
        should_fail: bool,
    }

    impl Task for RecordingTask {
        fn base(&self) -> &TaskBase {
            &self.base
        }

        fn execute(&self, _logger: &Logger) -> Result<Artifact> {
            self.order.lock().unwrap().push(self.name().to_string());
            if self.should_fail {
                Err(crate::error::EngineError::ConfigError("boom".into()))
            } else {
                Ok(Artifact::Unit)
            }
        }
    }

    fn chain_task(
        name: &str,
        order: &Arc<StdMutex<Vec<String>>>,
        deps: Vec<Arc<dyn Task>>,
    ) -> Arc<dyn Task> {
        Arc::new(RecordingTask {
            base: TaskBase::new(name, format!("{name}.jpg"), 0, false).with_depends_on(deps),
            order: order.clone(),
            should_fail: false,
        })
    }

    #[test]
    fn linear_chain_runs_in_dependency_order_single_worker() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let scheduler = Scheduler::new(1, Logger::new());

        let t0 = chain_task("T0", &order, vec![]);
        let t1 = chain_task("T1", &order, vec![t0.clone()]);
        let t2 = chain_task("T2", &order, vec![t1.clone()]);
        let t3 = chain_task("T3", &order, vec![t2.clone()]);

        scheduler.add(t0);
        scheduler.add(t1);
        scheduler.add(t2);
        scheduler.add(t3);

        let outcome = scheduler.wait_all(Some(Duration::from_secs(5)));
        assert!(outcome.success);
        assert_eq!(*order.lock().unwrap(), vec!["T0", "T1", "T2", "T3"]);
    }

    #[test]
    fn fan_out_respects_dependencies() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let scheduler = Scheduler::new(3, Logger::new());

        let a = chain_task("A", &order, vec![]);
        let b = chain_task("B", &order, vec![a.clone()]);
        let c = chain_task("C", &order, vec![a.clone()]);
        let d = chain_task("D", &order, vec![a.clone()]);
        let e = chain_task("E", &order, vec![b.clone(), c.clone(), d.clone()]);

        scheduler.add(a);
        scheduler.add(b);
        scheduler.add(c);
        scheduler.add(d);
        scheduler.add(e);

        let outcome = scheduler.wait_all(Some(Duration::from_secs(5)));
        assert!(outcome.success);
        let seq = order.lock().unwrap();
        let pos = |n: &str| seq.iter().position(|x| x == n).unwrap();
        assert!(pos("A") < pos("B"));
        assert!(pos("A") < pos("C"));
        assert!(pos("A") < pos("D"));
        assert!(pos("E") > pos("B"));
        assert!(pos("E") > pos("C"));
        assert!(pos("E") > pos("D"));
    }

    #[test]
    fn failure_is_reported_and_pool_drains() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let scheduler = Scheduler::new(2, Logger::new());
        let failing = Arc::new(RecordingTask {
            base: TaskBase::new("Fail", "fail.jpg", 0, false),
            order: order.clone(),
            should_fail: true,
        });
        scheduler.add(failing);
        let outcome = scheduler.wait_all(Some(Duration::from_secs(5)));
        assert!(!outcome.success);
        assert!(outcome.error_message.unwrap().contains("boom"));
    }

    #[test]
    fn gpu_tasks_never_run_concurrently() {
        use std::sync::atomic::{AtomicUsize, Ordering as O};

        struct GpuTask {
            base: TaskBase,
            concurrent: Arc<AtomicUsize>,
            max_seen: Arc<AtomicUsize>,
        }

        impl Task for GpuTask {
            fn base(&self) -> &TaskBase {
                &self.base
            }

            fn execute(&self, _logger: &Logger) -> Result<Artifact> {
                let now = self.concurrent.fetch_add(1, O::SeqCst) + 1;
                self.max_seen.fetch_max(now, O::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
                self.concurrent.fetch_sub(1, O::SeqCst);
                Ok(Artifact::Unit)
            }
        }

        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(4, Logger::new());

        for i in 0..4 {
            scheduler.add(Arc::new(GpuTask {
                base: TaskBase::new(format!("gpu{i}"), format!("gpu{i}.jpg"), i, true),
                concurrent: concurrent.clone(),
                max_seen: max_seen.clone(),
            }));
        }

        let outcome = scheduler.wait_all(Some(Duration::from_secs(5)));
        assert!(outcome.success);
        assert_eq!(max_seen.load(O::SeqCst), 1);
    }
}
