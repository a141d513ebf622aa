//! Named FIFO task queues, one worker per queue.
//!
//! Each queue is strictly FIFO modulo the splice rules applied to a
//! handler result: on `Success` the consumed task is replaced by
//! `head_tasks ++ after_tasks` at its position (head tasks first), with
//! `tail_tasks` appended; on `Fail` the task stays at the head and the
//! worker retries after a delay; on `Repeat` the task stays and the worker
//! re-runs it after a short poll interval. Workers across queues run in
//! parallel; there is no cross-queue ordering.

#![forbid(unsafe_code)]

pub mod combine;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bosun_core::{HookMetadata, Task};
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use combine::combine_binding_context;

/// Default delay before re-running a failed task.
pub const DELAY_ON_FAILED_TASK: Duration = Duration::from_secs(5);
/// Poll interval for tasks that return `Repeat` (barrier tasks).
pub const DELAY_ON_REPEAT: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Success,
    Fail,
    Repeat,
}

/// Outcome of one handler invocation, with tasks to splice into the queue.
pub struct TaskResult {
    pub status: TaskStatus,
    pub head_tasks: Vec<Task>,
    pub after_tasks: Vec<Task>,
    pub tail_tasks: Vec<Task>,
    /// Overrides the default delay before the worker continues.
    pub delay_before_next: Option<Duration>,
    /// Runs after queue mutations, before the worker loops.
    pub after_handle: Option<Box<dyn FnOnce() + Send>>,
}

impl TaskResult {
    pub fn new(status: TaskStatus) -> Self {
        TaskResult {
            status,
            head_tasks: Vec::new(),
            after_tasks: Vec::new(),
            tail_tasks: Vec::new(),
            delay_before_next: None,
            after_handle: None,
        }
    }

    pub fn success() -> Self {
        TaskResult::new(TaskStatus::Success)
    }

    pub fn fail() -> Self {
        TaskResult::new(TaskStatus::Fail)
    }

    pub fn repeat() -> Self {
        TaskResult::new(TaskStatus::Repeat)
    }
}

impl std::fmt::Debug for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskResult")
            .field("status", &self.status)
            .field("head_tasks", &self.head_tasks.len())
            .field("after_tasks", &self.after_tasks.len())
            .field("tail_tasks", &self.tail_tasks.len())
            .finish()
    }
}

/// Task handler shared by all queues of a set.
pub type TaskHandlerFn = Arc<dyn Fn(Task) -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// Timing knobs; tests shrink these to keep barrier polling fast.
#[derive(Debug, Clone, Copy)]
pub struct QueueDelays {
    pub on_failed_task: Duration,
    pub on_repeat: Duration,
}

impl Default for QueueDelays {
    fn default() -> Self {
        QueueDelays { on_failed_task: DELAY_ON_FAILED_TASK, on_repeat: DELAY_ON_REPEAT }
    }
}

struct QueueState {
    name: String,
    tasks: Mutex<VecDeque<Task>>,
    notify: Notify,
    started: AtomicBool,
    stop: CancellationToken,
    delays: QueueDelays,
    handler: TaskHandlerFn,
}

/// A named FIFO queue with a single worker.
#[derive(Clone)]
pub struct TaskQueue {
    state: Arc<QueueState>,
}

impl TaskQueue {
    fn new(name: &str, handler: TaskHandlerFn, stop: CancellationToken, delays: QueueDelays) -> Self {
        TaskQueue {
            state: Arc::new(QueueState {
                name: name.to_string(),
                tasks: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                started: AtomicBool::new(false),
                stop,
                delays,
                handler,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn add_last(&self, task: Task) {
        self.state.tasks.lock().unwrap().push_back(task);
        self.state.notify.notify_one();
    }

    pub fn add_first(&self, task: Task) {
        self.state.tasks.lock().unwrap().push_front(task);
        self.state.notify.notify_one();
    }

    pub fn length(&self) -> usize {
        self.state.tasks.lock().unwrap().len()
    }

    /// Read-only visit over a snapshot of the queue in order.
    pub fn iterate(&self, mut visitor: impl FnMut(&Task)) {
        let snapshot: Vec<Task> = self.state.tasks.lock().unwrap().iter().cloned().collect();
        for t in snapshot.iter() {
            visitor(t);
        }
    }

    /// In-place removal of tasks for which the predicate returns false.
    pub fn filter(&self, mut keep: impl FnMut(&Task) -> bool) {
        self.state.tasks.lock().unwrap().retain(|t| keep(t));
    }

    /// Replace the stored metadata of a queued task (combined contexts must
    /// survive a later Fail/Repeat retry).
    pub fn update_task_metadata(&self, id: u64, metadata: HookMetadata) {
        let mut q = self.state.tasks.lock().unwrap();
        if let Some(t) = q.iter_mut().find(|t| t.id() == id) {
            t.update_metadata(metadata);
        }
    }

    fn peek_head(&self) -> Option<Task> {
        self.state.tasks.lock().unwrap().front().cloned()
    }

    fn record_failure(&self, id: u64) {
        let mut q = self.state.tasks.lock().unwrap();
        if let Some(t) = q.iter_mut().find(|t| t.id() == id) {
            t.increment_failure_count();
        }
    }

    /// Splice rules for a successful task: the consumed task is replaced at
    /// its position by `after_tasks`, `head_tasks` go to the very front,
    /// `tail_tasks` to the back.
    fn splice_success(&self, id: u64, head: Vec<Task>, after: Vec<Task>, tail: Vec<Task>) {
        let mut q = self.state.tasks.lock().unwrap();
        if let Some(pos) = q.iter().position(|t| t.id() == id) {
            q.remove(pos);
            for (i, t) in after.into_iter().enumerate() {
                q.insert(pos + i, t);
            }
        } else {
            // Task vanished via filter; after-tasks still run next.
            for (i, t) in after.into_iter().enumerate() {
                q.insert(i, t);
            }
        }
        for t in head.into_iter().rev() {
            q.push_front(t);
        }
        for t in tail {
            q.push_back(t);
        }
        if !q.is_empty() {
            self.state.notify.notify_one();
        }
    }

    /// Spawn the worker. Idempotent.
    pub fn start(&self) {
        if self.state.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            worker_loop(state).await;
        });
    }

    fn shutdown(&self) {
        self.state.stop.cancel();
    }
}

async fn worker_loop(state: Arc<QueueState>) {
    info!(queue = %state.name, "queue worker started");
    let queue = TaskQueue { state: Arc::clone(&state) };
    loop {
        let task = loop {
            if state.stop.is_cancelled() {
                info!(queue = %state.name, "queue worker stopped");
                return;
            }
            match queue.peek_head() {
                Some(t) => break t,
                None => {
                    tokio::select! {
                        _ = state.notify.notified() => {}
                        _ = state.stop.cancelled() => {}
                    }
                }
            }
        };

        debug!(queue = %state.name, task = %task.describe(), id = task.id(), "handle task");
        let res = (state.handler)(task.clone()).await;

        match res.status {
            TaskStatus::Success => {
                queue.splice_success(task.id(), res.head_tasks, res.after_tasks, res.tail_tasks);
                if let Some(f) = res.after_handle {
                    f();
                }
                if let Some(d) = res.delay_before_next {
                    sleep_or_stop(&state, d).await;
                }
            }
            TaskStatus::Fail => {
                queue.record_failure(task.id());
                let d = res.delay_before_next.unwrap_or(state.delays.on_failed_task);
                debug!(queue = %state.name, task = %task.describe(), delay = ?d, "task failed; retry after delay");
                sleep_or_stop(&state, d).await;
            }
            TaskStatus::Repeat => {
                let d = res.delay_before_next.unwrap_or(state.delays.on_repeat);
                sleep_or_stop(&state, d).await;
            }
        }
    }
}

async fn sleep_or_stop(state: &QueueState, d: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(d) => {}
        _ = state.stop.cancelled() => {}
    }
}

/// The set of named queues. Queues may be created after start; each queue
/// gets a child cancellation token so `remove` stops only its worker.
pub struct TaskQueueSet {
    queues: Mutex<HashMap<String, TaskQueue>>,
    main_name: String,
    stop: CancellationToken,
    delays: QueueDelays,
}

impl TaskQueueSet {
    pub fn new(stop: CancellationToken) -> Self {
        TaskQueueSet {
            queues: Mutex::new(HashMap::new()),
            main_name: "main".to_string(),
            stop,
            delays: QueueDelays::default(),
        }
    }

    pub fn with_delays(mut self, delays: QueueDelays) -> Self {
        self.delays = delays;
        self
    }

    pub fn main_name(&self) -> &str {
        &self.main_name
    }

    /// Create a queue if missing; returns it either way. The queue is not
    /// started here.
    pub fn new_named_queue(&self, name: &str, handler: TaskHandlerFn) -> TaskQueue {
        let mut queues = self.queues.lock().unwrap();
        if let Some(q) = queues.get(name) {
            return q.clone();
        }
        let q = TaskQueue::new(name, handler, self.stop.child_token(), self.delays);
        queues.insert(name.to_string(), q.clone());
        q
    }

    pub fn get(&self, name: &str) -> Option<TaskQueue> {
        self.queues.lock().unwrap().get(name).cloned()
    }

    pub fn get_main(&self) -> Option<TaskQueue> {
        self.get(&self.main_name)
    }

    /// Destroy a whole queue: stop its worker after the current task and
    /// drop pending tasks.
    pub fn remove(&self, name: &str) {
        let q = self.queues.lock().unwrap().remove(name);
        if let Some(q) = q {
            q.shutdown();
            info!(queue = name, "queue removed");
        }
    }

    /// Visit every queue (for the queue-length gauge).
    pub fn iterate(&self, mut visitor: impl FnMut(&TaskQueue)) {
        let snapshot: Vec<TaskQueue> = self.queues.lock().unwrap().values().cloned().collect();
        for q in snapshot.iter() {
            visitor(q);
        }
    }
}
