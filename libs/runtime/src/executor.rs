//! Single-Worker Executor
//!
//! FIFO task queue drained by exactly one logical worker. At most one work
//! item executes at any instant; items run in submission order. Work items
//! are futures polled only by the worker: when an item suspends on external
//! I/O, its waker re-enqueues the continuation as a fresh queue entry, so
//! other items may interleave between suspension and resumption while the
//! serial-execution invariant holds.
//!
//! A panic inside a work item is caught, reported through the error
//! callback, and the worker moves on to the next item. Queue liveness after
//! user-code faults is intentional.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, error, trace};

use crate::error::{panic_message, ExecutorError, Result};

/// How `stop` treats work that is still queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Run remaining queued items (and their continuations) to completion
    Drain,
    /// Discard remaining queued items
    Immediate,
}

/// Executor lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Draining,
    Discarding,
    Stopped,
}

// Work item status values. Transitions happen under the shared state lock.
const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const NOTIFIED: u8 = 2;
const PARKED: u8 = 3;
const DONE: u8 = 4;

type ErrorHandler = Arc<dyn Fn(ExecutorError) + Send + Sync>;

/// One enqueued unit of work. The waker re-enqueues a parked item.
struct WorkItem {
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    status: AtomicU8,
    shared: Arc<Shared>,
}

impl Wake for WorkItem {
    fn wake(self: Arc<Self>) {
        let shared = Arc::clone(&self.shared);
        shared.requeue(self);
    }
}

impl Drop for WorkItem {
    fn drop(&mut self) {
        // A parked item whose waker was dropped can never resume; the drain
        // accounting must not wait for it.
        if *self.status.get_mut() == PARKED {
            let mut state = self.shared.state.lock();
            state.parked = state.parked.saturating_sub(1);
            drop(state);
            self.shared.work_available.notify_one();
        }
    }
}

struct State {
    queue: VecDeque<Arc<WorkItem>>,
    /// Items suspended on external I/O, awaiting their waker
    parked: usize,
    phase: Phase,
}

struct Shared {
    label: String,
    state: Mutex<State>,
    work_available: Notify,
    done: watch::Sender<bool>,
    on_error: Mutex<Option<ErrorHandler>>,
}

impl Shared {
    /// Called by a work item's waker. Re-enqueues the continuation, or
    /// drops it when the executor has passed the point of accepting work.
    fn requeue(&self, item: Arc<WorkItem>) {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Running | Phase::Draining => {
                match item.status.load(Ordering::Relaxed) {
                    RUNNING => {
                        // Woken mid-poll; the worker re-enqueues after the
                        // poll returns Pending.
                        item.status.store(NOTIFIED, Ordering::Relaxed);
                    }
                    PARKED => {
                        state.parked -= 1;
                        item.status.store(QUEUED, Ordering::Relaxed);
                        state.queue.push_back(item);
                        drop(state);
                        self.work_available.notify_one();
                    }
                    // Already queued, already notified, or finished.
                    _ => {}
                }
            }
            Phase::Discarding | Phase::Stopped => {
                if item.status.load(Ordering::Relaxed) == PARKED {
                    state.parked -= 1;
                }
                item.status.store(DONE, Ordering::Relaxed);
                drop(state);
                // Dropping the future cancels any attached task handle with
                // the distinguished `Stopped` error.
                let abandoned = item.future.lock().take();
                drop(abandoned);
                trace!(executor = %self.label, "dropped continuation for stopped executor");
                self.work_available.notify_one();
            }
        }
    }

    fn report_error(&self, err: ExecutorError) {
        error!(executor = %self.label, error = %err, "work item failed");
        let handler = self.on_error.lock().clone();
        if let Some(handler) = handler {
            handler(err);
        }
    }
}

/// Handle resolving once the executor worker has terminated
pub struct StopHandle {
    rx: watch::Receiver<bool>,
    _shared: Arc<Shared>,
}

impl StopHandle {
    /// Wait for the worker to reach its terminal state
    pub async fn wait(mut self) {
        // The sender lives in `_shared`, so this only errs after `true`.
        let _ = self.rx.wait_for(|done| *done).await;
    }
}

/// Awaitable result of a posted task
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
    label: String,
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("executor", &self.label)
            .finish()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without running: the executor stopped first.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ExecutorError::stopped(&self.label))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Awaitable suspension point that yields the queue and re-enters through it
///
/// Awaiting from inside a work item parks the item and re-enqueues its
/// continuation at the back of the queue, letting other items interleave.
/// Resolves with [`ExecutorError::Stopped`] if the executor has reached its
/// terminal state at the moment of suspension.
pub struct ContextSwitch {
    shared: Arc<Shared>,
    yielded: bool,
}

impl Future for ContextSwitch {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let terminal = {
            let state = self.shared.state.lock();
            matches!(state.phase, Phase::Discarding | Phase::Stopped)
        };
        if terminal {
            return Poll::Ready(Err(ExecutorError::stopped(&self.shared.label)));
        }
        if self.yielded {
            Poll::Ready(Ok(()))
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Single-worker FIFO executor
///
/// Cheap to clone; all clones share the same queue and worker.
#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Executor")
            .field("label", &self.shared.label)
            .field("queued", &state.queue.len())
            .field("parked", &state.parked)
            .field("phase", &state.phase)
            .finish()
    }
}

impl Executor {
    /// Create a new executor and start its worker
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let (done, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            label: label.clone(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                parked: 0,
                phase: Phase::Running,
            }),
            work_available: Notify::new(),
            done,
            on_error: Mutex::new(None),
        });
        debug!(executor = %label, "starting executor worker");
        tokio::spawn(Self::run_worker(Arc::clone(&shared)));
        Self { shared }
    }

    /// Executor label, used in errors and logs
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Install the callback invoked when a work item panics
    pub fn set_error_handler(&self, handler: impl Fn(ExecutorError) + Send + Sync + 'static) {
        *self.shared.on_error.lock() = Some(Arc::new(handler));
    }

    /// Enqueue an async work item. Fails once stop has been initiated.
    pub fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        self.enqueue(future.boxed())
    }

    /// Enqueue a closure for serial execution. Panics inside the closure
    /// are reported through the error callback; the queue keeps running.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        self.enqueue(
            async move {
                if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(f)) {
                    shared.report_error(ExecutorError::task(panic_message(payload)));
                }
            }
            .boxed(),
        )
    }

    /// Enqueue a closure and capture its result (or panic) into a handle
    pub fn post_task<T, F>(&self, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            async move {
                let result = std::panic::catch_unwind(AssertUnwindSafe(f))
                    .map_err(|payload| ExecutorError::task(panic_message(payload)));
                let _ = tx.send(result);
            }
            .boxed(),
        )?;
        Ok(TaskHandle {
            rx,
            label: self.shared.label.clone(),
        })
    }

    /// Enqueue an async work item and capture its output into a handle
    pub fn spawn_task<T>(
        &self,
        future: impl Future<Output = T> + Send + 'static,
    ) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            async move {
                let result = AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .map_err(|payload| ExecutorError::task(panic_message(payload)));
                let _ = tx.send(result);
            }
            .boxed(),
        )?;
        Ok(TaskHandle {
            rx,
            label: self.shared.label.clone(),
        })
    }

    /// Awaitable suspension point re-entering through this executor
    pub fn switch(&self) -> ContextSwitch {
        ContextSwitch {
            shared: Arc::clone(&self.shared),
            yielded: false,
        }
    }

    /// Stop the executor. New work is rejected immediately; the returned
    /// handle resolves once the worker has drained (`Drain`) or abandoned
    /// (`Immediate`) outstanding work. Idempotent: a second call awaits the
    /// same terminal outcome and never escalates `Drain` to `Immediate`.
    pub fn stop(&self, mode: StopMode) -> StopHandle {
        let abandoned = {
            let mut state = self.shared.state.lock();
            match state.phase {
                Phase::Running => {
                    state.phase = match mode {
                        StopMode::Drain => Phase::Draining,
                        StopMode::Immediate => Phase::Discarding,
                    };
                    debug!(executor = %self.shared.label, ?mode, "stop initiated");
                    if mode == StopMode::Immediate {
                        let drained: Vec<_> = state.queue.drain(..).collect();
                        for item in &drained {
                            item.status.store(DONE, Ordering::Relaxed);
                        }
                        Some(drained)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        // Dropped outside the lock: cancelling a task handle may run
        // arbitrary drop code.
        drop(abandoned);
        self.shared.work_available.notify_one();
        StopHandle {
            rx: self.shared.done.subscribe(),
            _shared: Arc::clone(&self.shared),
        }
    }

    /// True once stop has been initiated
    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().phase != Phase::Running
    }

    fn enqueue(&self, future: BoxFuture<'static, ()>) -> Result<()> {
        let item = {
            let mut state = self.shared.state.lock();
            if state.phase != Phase::Running {
                return Err(ExecutorError::stopped(&self.shared.label));
            }
            let item = Arc::new(WorkItem {
                future: Mutex::new(Some(future)),
                status: AtomicU8::new(QUEUED),
                shared: Arc::clone(&self.shared),
            });
            state.queue.push_back(Arc::clone(&item));
            item
        };
        drop(item);
        self.shared.work_available.notify_one();
        Ok(())
    }

    async fn run_worker(shared: Arc<Shared>) {
        loop {
            let next = {
                let mut state = shared.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    item.status.store(RUNNING, Ordering::Relaxed);
                    Some(item)
                } else {
                    let finished = match state.phase {
                        Phase::Running => false,
                        // Parked items may still wake and re-enqueue.
                        Phase::Draining => state.parked == 0,
                        Phase::Discarding => true,
                        Phase::Stopped => true,
                    };
                    if finished {
                        state.phase = Phase::Stopped;
                        drop(state);
                        let _ = shared.done.send(true);
                        debug!(executor = %shared.label, "executor worker terminated");
                        return;
                    }
                    None
                }
            };

            match next {
                Some(item) => Self::run_item(&shared, item),
                None => shared.work_available.notified().await,
            }
        }
    }

    /// Poll one work item once. Only ever called by the worker, which is
    /// what makes the at-most-one-running invariant hold.
    fn run_item(shared: &Arc<Shared>, item: Arc<WorkItem>) {
        let Some(mut future) = item.future.lock().take() else {
            return;
        };
        let waker = Waker::from(Arc::clone(&item));
        let mut cx = Context::from_waker(&waker);

        let poll = std::panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
        match poll {
            Ok(Poll::Ready(())) => {
                item.status.store(DONE, Ordering::Relaxed);
            }
            Ok(Poll::Pending) => {
                let mut state = shared.state.lock();
                *item.future.lock() = Some(future);
                match item.status.load(Ordering::Relaxed) {
                    NOTIFIED => {
                        // Woken during the poll: the continuation goes to
                        // the back of the queue as a fresh work item.
                        item.status.store(QUEUED, Ordering::Relaxed);
                        state.queue.push_back(Arc::clone(&item));
                        drop(state);
                        shared.work_available.notify_one();
                    }
                    _ => {
                        item.status.store(PARKED, Ordering::Relaxed);
                        state.parked += 1;
                    }
                }
            }
            Err(payload) => {
                item.status.store(DONE, Ordering::Relaxed);
                shared.report_error(ExecutorError::task(panic_message(payload)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_in_submission_order() {
        let executor = Executor::new("order");
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let order = Arc::clone(&order);
            executor.post(move || order.lock().push(i)).unwrap();
        }
        executor.stop(StopMode::Drain).wait().await;

        let seen = order.lock().clone();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_serial_execution_invariant() {
        let executor = Executor::new("serial");
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));

        let mut enqueuers = Vec::new();
        for _ in 0..4 {
            let executor = executor.clone();
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            let total = Arc::clone(&total);
            enqueuers.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let running = Arc::clone(&running);
                    let max_seen = Arc::clone(&max_seen);
                    let total = Arc::clone(&total);
                    executor
                        .post(move || {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            std::thread::yield_now();
                            running.fetch_sub(1, Ordering::SeqCst);
                            total.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                }
            }));
        }
        for task in enqueuers {
            task.await.unwrap();
        }
        executor.stop(StopMode::Drain).wait().await;

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(total.load(Ordering::SeqCst), 200);
    }

    #[tokio::test]
    async fn test_post_task_captures_result() {
        let executor = Executor::new("task");
        let value = executor.post_task(|| 2 + 3).unwrap().await.unwrap();
        assert_eq!(value, 5);
        executor.stop(StopMode::Drain).wait().await;
    }

    #[tokio::test]
    async fn test_post_task_captures_panic() {
        let executor = Executor::new("panic-task");
        let err = executor
            .post_task(|| panic!("boom"))
            .unwrap()
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Task { .. }));
        assert!(err.to_string().contains("boom"));

        // The queue keeps processing after a fault.
        let value = executor.post_task(|| 7).unwrap().await.unwrap();
        assert_eq!(value, 7);
        executor.stop(StopMode::Drain).wait().await;
    }

    #[tokio::test]
    async fn test_panic_reports_through_error_handler() {
        let executor = Executor::new("on-error");
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        executor.set_error_handler(move |err| sink.lock().push(err.to_string()));

        executor.post(|| panic!("kaboom")).unwrap();
        let after = executor.post_task(|| 1).unwrap().await.unwrap();
        assert_eq!(after, 1);
        assert_eq!(reported.lock().len(), 1);
        assert!(reported.lock()[0].contains("kaboom"));
        executor.stop(StopMode::Drain).wait().await;
    }

    #[tokio::test]
    async fn test_enqueue_after_stop_fails() {
        let executor = Executor::new("stopped");
        executor.stop(StopMode::Drain).wait().await;

        let err = executor.post(|| {}).unwrap_err();
        assert!(err.is_stopped());
        let err = executor.post_task(|| 1).unwrap_err();
        assert!(err.is_stopped());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_immediate_discards_queued_work() {
        let executor = Executor::new("immediate");
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let (busy_tx, busy_rx) = oneshot::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));

        // First item holds the worker synchronously until released, so the
        // rest stays queued (a suspended item would park instead).
        executor
            .post(move || {
                let _ = busy_tx.send(());
                let _ = gate_rx.recv();
            })
            .unwrap();
        busy_rx.await.unwrap();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let ran = Arc::clone(&ran);
                executor
                    .post_task(move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap()
            })
            .collect();

        let stop = executor.stop(StopMode::Immediate);
        let _ = gate_tx.send(());
        stop.wait().await;

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        for handle in handles {
            assert!(handle.await.unwrap_err().is_stopped());
        }
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let executor = Executor::new("twice");
        executor.post(|| {}).unwrap();
        let first = executor.stop(StopMode::Drain);
        let second = executor.stop(StopMode::Drain);
        first.wait().await;
        second.wait().await;
        assert!(executor.is_stopped());
    }

    #[tokio::test]
    async fn test_reentrant_enqueue_from_work_item() {
        let executor = Executor::new("reentrant");
        let inner_ran = Arc::new(AtomicUsize::new(0));

        let exec = executor.clone();
        let flag = Arc::clone(&inner_ran);
        executor
            .post(move || {
                exec.post(move || {
                    flag.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            })
            .unwrap();

        executor.stop(StopMode::Drain).wait().await;
        assert_eq!(inner_ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_switch_interleaves_queued_items() {
        let executor = Executor::new("switch");
        let order = Arc::new(Mutex::new(Vec::new()));

        let switch = executor.switch();
        let trace = Arc::clone(&order);
        executor
            .spawn(async move {
                trace.lock().push("first:before");
                switch.await.unwrap();
                trace.lock().push("first:after");
            })
            .unwrap();
        let trace = Arc::clone(&order);
        executor
            .post(move || trace.lock().push("second"))
            .unwrap();

        executor.stop(StopMode::Drain).wait().await;
        let seen = order.lock().clone();
        assert_eq!(seen, vec!["first:before", "second", "first:after"]);
    }

    #[tokio::test]
    async fn test_suspended_item_resumes_through_queue() {
        let executor = Executor::new("resume");
        let (tx, rx) = oneshot::channel::<u32>();

        let handle = executor
            .spawn_task(async move { rx.await.unwrap() * 2 })
            .unwrap();
        // The worker parks the item; other work still flows.
        let filler = executor.post_task(|| "filler").unwrap().await.unwrap();
        assert_eq!(filler, "filler");

        tx.send(21).unwrap();
        assert_eq!(handle.await.unwrap(), 42);
        executor.stop(StopMode::Drain).wait().await;
    }

    #[tokio::test]
    async fn test_drain_waits_for_suspended_item() {
        let executor = Executor::new("drain-parked");
        let (tx, rx) = oneshot::channel::<()>();
        let finished = Arc::new(AtomicUsize::new(0));

        let flag = Arc::clone(&finished);
        executor
            .spawn(async move {
                let _ = rx.await;
                flag.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // Give the worker a chance to park the item before stopping.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stop = executor.stop(StopMode::Drain);
        tx.send(()).unwrap();
        stop.wait().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_switch_fails_after_immediate_stop() {
        let executor = Executor::new("switch-stopped");
        executor.stop(StopMode::Immediate).wait().await;
        let err = executor.switch().await.unwrap_err();
        assert!(err.is_stopped());
    }
}
