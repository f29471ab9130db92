//! Thread Dispatcher: named channels isolating scan I/O, the debug loop,
//! freeze polling, and process-list refresh so none blocks another.
//! Grounded on `src/vertex/thread/threaddispatcher.cc`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{VertexError, VertexResult};

/// A unit of work: move-only, runs once, optionally reports completion
/// through the future returned by `dispatch`.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

const CALLBACK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct Spsc {
    sender: Sender<Task>,
    handle: Option<JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
}

impl Spsc {
    fn spawn(name: &'static str) -> Self {
        let (sender, receiver): (Sender<Task>, Receiver<Task>) = bounded(4096);
        let pending = Arc::new(AtomicUsize::new(0));
        let pending_clone = pending.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for task in receiver.iter() {
                    task();
                    pending_clone.fetch_sub(1, Ordering::AcqRel);
                }
            })
            .expect("failed to spawn dispatcher thread");
        Self {
            sender,
            handle: Some(handle),
            pending: pending.clone(),
        }
    }

    fn enqueue(&self, task: Task) -> VertexResult<()> {
        self.try_enqueue(task)
            .map_err(|_| VertexError::ResourceBusy("channel closed".into()))
    }

    /// Like `enqueue`, but hands the task back on failure so callers can
    /// retry it on a different worker instead of losing it.
    fn try_enqueue(&self, task: Task) -> Result<(), Task> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.sender.send(task).map_err(|err| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            err.into_inner()
        })
    }

    fn pending_tasks(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn shutdown(&mut self) {
        // Dropping the sender side lets the worker's `for task in receiver.iter()`
        // drain naturally and exit; join waits for in-flight work.
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One worker of the scanner's N-way pool, addressed by explicit index so
/// callers can bind per-worker state (like a result store) to one drainer
/// thread.
struct PoolWorker {
    inner: Spsc,
}

/// Named channels available to callers. `Debugger`, `Freeze`, and
/// `ProcessList` are always single dedicated SPSC threads (even in
/// single-threaded mode, when `debugger_independent` is set); `Scanner` is
/// an N-way pool in multi-threaded mode, collapsed to 1 worker otherwise.
pub struct ThreadDispatcher {
    single_threaded: AtomicBool,
    debugger_independent: AtomicBool,
    scanner_pool: Mutex<Vec<PoolWorker>>,
    debugger: Mutex<Option<Spsc>>,
    freeze: Mutex<Option<Spsc>>,
    process_list: Mutex<Option<Spsc>>,
    /// Single-threaded mode's unified MPSC queue (all channels except an
    /// optional debugger-independent dedicated thread collapse onto this).
    shared: Mutex<Option<Spsc>>,
}

impl ThreadDispatcher {
    pub fn new() -> Self {
        Self {
            single_threaded: AtomicBool::new(false),
            debugger_independent: AtomicBool::new(false),
            scanner_pool: Mutex::new(Vec::new()),
            debugger: Mutex::new(None),
            freeze: Mutex::new(None),
            process_list: Mutex::new(None),
            shared: Mutex::new(None),
        }
    }

    pub fn is_single_threaded(&self) -> bool {
        self.single_threaded.load(Ordering::Acquire)
    }

    /// Switches between single-threaded and multi-threaded mode and
    /// (re)creates the worker pool. `worker_count` is clamped to 1 in
    /// single-threaded mode. Takes `&self` (every field it touches is
    /// already behind a `Mutex`/`AtomicBool`) so a single `Arc<ThreadDispatcher>`
    /// can be shared between the facade and the memory scanner.
    pub fn configure(&self, single_threaded: bool, worker_count: usize, debugger_independent: bool) {
        self.destroy_worker_pool();
        self.destroy_dedicated_threads();
        if let Some(mut shared) = self.shared.lock().unwrap().take() {
            shared.shutdown();
        }

        self.single_threaded.store(single_threaded, Ordering::Release);
        self.debugger_independent.store(debugger_independent, Ordering::Release);

        let effective_workers = if single_threaded { 1 } else { worker_count.max(1) };
        self.create_worker_pool(effective_workers);

        if single_threaded {
            *self.shared.lock().unwrap() = Some(Spsc::spawn("vertex-shared"));
            if debugger_independent {
                *self.debugger.lock().unwrap() = Some(Spsc::spawn("vertex-debugger"));
            }
        } else {
            self.create_dedicated_threads();
        }
    }

    fn create_worker_pool(&self, count: usize) {
        let mut pool = self.scanner_pool.lock().unwrap();
        pool.clear();
        for i in 0..count {
            pool.push(PoolWorker {
                inner: Spsc::spawn_indexed(i),
            });
        }
    }

    fn destroy_worker_pool(&self) {
        let mut pool = self.scanner_pool.lock().unwrap();
        for worker in pool.iter_mut() {
            worker.inner.shutdown();
        }
        pool.clear();
    }

    fn create_dedicated_threads(&self) {
        *self.debugger.lock().unwrap() = Some(Spsc::spawn("vertex-debugger"));
        *self.freeze.lock().unwrap() = Some(Spsc::spawn("vertex-freeze"));
        *self.process_list.lock().unwrap() = Some(Spsc::spawn("vertex-process-list"));
    }

    fn destroy_dedicated_threads(&self) {
        if let Some(mut s) = self.debugger.lock().unwrap().take() {
            s.shutdown();
        }
        if let Some(mut s) = self.freeze.lock().unwrap().take() {
            s.shutdown();
        }
        if let Some(mut s) = self.process_list.lock().unwrap().take() {
            s.shutdown();
        }
    }

    /// Enqueues `task` on worker `preferred_index` of the scanner pool,
    /// falling back to any other running worker if that one is gone
    /// (mirrors `enqueue_on_worker`'s resilience in the original).
    pub fn dispatch_scanner(&self, preferred_index: usize, task: Task) -> VertexResult<()> {
        if self.is_single_threaded() {
            return self.dispatch_to_shared(task);
        }
        let pool = self.scanner_pool.lock().unwrap();
        if pool.is_empty() {
            return Err(VertexError::ResourceBusy("scanner pool not configured".into()));
        }
        let index = preferred_index % pool.len();
        let mut remaining = match pool[index].inner.try_enqueue(task) {
            Ok(()) => return Ok(()),
            Err(task) => task,
        };
        for (i, worker) in pool.iter().enumerate() {
            if i == index {
                continue;
            }
            remaining = match worker.inner.try_enqueue(remaining) {
                Ok(()) => return Ok(()),
                Err(task) => task,
            };
        }
        let _ = remaining;
        Err(VertexError::ResourceBusy("no scanner worker available".into()))
    }

    pub fn dispatch_debugger(&self, task: Task) -> VertexResult<()> {
        if self.is_single_threaded() && !self.debugger_independent.load(Ordering::Acquire) {
            return self.dispatch_to_shared(task);
        }
        let guard = self.debugger.lock().unwrap();
        guard
            .as_ref()
            .ok_or_else(|| VertexError::ResourceBusy("debugger channel not configured".into()))
            .and_then(|s| s.enqueue(task))
    }

    pub fn dispatch_freeze(&self, task: Task) -> VertexResult<()> {
        if self.is_single_threaded() {
            return self.dispatch_to_shared(task);
        }
        let guard = self.freeze.lock().unwrap();
        guard
            .as_ref()
            .ok_or_else(|| VertexError::ResourceBusy("freeze channel not configured".into()))
            .and_then(|s| s.enqueue(task))
    }

    pub fn dispatch_process_list(&self, task: Task) -> VertexResult<()> {
        if self.is_single_threaded() {
            return self.dispatch_to_shared(task);
        }
        let guard = self.process_list.lock().unwrap();
        guard
            .as_ref()
            .ok_or_else(|| VertexError::ResourceBusy("process list channel not configured".into()))
            .and_then(|s| s.enqueue(task))
    }

    fn dispatch_to_shared(&self, task: Task) -> VertexResult<()> {
        let guard = self.shared.lock().unwrap();
        guard
            .as_ref()
            .ok_or_else(|| VertexError::ResourceBusy("dispatcher not configured".into()))
            .and_then(|s| s.enqueue(task))
    }

    pub fn scanner_worker_count(&self) -> usize {
        self.scanner_pool.lock().unwrap().len()
    }

    pub fn pending_scanner_tasks(&self) -> usize {
        self.scanner_pool
            .lock()
            .unwrap()
            .iter()
            .map(|w| w.inner.pending_tasks())
            .sum()
    }

    pub fn is_channel_busy_debugger(&self) -> bool {
        self.debugger
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.pending_tasks() > 0)
            .unwrap_or(false)
    }

    /// Drains in-flight callbacks with a bounded timeout, then tears down
    /// every worker thread. Idempotent.
    pub fn stop(&self) {
        let deadline = std::time::Instant::now() + CALLBACK_DRAIN_TIMEOUT;
        while self.pending_scanner_tasks() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        self.destroy_worker_pool();
        self.destroy_dedicated_threads();
        if let Some(mut shared) = self.shared.lock().unwrap().take() {
            shared.shutdown();
        }
    }
}

impl Default for ThreadDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Spsc {
    fn spawn_indexed(index: usize) -> Self {
        Self::spawn_named(format!("vertex-scanner-{index}"))
    }

    fn spawn_named(name: String) -> Self {
        let (sender, receiver): (Sender<Task>, Receiver<Task>) = bounded(4096);
        let pending = Arc::new(AtomicUsize::new(0));
        let pending_clone = pending.clone();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                for task in receiver.iter() {
                    task();
                    pending_clone.fetch_sub(1, Ordering::AcqRel);
                }
            })
            .expect("failed to spawn dispatcher thread");
        Self {
            sender,
            handle: Some(handle),
            pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn multi_threaded_pool_runs_tasks_on_distinct_workers() {
        let dispatcher = ThreadDispatcher::new();
        dispatcher.configure(false, 4, false);
        assert_eq!(dispatcher.scanner_worker_count(), 4);

        let counter = Arc::new(AtomicU32::new(0));
        for i in 0..4 {
            let counter = counter.clone();
            dispatcher
                .dispatch_scanner(i, Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 4 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        dispatcher.stop();
    }

    #[test]
    fn single_threaded_mode_collapses_onto_one_queue() {
        let dispatcher = ThreadDispatcher::new();
        dispatcher.configure(true, 8, false);
        assert_eq!(dispatcher.scanner_worker_count(), 1);
        assert!(dispatcher.is_single_threaded());
        dispatcher.stop();
    }

    #[test]
    fn debugger_independent_thread_exists_even_single_threaded() {
        let dispatcher = ThreadDispatcher::new();
        dispatcher.configure(true, 1, true);

        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();
        dispatcher
            .dispatch_debugger(Box::new(move || flag_clone.store(true, Ordering::SeqCst)))
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while !flag.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(flag.load(Ordering::SeqCst));
        dispatcher.stop();
    }
}
