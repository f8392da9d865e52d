//! The variable async task pool.
//!
//! Cache admission work is issued from the pull (reader) path but must not
//! race the writer path, so each task carries a `done` closure that the
//! pool runs on one of its fixed worker threads; the closure itself
//! acquires the owning shard's write lock, which serializes admission
//! against updates. The shard's update path waits for the in-flight
//! counter to drain before touching any variable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::info;

/// Spin-then-yield wait for every submitted task to finish.
pub fn wait_tasks(counter: &AtomicUsize) {
    let mut tests = 0u32;
    while counter.load(Ordering::Acquire) != 0 {
        if tests < 128 {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
        tests += 1;
    }
}

/// One asynchronous admission task.
///
/// Created on the request path with the variable's id as `thread_id` so all
/// tasks of one variable land on the same worker, keeping their order.
pub struct VariableAsyncTask {
    thread_id: usize,
    counter: Arc<AtomicUsize>,
    done: Option<Box<dyn FnOnce() + Send>>,
}

impl VariableAsyncTask {
    pub fn new(thread_id: usize, counter: Arc<AtomicUsize>) -> Self {
        Self {
            thread_id,
            counter,
            done: None,
        }
    }

    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    pub fn has_work(&self) -> bool {
        self.done.is_some()
    }

    /// Attach the completion closure and count it in-flight.
    pub fn set_done(&mut self, done: Box<dyn FnOnce() + Send>) {
        debug_assert!(self.done.is_none());
        self.counter.fetch_add(1, Ordering::Relaxed);
        self.done = Some(done);
    }

    fn run(mut self) {
        if let Some(done) = self.done.take() {
            done();
            self.counter.fetch_sub(1, Ordering::Release);
        }
    }
}

impl Drop for VariableAsyncTask {
    fn drop(&mut self) {
        // a task dropped without running still has to release its count
        if self.done.take().is_some() {
            self.counter.fetch_sub(1, Ordering::Release);
        }
    }
}

#[derive(Default)]
struct BatchState {
    tasks: Vec<VariableAsyncTask>,
    num_tasks: usize,
    batch_num_tasks: usize,
}

/// Fixed set of worker threads, one channel each; tasks are dispatched by
/// `thread_id % N`. Submissions are buffered until the startup-calibrated
/// batch size is reached, then flushed together.
pub struct VariableAsyncTaskPool {
    senders: Vec<Sender<VariableAsyncTask>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
    state: Mutex<BatchState>,
}

impl VariableAsyncTaskPool {
    pub fn new(thread_num: usize) -> Self {
        let thread_num = thread_num.max(1);
        let mut senders = Vec::with_capacity(thread_num);
        let mut workers = Vec::with_capacity(thread_num);
        for i in 0..thread_num {
            let (sender, receiver): (Sender<VariableAsyncTask>, Receiver<VariableAsyncTask>) =
                unbounded();
            senders.push(sender);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("variable-async-{i}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            task.run();
                        }
                    })
                    .expect("failed to spawn async task worker"),
            );
        }
        Self {
            senders,
            workers: Mutex::new(workers),
            state: Mutex::new(BatchState::default()),
        }
    }

    /// Buffer a task; flush the whole batch once it is full. Before
    /// calibration (`batch_num_tasks == 0` means "flush at one") every
    /// submission dispatches immediately.
    pub fn submit(&self, task: VariableAsyncTask) {
        let mut state = self.state.lock();
        state.num_tasks += 1;
        state.tasks.push(task);
        if state.tasks.len() >= state.batch_num_tasks.max(1) {
            let tasks = std::mem::take(&mut state.tasks);
            drop(state);
            for task in tasks {
                let worker = task.thread_id() % self.senders.len();
                // a closed channel only happens at shutdown; the task's Drop
                // still releases its in-flight count
                let _ = self.senders[worker].send(task);
            }
        }
    }

    /// Freeze the batch size at the number of tasks seen so far. Called once
    /// after the first full batch of pulls.
    pub fn initialize_batch_task(&self) {
        let mut state = self.state.lock();
        if state.batch_num_tasks == 0 {
            info!(batch_num_tasks = state.num_tasks, "set batch num tasks");
            state.batch_num_tasks = state.num_tasks;
        }
    }
}

impl Drop for VariableAsyncTaskPool {
    fn drop(&mut self) {
        // flush anything still buffered, then let workers drain and exit
        {
            let mut state = self.state.lock();
            let tasks = std::mem::take(&mut state.tasks);
            for task in tasks {
                let worker = task.thread_id() % self.senders.len();
                let _ = self.senders[worker].send(task);
            }
        }
        self.senders.clear();
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_run_and_drain() {
        let pool = VariableAsyncTaskPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let hits = Arc::new(AtomicUsize::new(0));

        for i in 0..16 {
            let mut task = VariableAsyncTask::new(i, Arc::clone(&counter));
            let hits = Arc::clone(&hits);
            task.set_done(Box::new(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }));
            pool.submit(task);
        }
        wait_tasks(&counter);
        assert_eq!(hits.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn calibrated_batches_still_flush_on_fill() {
        let pool = VariableAsyncTaskPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let hits = Arc::new(AtomicUsize::new(0));

        // calibrate a batch size of 3
        for i in 0..3 {
            let mut task = VariableAsyncTask::new(i, Arc::clone(&counter));
            let hits = Arc::clone(&hits);
            task.set_done(Box::new(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }));
            pool.submit(task);
        }
        wait_tasks(&counter);
        pool.initialize_batch_task();

        for i in 0..6 {
            let mut task = VariableAsyncTask::new(i, Arc::clone(&counter));
            let hits = Arc::clone(&hits);
            task.set_done(Box::new(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }));
            pool.submit(task);
        }
        wait_tasks(&counter);
        assert_eq!(hits.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn tasks_without_work_are_not_counted() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = VariableAsyncTask::new(0, Arc::clone(&counter));
        assert!(!task.has_work());
        drop(task);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
