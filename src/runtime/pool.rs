//! Shared FIFO task queue and the fixed-size pool of worker threads that
//! drains it.

use crossbeam_channel::{Receiver, SendError, Sender};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Producer side of the task queue.
///
/// Unbounded by default. With a capacity, `push` blocks while the queue is
/// full instead of dropping work.
#[derive(Debug)]
pub struct TaskQueue<T> {
    sender: Sender<T>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> TaskQueue<T> {
    /// Create a queue; `None` means unbounded.
    pub fn new(capacity: Option<usize>) -> (Self, Receiver<T>) {
        let (sender, receiver) = match capacity {
            Some(cap) => crossbeam_channel::bounded(cap),
            None => crossbeam_channel::unbounded(),
        };
        (Self { sender }, receiver)
    }

    /// Append a task at the tail, waiting for room if the queue is bounded.
    ///
    /// Fails only once every consumer is gone.
    pub fn push(&self, task: T) -> Result<(), SendError<T>> {
        self.sender.send(task)
    }

    /// Number of tasks waiting to be taken.
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

/// Fixed set of threads, each looping: take a task, run it, repeat.
///
/// A task that returns an error or panics is logged; the worker carries on.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop: Option<Sender<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers taking tasks from `tasks` and running them
    /// through `run`.
    pub fn spawn<T, F>(size: usize, tasks: Receiver<T>, run: F) -> io::Result<Self>
    where
        T: Send + 'static,
        F: Fn(T) -> io::Result<()> + Send + Sync + 'static,
    {
        let run = Arc::new(run);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let mut handles = Vec::with_capacity(size);

        for worker_id in 0..size {
            let tasks = tasks.clone();
            let stop = stop_rx.clone();
            let run = Arc::clone(&run);

            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, tasks, stop, run.as_ref()))?;

            handles.push(handle);
        }

        info!(workers = size, "Worker pool started");

        Ok(Self {
            handles,
            stop: Some(stop_tx),
        })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop taking new tasks and wait for every worker to finish the task
    /// it is currently running.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        // Dropping the only sender disconnects the stop channel.
        self.stop.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn worker_loop<T, F>(worker_id: usize, tasks: Receiver<T>, stop: Receiver<()>, run: &F)
where
    F: Fn(T) -> io::Result<()>,
{
    debug!(worker = worker_id, "Worker started");

    loop {
        let task = crossbeam_channel::select! {
            recv(tasks) -> task => task.ok(),
            recv(stop) -> _ => None,
        };
        let Some(task) = task else {
            break;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| run(task))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(worker = worker_id, error = %e, "Task failed"),
            Err(payload) => error!(
                worker = worker_id,
                panic = panic_message(payload.as_ref()),
                "Task panicked"
            ),
        }
    }

    debug!(worker = worker_id, "Worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
