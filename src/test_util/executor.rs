use std::sync::Mutex;

use crate::requests::CallbackExecutor;

type Task = Box<dyn FnOnce() + Send>;

/// Runs submitted tasks immediately on the submitting thread. Only suitable
/// for tests: production executors defer to the guest-side callback queue.
pub struct InlineExecutor;

impl CallbackExecutor for InlineExecutor {
    fn submit(&self, task: Task) {
        task();
    }
}

/// Collects submitted tasks so a test can assert on the count and decide
/// when (or whether) to run them.
pub struct TrackingExecutor {
    tasks: Mutex<Vec<Task>>,
}

impl TrackingExecutor {
    pub fn new() -> TrackingExecutor {
        TrackingExecutor {
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.lock().expect("task lock poisoned").len()
    }

    /// Runs everything submitted so far, in submission order.
    pub fn run_all(&self) -> usize {
        let tasks: Vec<Task> = std::mem::take(&mut *self.tasks.lock().expect("task lock poisoned"));
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }
}

impl Default for TrackingExecutor {
    fn default() -> TrackingExecutor {
        TrackingExecutor::new()
    }
}

impl CallbackExecutor for TrackingExecutor {
    fn submit(&self, task: Task) {
        self.tasks.lock().expect("task lock poisoned").push(task);
    }
}
