// Task graph worker pool
//
// N OS threads share one task list. Tasks can be locked to specific
// threads and can name earlier task indices as dependencies; a task
// only becomes runnable once none of its dependencies remain in the
// list. Workers block on a condition variable but also wake on a
// short interval so progress can never stall on a missed notify.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::Result;

/// Bound on how long a worker sleeps before re-scanning for work.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Per-thread private state. Built on the caller side, carried into
/// the worker thread, and initialized/torn down there.
///
/// `thread_begin` failing must not skip `thread_end`; a worker whose
/// begin failed keeps draining tasks (which are expected to fail soft
/// against the half-built resource) so shutdown cannot deadlock.
pub(crate) trait ThreadItem: Send + 'static {
    fn thread_begin(&mut self, _thread_index: usize) -> Result<()> {
        Ok(())
    }
    fn thread_end(&mut self) {}
}

impl ThreadItem for () {}

type TaskFn<R> = Box<dyn FnOnce(&mut R) + Send>;

struct TaskEntry<R> {
    index: u64,
    dependencies: Vec<u64>,
    thread_locks: Vec<usize>,
    running: bool,
    func: Option<TaskFn<R>>,
}

struct SharedState<R> {
    task_list: Mutex<VecDeque<TaskEntry<R>>>,
    wakeup_mutex: Mutex<()>,
    wakeup: Condvar,
    should_exit: AtomicBool,
}

impl<R> SharedState<R> {
    /// Scan the list in order for a runnable task and mark it running.
    /// Returns the task index and its function.
    fn find_work(&self, thread_index: usize) -> Option<(u64, TaskFn<R>)> {
        let mut list = self.task_list.lock().unwrap();

        // Collect the set of indices still present so dependency
        // checks see tasks that are running as unfinished.
        let mut candidate = None;
        for (i, task) in list.iter().enumerate() {
            if task.running {
                continue;
            }
            if !task.thread_locks.is_empty() && !task.thread_locks.contains(&thread_index) {
                continue;
            }
            let blocked = task
                .dependencies
                .iter()
                .any(|dep| list.iter().any(|t| t.index == *dep));
            if blocked {
                continue;
            }
            candidate = Some(i);
            break;
        }

        let i = candidate?;
        let task = &mut list[i];
        task.running = true;
        Some((task.index, task.func.take().expect("task ran twice")))
    }

    fn task_complete(&self, index: u64) {
        let mut list = self.task_list.lock().unwrap();
        if let Some(pos) = list.iter().position(|t| t.index == index) {
            list.remove(pos);
        }
    }

    fn is_empty(&self) -> bool {
        self.task_list.lock().unwrap().is_empty()
    }
}

fn worker_thread<R: ThreadItem>(
    shared: Arc<SharedState<R>>,
    mut resource: R,
    thread_index: usize,
) {
    if let Err(e) = resource.thread_begin(thread_index) {
        log::error!(
            "thread pool worker {} failed to initialize its private resources: {}",
            thread_index,
            e
        );
    }

    while !shared.should_exit.load(Ordering::Acquire) {
        let mut found_work = false;
        if let Some((index, func)) = shared.find_work(thread_index) {
            // More might be waiting behind this one.
            shared.wakeup.notify_one();
            func(&mut resource);
            shared.task_complete(index);
            found_work = true;
        }

        if !found_work {
            let guard = shared.wakeup_mutex.lock().unwrap();
            let _ = shared.wakeup.wait_timeout(guard, WORKER_POLL_INTERVAL);
        }
    }

    resource.thread_end();
}

/// The worker pool. Dropping it drains the task list, then signals
/// the workers to exit and joins them.
pub(crate) struct ThreadPool<R: ThreadItem> {
    tp_shared: Arc<SharedState<R>>,
    tp_threads: Vec<std::thread::JoinHandle<()>>,
    tp_task_index_counter: AtomicU64,
}

impl<R: ThreadItem> ThreadPool<R> {
    /// Spawn one worker per resource; each resource is moved into its
    /// thread and `thread_begin` runs there.
    pub fn new(resources: Vec<R>) -> Result<ThreadPool<R>> {
        let shared = Arc::new(SharedState {
            task_list: Mutex::new(VecDeque::new()),
            wakeup_mutex: Mutex::new(()),
            wakeup: Condvar::new(),
            should_exit: AtomicBool::new(false),
        });

        let mut threads = Vec::with_capacity(resources.len());
        for (i, resource) in resources.into_iter().enumerate() {
            let shared = shared.clone();
            threads.push(std::thread::spawn(move || {
                worker_thread(shared, resource, i)
            }));
        }

        Ok(ThreadPool {
            tp_shared: shared,
            tp_threads: threads,
            tp_task_index_counter: AtomicU64::new(0),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.tp_threads.len()
    }

    /// Queue a task. `thread_locks` restricts which workers may run
    /// it (empty means any), `dependencies` are task indices returned
    /// by earlier calls. Returns the new task's index.
    pub fn schedule_task<F>(
        &self,
        thread_locks: Vec<usize>,
        dependencies: Vec<u64>,
        func: F,
    ) -> u64
    where
        F: FnOnce(&mut R) + Send + 'static,
    {
        let index = self.tp_task_index_counter.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut list = self.tp_shared.task_list.lock().unwrap();
            list.push_back(TaskEntry {
                index,
                dependencies,
                thread_locks,
                running: false,
                func: Some(Box::new(func)),
            });
        }
        self.tp_shared.wakeup.notify_one();
        index
    }

    /// Block until the task list has fully drained.
    pub fn wait_idle(&self) {
        while !self.tp_shared.is_empty() {
            self.tp_shared.wakeup.notify_all();
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl<R: ThreadItem> Drop for ThreadPool<R> {
    fn drop(&mut self) {
        self.wait_idle();
        self.tp_shared.should_exit.store(true, Ordering::Release);
        for handle in self.tp_threads.drain(..) {
            self.tp_shared.wakeup.notify_all();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn chained_dependencies_run_in_order() {
        // 100 tasks, each depending on the previous one, on 4 threads:
        // they must complete in submitted order and never overlap.
        let pool: ThreadPool<()> = ThreadPool::new(vec![(), (), (), ()]).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));

        let mut prev: Option<u64> = None;
        for i in 0..100u64 {
            let order = order.clone();
            let running = running.clone();
            let deps = prev.map(|p| vec![p]).unwrap_or_default();
            prev = Some(pool.schedule_task(Vec::new(), deps, move |_| {
                assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                order.lock().unwrap().push(i);
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        pool.wait_idle();
        let order = order.lock().unwrap();
        assert_eq!(order.as_slice(), (0..100).collect::<Vec<u64>>().as_slice());
    }

    #[test]
    fn thread_locked_tasks_stay_on_their_thread() {
        struct Tagged(usize, Arc<Mutex<Vec<(usize, usize)>>>);
        impl ThreadItem for Tagged {
            fn thread_begin(&mut self, index: usize) -> Result<()> {
                self.0 = index;
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let pool = ThreadPool::new(
            (0..3).map(|_| Tagged(usize::MAX, seen.clone())).collect(),
        )
        .unwrap();

        for task in 0..30usize {
            let lock = task % 3;
            pool.schedule_task(vec![lock], Vec::new(), move |r: &mut Tagged| {
                r.1.lock().unwrap().push((task, r.0));
            });
        }

        pool.wait_idle();
        for (task, thread) in seen.lock().unwrap().iter() {
            assert_eq!(task % 3, *thread);
        }
    }

    #[test]
    fn dependency_never_starts_before_dependee_finishes() {
        let pool: ThreadPool<()> = ThreadPool::new(vec![(), ()]).unwrap();
        let first_done = Arc::new(AtomicBool::new(false));

        let fd = first_done.clone();
        let first = pool.schedule_task(Vec::new(), Vec::new(), move |_| {
            std::thread::sleep(Duration::from_millis(30));
            fd.store(true, Ordering::SeqCst);
        });

        let fd = first_done.clone();
        let observed = Arc::new(AtomicBool::new(false));
        let obs = observed.clone();
        pool.schedule_task(Vec::new(), vec![first], move |_| {
            obs.store(fd.load(Ordering::SeqCst), Ordering::SeqCst);
        });

        pool.wait_idle();
        assert!(observed.load(Ordering::SeqCst));
    }

    #[test]
    fn thread_end_runs_on_shutdown() {
        struct EndCounter(Arc<AtomicUsize>);
        impl ThreadItem for EndCounter {
            fn thread_end(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(AtomicUsize::new(0));
        let pool =
            ThreadPool::new((0..4).map(|_| EndCounter(counter.clone())).collect()).unwrap();
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
