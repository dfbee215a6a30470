//! Render worker threads.
//!
//! Each worker owns a queue of execute buffers. The main thread fills a
//! worker's queue with one contiguous slice of the frame's render commands,
//! then wakes it; the worker records the whole slice and reports back.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use vkproc_gpu::GpuError;

use crate::error::{ErrorKind, ErrorState, Result};

/// Records queued items into the thread's command buffer.
pub trait Recorder: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Record one item on `thread_index` (0 is the main thread).
    fn record(&self, thread_index: usize, item: &Self::Item) -> Result<()>;
}

struct WorkerState<T> {
    queue: Vec<T>,
    is_working: bool,
    should_stop: bool,
}

struct WorkerShared<T> {
    state: Mutex<WorkerState<T>>,
    cond: Condvar,
}

struct Worker<T> {
    shared: Arc<WorkerShared<T>>,
    thread: Option<JoinHandle<()>>,
    woken: bool,
}

/// Fixed set of recording threads, indexed from 1.
pub struct WorkerPool<R: Recorder> {
    workers: Vec<Worker<R::Item>>,
    recorder: Arc<R>,
}

impl<R: Recorder> WorkerPool<R> {
    /// Spawn `count` workers recording through `recorder`.
    pub fn new(count: usize, recorder: Arc<R>, errors: Arc<ErrorState>) -> Result<Self> {
        let mut pool = Self {
            workers: Vec::with_capacity(count),
            recorder,
        };
        for i in 0..count {
            let shared = Arc::new(WorkerShared {
                state: Mutex::new(WorkerState {
                    queue: Vec::new(),
                    is_working: false,
                    should_stop: false,
                }),
                cond: Condvar::new(),
            });
            let thread_index = i + 1;
            let worker_shared = Arc::clone(&shared);
            let recorder = Arc::clone(&pool.recorder);
            let errors = Arc::clone(&errors);
            // Already spawned workers are joined by Drop if this fails.
            let thread = thread::Builder::new()
                .name(format!("vkproc-render-{thread_index}"))
                .spawn(move || worker_loop(thread_index, &worker_shared, &*recorder, &errors))
                .map_err(|e| GpuError::InvalidState(format!("spawn render worker: {e}")))?;
            pool.workers.push(Worker {
                shared,
                thread: Some(thread),
                woken: false,
            });
        }
        tracing::debug!("started {count} render workers");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn recorder(&self) -> &Arc<R> {
        &self.recorder
    }

    /// Queue an item on worker `thread_index`.
    pub fn enqueue(&self, thread_index: usize, item: R::Item) {
        if let Some(worker) = self.worker(thread_index) {
            worker.shared.state.lock().queue.push(item);
        }
    }

    /// Let worker `thread_index` record its queue.
    pub fn wake(&mut self, thread_index: usize) {
        let Some(worker) = thread_index
            .checked_sub(1)
            .and_then(|i| self.workers.get_mut(i))
        else {
            return;
        };
        if worker.woken {
            return;
        }
        let mut state = worker.shared.state.lock();
        if state.queue.is_empty() {
            return;
        }
        state.is_working = true;
        worker.woken = true;
        drop(state);
        worker.shared.cond.notify_all();
    }

    /// Wake every worker with pending items and wait until all are idle.
    pub fn finish(&mut self) {
        for thread_index in 1..=self.workers.len() {
            self.wake(thread_index);
        }
        for worker in &mut self.workers {
            if !worker.woken {
                continue;
            }
            let mut state = worker.shared.state.lock();
            while state.is_working {
                worker.shared.cond.wait(&mut state);
            }
            worker.woken = false;
        }
    }

    fn worker(&self, thread_index: usize) -> Option<&Worker<R::Item>> {
        thread_index
            .checked_sub(1)
            .and_then(|i| self.workers.get(i))
    }
}

impl<R: Recorder> Drop for WorkerPool<R> {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.shared.state.lock().should_stop = true;
            worker.shared.cond.notify_all();
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

fn worker_loop<R: Recorder>(
    thread_index: usize,
    shared: &WorkerShared<R::Item>,
    recorder: &R,
    errors: &ErrorState,
) {
    let mut state = shared.state.lock();
    loop {
        while !state.is_working && !state.should_stop {
            shared.cond.wait(&mut state);
        }
        if state.should_stop {
            break;
        }

        let items = std::mem::take(&mut state.queue);
        MutexGuard::unlocked(&mut state, || {
            for item in &items {
                if let Err(err) = recorder.record(thread_index, item) {
                    errors.set_error(
                        ErrorKind::RenderRecording,
                        "Failed to record render command",
                        Some(&err.to_string()),
                    );
                    break;
                }
            }
        });

        state.is_working = false;
        shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ThreadAssigner;
    use crate::error::BackendError;

    #[derive(Default)]
    struct LogRecorder {
        log: Mutex<Vec<(usize, u64)>>,
        fail_on: Option<u64>,
    }

    impl Recorder for LogRecorder {
        type Item = u64;

        fn record(&self, thread_index: usize, item: &u64) -> Result<()> {
            if self.fail_on == Some(*item) {
                return Err(BackendError::InvalidHandle {
                    kind: "texture",
                    index: 7,
                });
            }
            self.log.lock().push((thread_index, *item));
            Ok(())
        }
    }

    fn run_batch(pool: &mut WorkerPool<LogRecorder>, renders: &[bool]) {
        let mut assigner = ThreadAssigner::new(pool.len());
        assigner.start_batch(renders.len());
        for (sequence, &is_render) in renders.iter().enumerate() {
            let assignment = assigner.next(is_render);
            if let Some(worker) = assignment.wake {
                pool.wake(worker);
            }
            if !is_render {
                continue;
            }
            if assignment.thread_index == 0 {
                let recorder = Arc::clone(pool.recorder());
                recorder.record(0, &(sequence as u64)).unwrap();
            } else {
                pool.enqueue(assignment.thread_index, sequence as u64);
            }
        }
        pool.finish();
    }

    #[test]
    fn slices_replay_in_submission_order() {
        let errors = Arc::new(ErrorState::new());
        let mut pool = WorkerPool::new(3, Arc::new(LogRecorder::default()), errors).unwrap();
        let renders = [true, true, false, true, true, true, false, true, true, true];
        run_batch(&mut pool, &renders);

        let log = pool.recorder().log.lock().clone();
        let per_thread = |t: usize| -> Vec<u64> {
            log.iter().filter(|(i, _)| *i == t).map(|(_, s)| *s).collect()
        };
        assert_eq!(per_thread(1), vec![0, 1, 3]);
        assert_eq!(per_thread(2), vec![4, 5]);
        assert_eq!(per_thread(3), vec![7, 8]);
        assert_eq!(per_thread(0), vec![9]);

        // Workers ascending, then main, is the order buffers are executed in.
        let executed: Vec<u64> = [1, 2, 3, 0].iter().flat_map(|&t| per_thread(t)).collect();
        assert!(executed.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn finish_can_run_repeatedly() {
        let errors = Arc::new(ErrorState::new());
        let mut pool = WorkerPool::new(2, Arc::new(LogRecorder::default()), errors).unwrap();
        run_batch(&mut pool, &[true; 8]);
        run_batch(&mut pool, &[true; 8]);
        pool.finish();
        assert_eq!(pool.recorder().log.lock().len(), 16);
    }

    #[test]
    fn recording_errors_are_reported() {
        let errors = Arc::new(ErrorState::new());
        errors.set_can_assert(true);
        let recorder = LogRecorder {
            fail_on: Some(1),
            ..LogRecorder::default()
        };
        let mut pool = WorkerPool::new(1, Arc::new(recorder), Arc::clone(&errors)).unwrap();
        run_batch(&mut pool, &[true, true, true, true]);

        assert!(errors.has_error());
        assert_eq!(errors.error_kind(), Some(ErrorKind::RenderRecording));
        // The failing slice stops at the bad item.
        let worker_items: Vec<u64> = pool
            .recorder()
            .log
            .lock()
            .iter()
            .filter(|(t, _)| *t == 1)
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(worker_items, vec![0]);
    }

    #[test]
    fn empty_pool_shuts_down_cleanly() {
        let errors = Arc::new(ErrorState::new());
        let mut pool = WorkerPool::new(0, Arc::new(LogRecorder::default()), errors).unwrap();
        assert!(pool.is_empty());
        pool.wake(1);
        pool.finish();
    }
}
