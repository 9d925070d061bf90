//! Per-source FIFO task queue with an at-most-one-in-flight processor.
//!
//! Every externally visible source operation is funneled through one of
//! these, which is what gives a source its strict call-order serialization.
//! The queue resolves each task against the performer supplied by its owner
//! and settles the enqueuer's future with the performer's result before the
//! next task is dispatched.
//!
//! Failure handling is configurable: a failed head can be dropped (`Skip`) or
//! left in place stalling the queue (`Fail` / `Retry`) until the caller
//! decides via [`TaskQueue::skip`], [`TaskQueue::retry`] or
//! [`TaskQueue::shift`]. Clearing rejects every queued future with a
//! cancellation error; an in-flight performer runs to completion but its
//! resolution is discarded.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use orbit_api::{OrbitError, Result};

use crate::bucket::Bucket;

/// Resolves tasks for a queue. For a source this is the source itself,
/// dispatching on the task kind to the matching protected handler.
#[async_trait]
pub trait Performer<T, R>: Send + Sync {
    async fn perform(&self, task: T) -> Result<R>;
}

/// What to do when the head task's performer fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Drop the failed task (its future rejects) and continue with the next.
    Skip,
    /// Keep the failed head; the caller re-dispatches it with `retry()`.
    Retry,
    /// Keep the failed head in an error state until `skip()`, `retry()` or
    /// `shift()` resolves it.
    #[default]
    Fail,
}

struct QueuedTask<T, R> {
    seq: u64,
    task: T,
    responder: Option<oneshot::Sender<Result<R>>>,
}

struct QueueState<T, R> {
    tasks: VecDeque<QueuedTask<T, R>>,
    error: Option<OrbitError>,
    epoch: u64,
    next_seq: u64,
}

type PersistHook<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Inner<T, R> {
    name: String,
    policy: FailurePolicy,
    state: Mutex<QueueState<T, R>>,
    notify: Notify,
    persist: Option<PersistHook<T>>,
}

/// FIFO task queue; see module docs.
pub struct TaskQueue<T, R> {
    inner: Arc<Inner<T, R>>,
    bucket: Option<Arc<dyn Bucket>>,
}

impl<T, R> TaskQueue<T, R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    pub fn new(
        name: impl Into<String>,
        performer: Arc<dyn Performer<T, R>>,
        policy: FailurePolicy,
    ) -> Self {
        Self::build(name.into(), performer, policy, None, None)
    }

    fn build(
        name: String,
        performer: Arc<dyn Performer<T, R>>,
        policy: FailurePolicy,
        persist: Option<PersistHook<T>>,
        bucket: Option<Arc<dyn Bucket>>,
    ) -> Self {
        let inner = Arc::new(Inner {
            name,
            policy,
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                error: None,
                epoch: 0,
                next_seq: 0,
            }),
            notify: Notify::new(),
            persist,
        });
        spawn_processor(Arc::downgrade(&inner), performer);
        Self { inner, bucket }
    }

    /// Enqueue a task and await its result. Settles with the performer's
    /// result, or with `TaskCancelled` if the queue is cleared first.
    pub async fn push(&self, task: T) -> Result<R> {
        let rx = {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            let (tx, rx) = oneshot::channel();
            state.tasks.push_back(QueuedTask {
                seq,
                task,
                responder: Some(tx),
            });
            rx
        };
        self.persist_pending().await;
        self.inner.notify.notify_one();

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(OrbitError::TaskCancelled(format!(
                "queue {} released before the task settled",
                self.inner.name
            ))),
        }
    }

    /// Reject every queued task with a cancellation error. The in-flight
    /// performer (if any) runs to completion; its resolution is discarded.
    pub async fn clear(&self) {
        let drained = {
            let mut state = self.lock();
            state.epoch += 1;
            state.error = None;
            std::mem::take(&mut state.tasks)
        };
        let count = drained.len();
        for queued in drained {
            if let Some(tx) = queued.responder {
                let _ = tx.send(Err(OrbitError::TaskCancelled(format!(
                    "queue {} cleared",
                    self.inner.name
                ))));
            }
        }
        debug!(queue = %self.inner.name, count, "queue cleared");
        self.persist_pending().await;
        self.inner.notify.notify_one();
    }

    /// Drop the (failed) head task; its future rejects with the stored error.
    pub async fn skip(&self) {
        let popped = {
            let mut state = self.lock();
            let error = state.error.take();
            state.tasks.pop_front().map(|queued| (queued, error))
        };
        if let Some((queued, error)) = popped {
            if let Some(tx) = queued.responder {
                let _ = tx.send(Err(error.unwrap_or_else(|| {
                    OrbitError::TaskCancelled(format!("task skipped on queue {}", self.inner.name))
                })));
            }
        }
        self.persist_pending().await;
        self.inner.notify.notify_one();
    }

    /// Clear the error state and re-dispatch the stalled head.
    pub fn retry(&self) {
        self.lock().error = None;
        self.inner.notify.notify_one();
    }

    /// Remove and return the head task without performing it. Its future
    /// rejects with a cancellation error.
    pub async fn shift(&self) -> Option<T> {
        let popped = {
            let mut state = self.lock();
            state.error = None;
            state.tasks.pop_front()
        };
        let task = popped.map(|mut queued| {
            if let Some(tx) = queued.responder.take() {
                let _ = tx.send(Err(OrbitError::TaskCancelled(format!(
                    "task shifted off queue {}",
                    self.inner.name
                ))));
            }
            queued.task
        });
        self.persist_pending().await;
        self.inner.notify.notify_one();
        task
    }

    /// The error that stalled the queue, if any.
    pub fn current_error(&self) -> Option<OrbitError> {
        self.lock().error.as_ref().map(OrbitError::duplicate)
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().tasks.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T, R>> {
        self.inner.state.lock().expect("task queue lock poisoned")
    }

    async fn persist_pending(&self) {
        let Some(persist) = self.inner.persist.as_ref().map(Arc::clone) else {
            return;
        };
        let pending: Vec<T> = {
            let state = self.lock();
            state.tasks.iter().map(|queued| queued.task.clone()).collect()
        };
        if let Err(err) = persist(pending).await {
            warn!(queue = %self.inner.name, %err, "failed to persist pending tasks");
        }
    }
}

impl<T, R> TaskQueue<T, R>
where
    T: Clone + Send + Serialize + DeserializeOwned + 'static,
    R: Send + 'static,
{
    /// A queue whose pending tasks survive restarts via the given bucket.
    pub fn with_bucket(
        name: impl Into<String>,
        performer: Arc<dyn Performer<T, R>>,
        policy: FailurePolicy,
        bucket: Arc<dyn Bucket>,
    ) -> Self {
        let name = name.into();
        let key = Self::bucket_key(&name);
        let persist_bucket = Arc::clone(&bucket);
        let persist: PersistHook<T> = Arc::new(move |pending: Vec<T>| {
            let bucket = Arc::clone(&persist_bucket);
            let key = key.clone();
            Box::pin(async move {
                let value = serde_json::to_value(&pending)
                    .map_err(|e| OrbitError::Storage(e.to_string()))?;
                bucket.set(&key, value).await
            })
        });
        Self::build(name, performer, policy, Some(persist), Some(bucket))
    }

    /// Re-enqueue tasks persisted by a previous process. Restored tasks have
    /// no caller; they are performed for their effects only.
    pub async fn restore(&self) -> Result<usize> {
        let Some(bucket) = &self.bucket else {
            return Ok(0);
        };
        let key = Self::bucket_key(&self.inner.name);
        let Some(value) = bucket.get(&key).await? else {
            return Ok(0);
        };
        let tasks: Vec<T> =
            serde_json::from_value(value).map_err(|e| OrbitError::Storage(e.to_string()))?;
        let count = tasks.len();
        {
            let mut state = self.lock();
            for task in tasks {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.tasks.push_back(QueuedTask {
                    seq,
                    task,
                    responder: None,
                });
            }
        }
        if count > 0 {
            debug!(queue = %self.inner.name, count, "restored pending tasks");
            self.inner.notify.notify_one();
        }
        Ok(count)
    }

    fn bucket_key(name: &str) -> String {
        format!("taskqueue:{name}")
    }
}

impl<T, R> Drop for TaskQueue<T, R> {
    fn drop(&mut self) {
        // Wake the processor so it observes the dropped queue and exits.
        self.inner.notify.notify_one();
    }
}

fn spawn_processor<T, R>(inner: Weak<Inner<T, R>>, performer: Arc<dyn Performer<T, R>>)
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    tokio::spawn(async move {
        loop {
            // Drain everything currently runnable, then park.
            loop {
                let Some(strong) = inner.upgrade() else { return };

                let next = {
                    let state = strong.state.lock().expect("task queue lock poisoned");
                    if state.error.is_some() {
                        None
                    } else {
                        state
                            .tasks
                            .front()
                            .map(|queued| (queued.seq, queued.task.clone(), state.epoch))
                    }
                };
                let Some((seq, task, epoch)) = next else {
                    drop(strong);
                    break;
                };

                let result = performer.perform(task).await;

                let responder = {
                    let mut state = strong.state.lock().expect("task queue lock poisoned");
                    if state.epoch != epoch || state.tasks.front().map(|q| q.seq) != Some(seq) {
                        // Cleared or shifted mid-flight: the future was
                        // already rejected, the resolution is discarded.
                        None
                    } else {
                        match result {
                            Ok(value) => {
                                let mut queued = state.tasks.pop_front().expect("head vanished");
                                queued.responder.take().map(|tx| (tx, Ok(value)))
                            }
                            // The caller's future always rejects at failure
                            // time; whether the task stays for retry is the
                            // policy's concern.
                            Err(err) => match strong.policy {
                                FailurePolicy::Skip => {
                                    let mut queued =
                                        state.tasks.pop_front().expect("head vanished");
                                    queued.responder.take().map(|tx| (tx, Err(err)))
                                }
                                FailurePolicy::Retry | FailurePolicy::Fail => {
                                    debug!(queue = %strong.name, %err, "head task failed; queue stalled");
                                    let responder = state
                                        .tasks
                                        .front_mut()
                                        .expect("head vanished")
                                        .responder
                                        .take();
                                    let rejection = err.duplicate();
                                    state.error = Some(err);
                                    responder.map(|tx| (tx, Err(rejection)))
                                }
                            },
                        }
                    }
                };
                if let Some((tx, outcome)) = responder {
                    let _ = tx.send(outcome);
                }

                if let Some(persist) = strong.persist.as_ref().map(Arc::clone) {
                    let pending: Vec<T> = {
                        let state = strong.state.lock().expect("task queue lock poisoned");
                        state.tasks.iter().map(|q| q.task.clone()).collect()
                    };
                    if let Err(err) = persist(pending).await {
                        warn!(queue = %strong.name, %err, "failed to persist pending tasks");
                    }
                }
            }

            let Some(strong) = inner.upgrade() else { return };
            // The processor itself holds the only remaining reference once
            // the queue handle is dropped; its Drop wakes us to observe that.
            if Arc::strong_count(&strong) == 1 {
                return;
            }
            strong.notify.notified().await;
        }
    });
}
