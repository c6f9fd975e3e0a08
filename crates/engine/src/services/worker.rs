use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::isolation::run_isolated;

use super::store::{Persistence, Record, StoreError};

/// Called with the result of a queued load, on the worker thread.
pub type LoadReply = Box<dyn FnOnce(Result<Option<Record>, StoreError>) + Send>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("store worker has shut down")]
    Closed,
    #[error("failed to spawn store worker thread: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
    #[error("store worker thread panicked")]
    Panicked,
}

enum StoreJob {
    Save(Record),
    Delete(Record),
    Load {
        kind: String,
        key: String,
        reply: LoadReply,
    },
    Flush(Sender<()>),
    Shutdown,
}

#[derive(Clone)]
enum Target {
    Worker(Sender<StoreJob>),
    Inline(Arc<dyn Persistence>),
}

/// Cheap handle for queueing store work. Jobs run in submission order, so a
/// save followed by a load of the same record sees the saved data.
#[derive(Clone)]
pub struct StoreQueue {
    target: Target,
}

impl std::fmt::Debug for StoreQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.target {
            Target::Worker(_) => "worker",
            Target::Inline(_) => "inline",
        };
        f.debug_struct("StoreQueue").field("mode", &mode).finish()
    }
}

impl StoreQueue {
    /// Runs every job on the submitting thread. Load replies still arrive
    /// through their callback.
    pub fn inline(store: Arc<dyn Persistence>) -> Self {
        Self {
            target: Target::Inline(store),
        }
    }

    pub fn save(&self, record: Record) -> Result<(), WorkerError> {
        self.submit(StoreJob::Save(record))
    }

    pub fn delete(&self, record: Record) -> Result<(), WorkerError> {
        self.submit(StoreJob::Delete(record))
    }

    pub fn load(
        &self,
        kind: impl Into<String>,
        key: impl Into<String>,
        reply: impl FnOnce(Result<Option<Record>, StoreError>) + Send + 'static,
    ) -> Result<(), WorkerError> {
        self.submit(StoreJob::Load {
            kind: kind.into(),
            key: key.into(),
            reply: Box::new(reply),
        })
    }

    /// Blocks until every job queued before this call has run.
    pub fn flush(&self) -> Result<(), WorkerError> {
        match &self.target {
            Target::Inline(_) => Ok(()),
            Target::Worker(sender) => {
                let (done_tx, done_rx) = bounded(1);
                sender
                    .send(StoreJob::Flush(done_tx))
                    .map_err(|_| WorkerError::Closed)?;
                done_rx.recv().map_err(|_| WorkerError::Closed)
            }
        }
    }

    fn submit(&self, job: StoreJob) -> Result<(), WorkerError> {
        match &self.target {
            Target::Worker(sender) => sender.send(job).map_err(|_| WorkerError::Closed),
            Target::Inline(store) => {
                run_job(store.as_ref(), job);
                Ok(())
            }
        }
    }
}

/// Owns the thread that performs store I/O for every region.
pub struct StoreWorker {
    queue: StoreQueue,
    sender: Sender<StoreJob>,
    join: JoinHandle<()>,
}

impl StoreWorker {
    pub fn spawn(store: Arc<dyn Persistence>) -> Result<Self, WorkerError> {
        let (sender, receiver) = unbounded();
        let join = thread::Builder::new()
            .name("store-worker".to_string())
            .spawn(move || worker_loop(store, receiver))
            .map_err(|source| WorkerError::Spawn { source })?;
        Ok(Self {
            queue: StoreQueue {
                target: Target::Worker(sender.clone()),
            },
            sender,
            join,
        })
    }

    pub fn queue(&self) -> StoreQueue {
        self.queue.clone()
    }

    /// Runs the jobs already queued, then stops the thread. Later submissions
    /// fail with [`WorkerError::Closed`].
    pub fn shutdown_and_join(self) -> Result<(), WorkerError> {
        if self.sender.send(StoreJob::Shutdown).is_err() {
            debug!("store_worker_already_closed");
        }
        self.join.join().map_err(|_| WorkerError::Panicked)
    }
}

fn worker_loop(store: Arc<dyn Persistence>, receiver: Receiver<StoreJob>) {
    info!("store_worker_started");
    let mut jobs = 0u64;
    for job in receiver.iter() {
        if matches!(job, StoreJob::Shutdown) {
            break;
        }
        jobs = jobs.saturating_add(1);
        if let Err(panic) = run_isolated(|| run_job(store.as_ref(), job)) {
            error!(panic = %panic, "store_job_panicked");
        }
    }
    info!(jobs, "store_worker_stopped");
}

fn run_job(store: &dyn Persistence, job: StoreJob) {
    match job {
        StoreJob::Save(record) => {
            if let Err(err) = store.save(&record) {
                warn!(kind = %record.kind, key = %record.key, error = %err, "store_save_failed");
            }
        }
        StoreJob::Delete(record) => {
            if let Err(err) = store.delete(&record) {
                warn!(kind = %record.kind, key = %record.key, error = %err, "store_delete_failed");
            }
        }
        StoreJob::Load { kind, key, reply } => reply(store.load(&kind, &key)),
        StoreJob::Flush(done) => {
            let _ = done.send(());
        }
        StoreJob::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::super::store::MemoryStore;
    use super::*;

    #[test]
    fn worker_runs_jobs_in_submission_order() {
        let store = Arc::new(MemoryStore::new());
        let worker = StoreWorker::spawn(store.clone()).expect("spawn");
        let queue = worker.queue();

        queue
            .save(Record::new("player_tasks", "alice", json!([1])))
            .expect("save");
        let (seen_tx, seen_rx) = unbounded();
        queue
            .load("player_tasks", "alice", move |loaded| {
                let _ = seen_tx.send(loaded.ok().flatten().map(|record| record.data));
            })
            .expect("load");
        queue
            .delete(Record::new("player_tasks", "alice", json!(null)))
            .expect("delete");
        queue.flush().expect("flush");

        assert_eq!(seen_rx.recv().expect("reply"), Some(json!([1])));
        assert!(store.is_empty());
        worker.shutdown_and_join().expect("join");
    }

    #[test]
    fn shutdown_drains_queued_saves_then_rejects_new_work() {
        let store = Arc::new(MemoryStore::new());
        let worker = StoreWorker::spawn(store.clone()).expect("spawn");
        let queue = worker.queue();
        for key in ["a", "b", "c"] {
            queue.save(Record::new("kind", key, json!(key))).expect("save");
        }
        worker.shutdown_and_join().expect("join");

        assert_eq!(store.len(), 3);
        assert!(matches!(
            queue.save(Record::new("kind", "d", json!(null))),
            Err(WorkerError::Closed)
        ));
    }

    #[test]
    fn panicking_reply_does_not_stop_the_worker() {
        let store = Arc::new(MemoryStore::new());
        let worker = StoreWorker::spawn(store.clone()).expect("spawn");
        let queue = worker.queue();
        queue
            .load("kind", "x", |_| panic!("reply exploded"))
            .expect("load");
        let replies = Arc::new(AtomicUsize::new(0));
        let counter = replies.clone();
        queue
            .load("kind", "x", move |loaded| {
                assert!(matches!(loaded, Ok(None)));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("load");
        queue.flush().expect("flush");
        assert_eq!(replies.load(Ordering::SeqCst), 1);
        worker.shutdown_and_join().expect("join");
    }

    #[test]
    fn inline_queue_runs_on_the_caller() {
        let store = Arc::new(MemoryStore::new());
        let queue = StoreQueue::inline(store.clone());
        queue.save(Record::new("kind", "k", json!(3))).expect("save");
        assert_eq!(store.len(), 1);
        let (tx, rx) = bounded(1);
        queue
            .load("kind", "k", move |loaded| {
                let _ = tx.send(loaded.ok().flatten());
            })
            .expect("load");
        // the reply already ran, before `load` returned
        let seen = rx.try_recv().expect("reply delivered");
        assert_eq!(seen.map(|record| record.data), Some(json!(3)));
    }
}
