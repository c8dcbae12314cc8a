//! Per-address serialization of session work.
//!
//! Every operation that touches a session record runs through a bucket
//! keyed by the peer address. Jobs in one bucket execute strictly in
//! submission order, one at a time; buckets never block each other. The
//! first job submitted to an idle bucket spawns a drain task that runs
//! jobs until the bucket is empty, then tears the bucket down, so an idle
//! queue holds no state and no tasks.

use crate::utils::{ProtocolError, Result};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

/// Jobs processed in one bucket before its backing storage is compacted
const GC_LIMIT: usize = 10_000;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Bucket {
    jobs: VecDeque<Job>,
    processed: usize,
}

type Buckets = Arc<Mutex<HashMap<String, Bucket>>>;

/// A keyed FIFO executor for session operations
#[derive(Default)]
pub struct JobQueue {
    buckets: Buckets,
}

impl JobQueue {
    /// A new queue with no buckets
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Submit `job` to `bucket` and resolve with its output.
    ///
    /// The job is enqueued synchronously, so two calls made in sequence on
    /// the same bucket always execute in that sequence, regardless of how
    /// the returned futures are awaited. A failing job fails only its own
    /// caller; the bucket keeps draining.
    pub fn run<T, F>(&self, bucket: &str, job: F) -> impl Future<Output = Result<T>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped: Job = Box::pin(async move {
            let _ = tx.send(job.await);
        });

        let spawn_drain = {
            let mut buckets = lock(&self.buckets);
            match buckets.get_mut(bucket) {
                Some(entry) => {
                    entry.jobs.push_back(wrapped);
                    false
                }
                None => {
                    let mut jobs = VecDeque::new();
                    jobs.push_back(wrapped);
                    buckets.insert(bucket.to_string(), Bucket { jobs, processed: 0 });
                    true
                }
            }
        };
        if spawn_drain {
            let buckets = Arc::clone(&self.buckets);
            let key = bucket.to_string();
            tokio::spawn(drain(buckets, key));
        }

        async move {
            rx.await.map_err(|_| {
                ProtocolError::unexpected("Queued session job dropped before completing")
            })?
        }
    }

    /// Number of jobs waiting (not yet started) in `bucket`
    pub fn pending(&self, bucket: &str) -> usize {
        lock(&self.buckets)
            .get(bucket)
            .map(|b| b.jobs.len())
            .unwrap_or(0)
    }

    /// True when `bucket` has no drain task and no jobs
    pub fn is_idle(&self, bucket: &str) -> bool {
        !lock(&self.buckets).contains_key(bucket)
    }
}

/// Run one bucket's jobs to exhaustion, then remove the bucket.
async fn drain(buckets: Buckets, key: String) {
    loop {
        let job = {
            let mut buckets = lock(&buckets);
            let Some(bucket) = buckets.get_mut(&key) else {
                return;
            };
            match bucket.jobs.pop_front() {
                Some(job) => {
                    bucket.processed += 1;
                    if bucket.processed % GC_LIMIT == 0 {
                        log::debug!(
                            "Compacting job bucket {key} after {} jobs",
                            bucket.processed
                        );
                        bucket.jobs.shrink_to_fit();
                    }
                    Some(job)
                }
                None => {
                    // Drained: tear the bucket down entirely
                    buckets.remove(&key);
                    None
                }
            }
        };
        match job {
            Some(job) => job.await,
            None => return,
        }
    }
}

fn lock(buckets: &Mutex<HashMap<String, Bucket>>) -> std::sync::MutexGuard<'_, HashMap<String, Bucket>> {
    buckets.lock().unwrap_or_else(PoisonError::into_inner)
}
