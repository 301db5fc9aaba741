//! Bounded admission queue between submission and the worker pool.
//!
//! The queue holds job ids, not jobs: the registry stays the source of truth
//! and every dequeue re-reads the current status. Capacity is enforced with a
//! semaphore so producers can reserve a slot (and wait for one) before they
//! create the job they are going to put into it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use quantum_core::{Error, Job, JobId, Result};
use tokio::sync::{Notify, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::policy::SpeculationPolicy;
use crate::registry::JobRegistry;

/// Creation time, then creation order.
type QueueKey = (DateTime<Utc>, usize);

#[derive(Debug)]
struct Entry {
    id: JobId,
    /// Whether the entry holds one of the capacity permits.
    reserved: bool,
}

#[derive(Debug, Default)]
struct Held {
    entries: BTreeMap<QueueKey, Entry>,
    keys: HashMap<JobId, QueueKey>,
    closed: bool,
}

impl Held {
    fn insert(&mut self, key: QueueKey, id: JobId, reserved: bool) -> bool {
        if self.keys.contains_key(&id) {
            return false;
        }
        self.keys.insert(id.clone(), key);
        self.entries.insert(key, Entry { id, reserved });
        true
    }

    fn remove(&mut self, id: &JobId) -> Option<Entry> {
        let key = self.keys.remove(id)?;
        self.entries.remove(&key)
    }
}

enum Take {
    Job(Job),
    Idle,
    Closed,
}

/// A reserved place in the queue.
///
/// Dropping the slot without filling it gives the capacity back.
#[derive(Debug)]
pub struct Slot<'a> {
    queue: &'a AdmissionQueue,
    permit: SemaphorePermit<'a>,
}

impl Slot<'_> {
    /// Put `job` into the reserved place.
    pub fn fill(self, job: &Job) -> Result<()> {
        let queue = self.queue;
        let mut held = queue.lock();
        if held.closed {
            return Err(Error::ShuttingDown);
        }
        let key = queue.key_for(job)?;
        if held.insert(key, job.id.clone(), true) {
            self.permit.forget();
        }
        drop(held);

        debug!(job_id = %job.id, "Queued job");
        queue.wake.notify_waiters();
        Ok(())
    }
}

/// FIFO queue of waiting jobs with a hard capacity.
///
/// Jobs leave in creation order among those the speculation policy admits;
/// a deferred job does not block the ones behind it.
#[derive(Debug)]
pub struct AdmissionQueue {
    registry: Arc<JobRegistry>,
    policy: SpeculationPolicy,
    capacity: usize,
    poll_interval: Duration,
    slots: Semaphore,
    held: Mutex<Held>,
    wake: Notify,
}

impl AdmissionQueue {
    pub fn new(
        registry: Arc<JobRegistry>,
        capacity: usize,
        policy: SpeculationPolicy,
        poll_interval: Duration,
    ) -> Self {
        let capacity = if capacity > Semaphore::MAX_PERMITS {
            warn!(
                requested = capacity,
                max = Semaphore::MAX_PERMITS,
                "Queue capacity clamped"
            );
            Semaphore::MAX_PERMITS
        } else {
            capacity
        };
        Self {
            registry,
            policy,
            capacity,
            poll_interval,
            slots: Semaphore::new(capacity),
            held: Mutex::new(Held::default()),
            wake: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> SpeculationPolicy {
        self.policy
    }

    /// Number of jobs currently held.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Held job ids in dispatch order.
    pub fn ids(&self) -> Vec<JobId> {
        self.lock()
            .entries
            .values()
            .map(|entry| entry.id.clone())
            .collect()
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.lock().keys.contains_key(id)
    }

    /// Wait up to `timeout` for a free slot.
    pub async fn reserve(&self, timeout: Duration) -> Result<Slot<'_>> {
        match tokio::time::timeout(timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => Ok(Slot {
                queue: self,
                permit,
            }),
            Ok(Err(_)) => Err(Error::ShuttingDown),
            Err(_) => {
                warn!(capacity = self.capacity, waited = ?timeout, "Admission queue full");
                Err(Error::QueueFull {
                    capacity: self.capacity,
                    waited: timeout,
                })
            }
        }
    }

    /// Add an existing job, waiting up to `timeout` for room.
    pub async fn enqueue(&self, job: &Job, timeout: Duration) -> Result<()> {
        self.reserve(timeout).await?.fill(job)
    }

    /// Put a job back without waiting for room.
    ///
    /// Used for jobs that were already admitted once (promotions). When the
    /// queue is full the entry is held beyond capacity rather than dropped.
    /// Returns `false` if the job is already held or the queue is closed.
    pub fn reoffer(&self, job: &Job) -> bool {
        let mut held = self.lock();
        if held.closed || held.keys.contains_key(&job.id) {
            return false;
        }
        let Ok(key) = self.key_for(job) else {
            return false;
        };
        let reserved = match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        };
        held.insert(key, job.id.clone(), reserved);
        drop(held);

        self.wake.notify_waiters();
        true
    }

    /// Drop `ids` from the queue, returning how many were held.
    pub fn remove(&self, ids: &[JobId]) -> usize {
        let mut held = self.lock();
        let mut removed = 0;
        let mut freed = 0;
        for id in ids {
            if let Some(entry) = held.remove(id) {
                removed += 1;
                if entry.reserved {
                    freed += 1;
                }
            }
        }
        drop(held);

        self.release(freed);
        removed
    }

    /// Wait up to `timeout` for an admissible job and take it.
    ///
    /// Wakes on every queue change and on [`AdmissionQueue::notify`], and
    /// re-checks at least once per poll interval. Returns `None` on timeout or
    /// once the queue is closed.
    pub async fn dequeue(&self, timeout: Duration) -> Option<Job> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.take_admissible() {
                Take::Job(job) => return Some(job),
                Take::Closed => return None,
                Take::Idle => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wake_at = deadline.min(now + self.poll_interval);
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    /// Tell waiting consumers that job states changed.
    pub fn notify(&self) {
        self.wake.notify_waiters();
    }

    /// Stop accepting work. Pending `reserve` and `dequeue` calls return.
    pub fn close(&self) {
        self.lock().closed = true;
        self.slots.close();
        self.wake.notify_waiters();
    }

    fn take_admissible(&self) -> Take {
        let mut held = self.lock();
        if held.closed {
            return Take::Closed;
        }

        let (picked, stale) = self.registry.read(|table| {
            let mut stale = Vec::new();
            let mut picked = None;
            for entry in held.entries.values() {
                match table.get(&entry.id) {
                    Some(job) if job.status.is_waiting() => {
                        if self.policy.admits(job, table) {
                            picked = Some(job.clone());
                            break;
                        }
                    }
                    _ => stale.push(entry.id.clone()),
                }
            }
            (picked, stale)
        });

        let mut freed = 0;
        for id in stale.iter().chain(picked.as_ref().map(|job| &job.id)) {
            if held.remove(id).is_some_and(|entry| entry.reserved) {
                freed += 1;
            }
        }
        drop(held);

        if !stale.is_empty() {
            debug!(count = stale.len(), "Dropped settled jobs from queue");
        }
        self.release(freed);

        match picked {
            Some(job) => Take::Job(job),
            None => Take::Idle,
        }
    }

    fn key_for(&self, job: &Job) -> Result<QueueKey> {
        let position = self
            .registry
            .read(|table| table.position(&job.id))
            .ok_or_else(|| Error::NotFound(job.id.clone()))?;
        Ok((job.created_at, position))
    }

    fn release(&self, permits: usize) {
        if permits > 0 {
            self.slots.add_permits(permits);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Held> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
