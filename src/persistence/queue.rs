//! Serialized background writer.

use super::PersistenceAdapter;
use crate::error::{Result, StoreError};
use crate::types::StateTree;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Outcome = std::result::Result<(), String>;

enum Job {
    Save {
        tree: StateTree,
        done: Sender<Outcome>,
    },
    Flush(Sender<Outcome>),
}

/// Completion handle for one queued write.
///
/// Dropping the ticket is fine; the write still happens.
pub struct PersistTicket {
    receiver: Receiver<Outcome>,
}

impl PersistTicket {
    fn resolved(outcome: Outcome) -> Self {
        let (sender, receiver) = bounded(1);
        let _ = sender.send(outcome);
        Self { receiver }
    }

    /// Block until the write finished.
    pub fn wait(self) -> Result<()> {
        match self.receiver.recv() {
            Ok(outcome) => outcome.map_err(StoreError::Persistence),
            Err(_) => Err(StoreError::QueueClosed),
        }
    }

    /// Block for at most `timeout`. `None` if the write is still in flight.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome.map_err(StoreError::Persistence)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => None,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Some(Err(StoreError::QueueClosed))
            }
        }
    }
}

/// Runs adapter writes one at a time on a dedicated thread.
///
/// Writes queued while another is in progress are coalesced: only the newest
/// tree is written, and every ticket in the batch receives that outcome.
/// Failures are logged here and reported only through tickets.
pub struct PersistenceQueue {
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl PersistenceQueue {
    /// Start the writer thread.
    pub fn start(adapter: Arc<dyn PersistenceAdapter>) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let worker = thread::Builder::new()
            .name("statetree-persist".into())
            .spawn(move || run(adapter, receiver))?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Queue `tree` for writing.
    pub fn submit(&self, tree: StateTree) -> PersistTicket {
        let (done, receiver) = bounded(1);
        match &self.sender {
            Some(sender) if sender.send(Job::Save { tree, done }).is_ok() => {
                PersistTicket { receiver }
            }
            _ => PersistTicket::resolved(Err("persistence queue is closed".into())),
        }
    }

    /// Block until every write queued before this call has finished.
    pub fn flush(&self) -> Result<()> {
        let (done, receiver) = bounded(1);
        let sender = self.sender.as_ref().ok_or(StoreError::QueueClosed)?;
        sender
            .send(Job::Flush(done))
            .map_err(|_| StoreError::QueueClosed)?;
        match receiver.recv() {
            Ok(outcome) => outcome.map_err(StoreError::Persistence),
            Err(_) => Err(StoreError::QueueClosed),
        }
    }
}

impl Drop for PersistenceQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("persistence worker panicked");
            }
        }
    }
}

fn run(adapter: Arc<dyn PersistenceAdapter>, receiver: Receiver<Job>) {
    while let Ok(first) = receiver.recv() {
        let mut latest = None;
        let mut waiters = Vec::new();
        let mut flushes = Vec::new();

        let mut absorb = |job: Job| match job {
            Job::Save { tree, done } => {
                latest = Some(tree);
                waiters.push(done);
            }
            Job::Flush(done) => flushes.push(done),
        };
        absorb(first);
        while let Ok(job) = receiver.try_recv() {
            absorb(job);
        }

        if let Some(tree) = latest {
            let outcome = match adapter.save(&tree) {
                Ok(()) => {
                    tracing::debug!(coalesced = waiters.len(), "state persisted");
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to persist state");
                    Err(e.to_string())
                }
            };
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }

        for flush in flushes {
            let _ = flush.send(Ok(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryAdapter;
    use serde_json::{json, Value};

    fn tree(value: Value) -> StateTree {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_ticket_resolves_after_write() {
        let adapter = Arc::new(MemoryAdapter::new());
        let queue = PersistenceQueue::start(adapter.clone()).unwrap();

        queue.submit(tree(json!({"n": 1}))).wait().unwrap();
        assert_eq!(adapter.saved().map(Value::Object), Some(json!({"n": 1})));
    }

    #[test]
    fn test_flush_waits_for_newest_tree() {
        let adapter = Arc::new(MemoryAdapter::new());
        let queue = PersistenceQueue::start(adapter.clone()).unwrap();

        for n in 0..20 {
            let _ = queue.submit(tree(json!({"n": n})));
        }
        queue.flush().unwrap();

        assert_eq!(adapter.saved().map(Value::Object), Some(json!({"n": 19})));
        assert!(adapter.save_count() >= 1);
        assert!(adapter.save_count() <= 20);
    }

    #[test]
    fn test_failed_write_reaches_ticket() {
        let adapter = Arc::new(MemoryAdapter::new());
        adapter.set_fail_saves(true);
        let queue = PersistenceQueue::start(adapter.clone()).unwrap();

        let result = queue.submit(tree(json!({"n": 1}))).wait();
        assert!(matches!(result, Err(StoreError::Persistence(_))));
        assert!(adapter.saved().is_none());
    }

    #[test]
    fn test_drop_drains_queue() {
        let adapter = Arc::new(MemoryAdapter::new());
        {
            let queue = PersistenceQueue::start(adapter.clone()).unwrap();
            let _ = queue.submit(tree(json!({"last": true})));
        }
        assert_eq!(adapter.saved().map(Value::Object), Some(json!({"last": true})));
    }
}
