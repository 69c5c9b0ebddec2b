//! Abstract request/reply transport between the manager and the workers.
//!
//! The training driver depends only on [`AbstractManager`]: asynchronous and
//! blocking requests, a single-consumer reply queue, the worker count, and a
//! clean shutdown. [`MultiThreadManager`] is the in-process implementation:
//! one thread per worker, bounded per-worker request queues, one shared reply
//! queue. A remote process pool must provide identical semantics.

use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::error::{Result, TrainError};
use crate::protocol::{RequestEnvelope, WorkerReply, WorkerRequest, WorkerWelcome};

/// Worker-side request handler. One instance per worker, owned by its
/// transport thread (or remote process).
pub trait WorkerHandler: Send {
    /// Handle one request. An `Err` is surfaced to the manager as a fatal
    /// transport error; recoverable state loss is reported through
    /// `request_restart_iter` on the reply instead.
    fn handle(&mut self, envelope: &RequestEnvelope) -> Result<WorkerReply>;
}

/// Manager-side transport operations used by the training driver.
pub trait AbstractManager {
    /// Number of workers in the pool.
    fn num_workers(&self) -> usize;

    /// Enqueue a request to `worker`, or to the next worker of the built-in
    /// round-robin when `worker` is `None`. Returns as soon as the request is
    /// queued; the reply arrives through [`Self::next_async_reply`].
    fn async_request(&mut self, envelope: RequestEnvelope, worker: Option<usize>) -> Result<()>;

    /// Dequeue the next asynchronous reply, blocking until one is available.
    fn next_async_reply(&mut self) -> Result<WorkerReply>;

    /// Send to the round-robin next worker and block for its reply. The
    /// asynchronous reply queue is not touched.
    fn blocking_request(&mut self, request: WorkerRequest) -> Result<WorkerReply>;

    /// Shut the pool down cleanly. No request may follow.
    fn done(&mut self) -> Result<()>;
}

/// Builds the transport for a run, priming every worker with the welcome
/// blob. Keeps the driver polymorphic over in-process and remote pools.
pub trait ManagerFactory {
    fn create(
        &self,
        welcome: &WorkerWelcome,
        parallel_execution_per_worker: usize,
    ) -> Result<Box<dyn AbstractManager>>;
}

// =============================================================================
// In-process multi-thread transport
// =============================================================================

enum WorkerMessage {
    Request {
        envelope: RequestEnvelope,
        blocking: bool,
    },
    Stop,
}

/// In-process transport: one thread per worker handler.
pub struct MultiThreadManager {
    senders: Vec<Sender<WorkerMessage>>,
    async_replies: Receiver<Result<WorkerReply>>,
    blocking_replies: Receiver<Result<WorkerReply>>,
    threads: Vec<JoinHandle<()>>,
    next_worker: usize,
}

impl MultiThreadManager {
    /// Spawn one thread per handler. `parallel_execution_per_worker` bounds
    /// each worker's request queue, which is what backpressures the driver.
    pub fn new(
        handlers: Vec<Box<dyn WorkerHandler>>,
        parallel_execution_per_worker: usize,
    ) -> Result<Self> {
        let (async_tx, async_replies) = unbounded::<Result<WorkerReply>>();
        let (blocking_tx, blocking_replies) = unbounded::<Result<WorkerReply>>();

        let mut senders = Vec::with_capacity(handlers.len());
        let mut threads = Vec::with_capacity(handlers.len());
        for (worker_idx, mut handler) in handlers.into_iter().enumerate() {
            let (tx, rx) = bounded::<WorkerMessage>(parallel_execution_per_worker.max(1));
            let async_tx = async_tx.clone();
            let blocking_tx = blocking_tx.clone();
            let thread = std::thread::Builder::new()
                .name(format!("treeline-worker-{worker_idx}"))
                .spawn(move || {
                    while let Ok(message) = rx.recv() {
                        match message {
                            WorkerMessage::Stop => break,
                            WorkerMessage::Request { envelope, blocking } => {
                                let reply = handler.handle(&envelope);
                                let out = if blocking { &blocking_tx } else { &async_tx };
                                if out.send(reply).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                })
                .map_err(|e| {
                    TrainError::transport(format!("failed to spawn worker thread: {e}"))
                })?;
            senders.push(tx);
            threads.push(thread);
        }

        Ok(Self {
            senders,
            async_replies,
            blocking_replies,
            threads,
            next_worker: 0,
        })
    }

    fn round_robin_next(&mut self) -> usize {
        let worker = self.next_worker % self.senders.len();
        self.next_worker = self.next_worker.wrapping_add(1);
        worker
    }

    fn send(&self, worker: usize, message: WorkerMessage) -> Result<()> {
        let sender = self.senders.get(worker).ok_or_else(|| {
            TrainError::transport(format!(
                "worker {worker} out of range, pool size is {}",
                self.senders.len()
            ))
        })?;
        sender
            .send(message)
            .map_err(|_| TrainError::transport(format!("worker {worker} is gone")))
    }
}

impl AbstractManager for MultiThreadManager {
    fn num_workers(&self) -> usize {
        self.senders.len()
    }

    fn async_request(&mut self, envelope: RequestEnvelope, worker: Option<usize>) -> Result<()> {
        if self.senders.is_empty() {
            return Err(TrainError::transport("the worker pool was shut down"));
        }
        let worker = match worker {
            Some(worker) => worker,
            None => self.round_robin_next(),
        };
        self.send(
            worker,
            WorkerMessage::Request {
                envelope,
                blocking: false,
            },
        )
    }

    fn next_async_reply(&mut self) -> Result<WorkerReply> {
        self.async_replies
            .recv()
            .map_err(|_| TrainError::transport("the reply queue was closed"))?
    }

    fn blocking_request(&mut self, request: WorkerRequest) -> Result<WorkerReply> {
        if self.senders.is_empty() {
            return Err(TrainError::transport("the worker pool was shut down"));
        }
        let worker = self.round_robin_next();
        self.send(
            worker,
            WorkerMessage::Request {
                envelope: RequestEnvelope::new(request),
                blocking: true,
            },
        )?;
        self.blocking_replies
            .recv()
            .map_err(|_| TrainError::transport("the blocking reply queue was closed"))?
    }

    fn done(&mut self) -> Result<()> {
        for sender in &self.senders {
            // A worker that already exited is fine; done() is idempotent.
            let _ = sender.send(WorkerMessage::Stop);
        }
        self.senders.clear();
        for thread in self.threads.drain(..) {
            thread
                .join()
                .map_err(|_| TrainError::transport("a worker thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for MultiThreadManager {
    fn drop(&mut self) {
        let _ = self.done();
    }
}

/// Factory of in-process pools running [`crate::worker::TrainingWorker`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct MultiThreadFactory;

impl ManagerFactory for MultiThreadFactory {
    fn create(
        &self,
        welcome: &WorkerWelcome,
        parallel_execution_per_worker: usize,
    ) -> Result<Box<dyn AbstractManager>> {
        let handlers = (0..welcome.owned_features.len())
            .map(|worker_idx| {
                Box::new(crate::worker::TrainingWorker::new(welcome.clone(), worker_idx))
                    as Box<dyn WorkerHandler>
            })
            .collect();
        Ok(Box::new(MultiThreadManager::new(
            handlers,
            parallel_execution_per_worker,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WorkerReplyBody;

    /// Echo handler replying with its worker index.
    struct EchoWorker {
        worker_idx: usize,
    }

    impl WorkerHandler for EchoWorker {
        fn handle(&mut self, envelope: &RequestEnvelope) -> Result<WorkerReply> {
            Ok(WorkerReply::ack(
                self.worker_idx,
                envelope.request_id,
                WorkerReplyBody::StartTraining,
            ))
        }
    }

    fn echo_pool(num_workers: usize) -> MultiThreadManager {
        let handlers = (0..num_workers)
            .map(|worker_idx| Box::new(EchoWorker { worker_idx }) as Box<dyn WorkerHandler>)
            .collect();
        MultiThreadManager::new(handlers, 4).unwrap()
    }

    #[test]
    fn broadcast_collects_one_reply_per_worker() {
        let mut manager = echo_pool(3);
        for worker in 0..manager.num_workers() {
            manager
                .async_request(
                    RequestEnvelope::new(WorkerRequest::StartTraining),
                    Some(worker),
                )
                .unwrap();
        }
        let mut seen = vec![false; 3];
        for _ in 0..3 {
            let reply = manager.next_async_reply().unwrap();
            seen[reply.worker] = true;
        }
        assert!(seen.iter().all(|&s| s));
        manager.done().unwrap();
    }

    #[test]
    fn unbound_requests_round_robin() {
        let mut manager = echo_pool(2);
        for shard in 0..4u64 {
            manager
                .async_request(
                    RequestEnvelope::with_id(WorkerRequest::StartTraining, shard),
                    None,
                )
                .unwrap();
        }
        let mut per_worker = [0usize; 2];
        for _ in 0..4 {
            let reply = manager.next_async_reply().unwrap();
            per_worker[reply.worker] += 1;
            assert!(reply.request_id.is_some());
        }
        assert_eq!(per_worker, [2, 2]);
        manager.done().unwrap();
    }

    #[test]
    fn blocking_request_bypasses_async_queue() {
        let mut manager = echo_pool(2);
        // Queue an async request first; the blocking reply must not steal it.
        manager
            .async_request(RequestEnvelope::new(WorkerRequest::StartTraining), Some(0))
            .unwrap();
        let blocking = manager
            .blocking_request(WorkerRequest::GetLabelStatistics)
            .unwrap();
        assert!(!blocking.request_restart_iter);
        let async_reply = manager.next_async_reply().unwrap();
        assert_eq!(async_reply.worker, 0);
        manager.done().unwrap();
    }

    #[test]
    fn requests_after_done_fail() {
        let mut manager = echo_pool(1);
        manager.done().unwrap();
        assert!(manager
            .async_request(RequestEnvelope::new(WorkerRequest::StartTraining), Some(0))
            .is_err());
    }
}
