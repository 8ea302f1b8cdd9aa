//! Serialized task queue.
//!
//! A single consumer task owns the queue state; every operation, stream
//! callback and timer is expressed as a closure run against that state in
//! enqueue order.

use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;

use crate::error::{cancelled, is_primary_lease_lost, SyncResult};
use crate::platform::runtime;

type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

const LEASE_RETRY_ATTEMPTS: u32 = 5;
const LEASE_RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct AsyncQueue<S> {
    sender: Sender<Task<S>>,
}

impl<S> Clone for AsyncQueue<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S: Send + 'static> AsyncQueue<S> {
    /// Moves `state` into a freshly spawned consumer task.
    pub fn start(state: S) -> Self {
        let (sender, receiver) = async_channel::unbounded::<Task<S>>();
        runtime::spawn_detached(Self::drain(state, receiver));
        Self { sender }
    }

    async fn drain(mut state: S, receiver: Receiver<Task<S>>) {
        while let Ok(task) = receiver.recv().await {
            task(&mut state);
        }
        log::debug!("async queue drained");
    }

    /// Schedules `task`. Returns `false` once the queue has been shut down.
    pub fn enqueue<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.sender.try_send(Box::new(task)).is_ok()
    }

    /// Schedules `task` after `delay`. Dropped silently after shutdown.
    pub fn enqueue_after<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let queue = self.clone();
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if !queue.enqueue(task) {
                log::debug!("delayed task dropped after queue shutdown");
            }
        });
    }

    /// Runs `operation` on the queue and waits for its result.
    pub async fn run<T, F>(&self, operation: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> SyncResult<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let scheduled = self.enqueue(move |state| {
            let _ = tx.send(operation(state));
        });
        if !scheduled {
            return Err(cancelled("The client has been shut down"));
        }
        rx.await
            .map_err(|_| cancelled("The client was shut down before the operation ran"))?
    }

    /// Like [`run`](Self::run), but re-runs the operation after a short
    /// delay while it fails because the primary lease is held elsewhere.
    pub async fn run_retryable<T, F>(&self, operation: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: Fn(&mut S) -> SyncResult<T> + Send + Sync + 'static,
    {
        let operation = Arc::new(operation);
        let mut attempt = 0;
        loop {
            let op = Arc::clone(&operation);
            match self.run(move |state| op(state)).await {
                Err(err) if is_primary_lease_lost(&err) && attempt < LEASE_RETRY_ATTEMPTS => {
                    attempt += 1;
                    log::warn!("primary lease unavailable, retrying ({attempt})");
                    runtime::sleep(LEASE_RETRY_DELAY * attempt).await;
                }
                other => return other,
            }
        }
    }

    /// Stops accepting work. Tasks already queued still run.
    pub fn shutdown(&self) {
        self.sender.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.is_closed()
    }
}
