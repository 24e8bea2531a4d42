//! Generic stream-consumer worker loop.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::warn;

use meterflow_core::CustomerId;
use meterflow_events::{Partitioned, StreamBus, Subscription};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(shutdown: mpsc::Sender<()>, join: thread::JoinHandle<()>) -> Self {
        Self {
            shutdown,
            join: Some(join),
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Generic consumer worker loop.
///
/// - Subscribes to a stream topic
/// - Applies an idempotent handler for each message
/// - Supports graceful shutdown
///
/// Handler failures are logged and the loop continues; with at-least-once
/// transports the message stays pending until acknowledged.
#[derive(Debug)]
pub struct ConsumerWorker;

impl ConsumerWorker {
    /// Spawn a worker thread that processes messages from the bus.
    ///
    /// `handler` must be idempotent (at-least-once delivery safe).
    pub fn spawn<M, B, H, E>(name: &'static str, bus: &B, handler: H) -> WorkerHandle
    where
        M: Send + 'static,
        B: StreamBus<M>,
        H: FnMut(M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        Self::spawn_inner(name, bus, None::<fn(&M) -> bool>, handler)
    }

    /// Spawn a worker pinned to one customer partition.
    ///
    /// Messages for other customers are ignored. With a bus that fans out
    /// to every subscriber this shards the work; with a partitioned log it
    /// doubles as a guard against misrouted messages.
    pub fn spawn_pinned<M, B, H, E>(
        name: &'static str,
        bus: &B,
        customer_id: CustomerId,
        handler: H,
    ) -> WorkerHandle
    where
        M: Partitioned + Send + 'static,
        B: StreamBus<M>,
        H: FnMut(M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        Self::spawn_inner(
            name,
            bus,
            Some(move |m: &M| m.partition_key() == customer_id),
            handler,
        )
    }

    fn spawn_inner<M, B, F, H, E>(
        name: &'static str,
        bus: &B,
        accept: Option<F>,
        mut handler: H,
    ) -> WorkerHandle
    where
        M: Send + 'static,
        B: StreamBus<M>,
        F: Fn(&M) -> bool + Send + 'static,
        H: FnMut(M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<M> = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, accept, &mut handler))
            .expect("failed to spawn consumer worker thread");

        WorkerHandle::new(shutdown_tx, join)
    }
}

fn worker_loop<M, F, H, E>(
    name: &'static str,
    sub: Subscription<M>,
    shutdown_rx: mpsc::Receiver<()>,
    accept: Option<F>,
    handler: &mut H,
) where
    F: Fn(&M) -> bool,
    H: FnMut(M) -> Result<(), E>,
    E: core::fmt::Debug,
{
    let tick = Duration::from_millis(250);

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(msg) => {
                if let Some(accept) = &accept {
                    if !accept(&msg) {
                        // Pinned workers ignore other partitions.
                        continue;
                    }
                }

                if let Err(err) = handler(msg) {
                    warn!(worker = name, error = ?err, "consumer handler failed");
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}
