//! Controller runtime: watches feed a shared work queue drained by a pool
//! of reconcile workers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{join_all, BoxFuture};
use futures_util::{FutureExt, Stream, StreamExt};
use nodepool_events::{Resource, WatchEvent};
use nodepool_id::{AttemptId, ObjectKey};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::BackoffPolicy;
use crate::error::ReconcileError;
use crate::mapper::EventHandler;
use crate::predicate::Predicate;
use crate::queue::WorkQueue;

// =============================================================================
// Reconciler
// =============================================================================

/// What to do with a key after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Converged; wait for the next event.
    Done,

    /// Reconcile again after the given delay.
    RequeueAfter(Duration),
}

/// Per-invocation context handed to a [`Reconciler`].
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    shutdown: watch::Receiver<bool>,

    /// Identifies this invocation in logs.
    pub attempt: AttemptId,

    /// Consecutive failed attempts for this key before this one.
    pub requeues: u32,
}

impl ReconcileContext {
    pub fn new(shutdown: watch::Receiver<bool>, requeues: u32) -> Self {
        Self {
            shutdown,
            attempt: AttemptId::new(),
            requeues,
        }
    }

    /// True once the controller has been asked to stop. Long running
    /// reconciles should check this between steps.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves when the controller is asked to stop.
    pub async fn cancelled(&self) {
        let mut shutdown = self.shutdown.clone();
        let _ = shutdown.wait_for(|stop| *stop).await;
    }
}

/// Converges one object identified by its key.
///
/// The same key is never reconciled by two workers at once. Implementations
/// must be idempotent: a key may be reconciled again with no change in
/// between.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(
        &self,
        key: &ObjectKey,
        ctx: &ReconcileContext,
    ) -> Result<Action, ReconcileError>;
}

// =============================================================================
// Options
// =============================================================================

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Number of reconcile workers. Zero is treated as one.
    pub max_concurrent_reconciles: usize,

    /// Backoff for retryable failures.
    pub backoff: BackoffPolicy,

    /// How long in-flight reconciles may run after shutdown is requested.
    pub drain_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 1,
            backoff: BackoffPolicy::default(),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Routes watch events of one source kind into a controller's queue.
pub struct Dispatcher<S> {
    controller: Arc<str>,
    queue: WorkQueue<ObjectKey>,
    predicate: Predicate,
    handler: EventHandler<S>,
}

impl<S: Resource> Dispatcher<S> {
    pub fn new(
        controller: Arc<str>,
        queue: WorkQueue<ObjectKey>,
        predicate: Predicate,
        handler: EventHandler<S>,
    ) -> Self {
        Self {
            controller,
            queue,
            predicate,
            handler,
        }
    }

    /// Filters, maps and enqueues one event. Returns the number of keys
    /// handed to the queue.
    pub fn dispatch(&self, event: &WatchEvent<S>) -> usize {
        if !self.predicate.evaluate(event) {
            debug!(
                controller = %self.controller,
                source = S::KIND,
                event = %event.kind(),
                object = %event.key(),
                "Event filtered"
            );
            return 0;
        }

        let keys = match self.handler.keys(event) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(
                    controller = %self.controller,
                    source = S::KIND,
                    event = %event.kind(),
                    error = %e,
                    "Dropping event that could not be mapped"
                );
                return 0;
            }
        };

        let count = keys.len();
        for key in keys {
            self.queue.add(key);
        }
        count
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Cheap handle for enqueueing keys into a running controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    queue: WorkQueue<ObjectKey>,
}

impl ControllerHandle {
    pub fn enqueue(&self, key: ObjectKey) {
        self.queue.add(key);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }
}

/// A named reconcile loop with its watches.
pub struct Controller<R> {
    name: Arc<str>,
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<R>,
    options: ControllerOptions,
    watches: Vec<BoxFuture<'static, ()>>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(name: impl Into<Arc<str>>, reconciler: Arc<R>, options: ControllerOptions) -> Self {
        let queue = WorkQueue::new(options.backoff.clone());
        Self {
            name: name.into(),
            queue,
            reconciler,
            options,
            watches: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    /// Number of registered watches.
    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    /// Builds a dispatcher feeding this controller's queue.
    pub fn dispatcher<S: Resource>(
        &self,
        predicate: Predicate,
        handler: EventHandler<S>,
    ) -> Dispatcher<S> {
        Dispatcher::new(Arc::clone(&self.name), self.queue.clone(), predicate, handler)
    }

    /// Registers a watch. Events from `source` are dispatched once the
    /// controller runs.
    pub fn watch<S, St>(
        &mut self,
        source: St,
        predicate: Predicate,
        handler: EventHandler<S>,
    ) -> &mut Self
    where
        S: Resource,
        St: Stream<Item = WatchEvent<S>> + Send + 'static,
    {
        let dispatcher = self.dispatcher(predicate, handler);
        let controller = Arc::clone(&self.name);
        self.watches.push(Box::pin(async move {
            futures_util::pin_mut!(source);
            while let Some(event) = source.next().await {
                dispatcher.dispatch(&event);
            }
            debug!(controller = %controller, source = S::KIND, "Watch stream ended");
        }));
        self
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            queue: self.queue.clone(),
        }
    }

    /// Runs watches and workers until `shutdown` flips to true (or its
    /// sender is dropped), then drains in-flight reconciles.
    ///
    /// Keys still queued at shutdown are dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Controller {
            name,
            queue,
            reconciler,
            options,
            watches,
        } = self;

        let worker_count = options.max_concurrent_reconciles.max(1);
        info!(
            controller = %name,
            workers = worker_count,
            watches = watches.len(),
            "Starting controller"
        );

        let watch_handles: Vec<JoinHandle<()>> = watches.into_iter().map(tokio::spawn).collect();

        let workers: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&name),
                    queue.clone(),
                    Arc::clone(&reconciler),
                    shutdown.clone(),
                ))
            })
            .collect();

        let _ = shutdown.wait_for(|stop| *stop).await;
        info!(controller = %name, "Stopping controller");

        for handle in &watch_handles {
            handle.abort();
        }
        queue.shutdown();

        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(options.drain_timeout, join_all(workers))
            .await
            .is_err()
        {
            warn!(
                controller = %name,
                timeout_secs = options.drain_timeout.as_secs(),
                "Reconciles did not finish in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        info!(controller = %name, "Controller stopped");
    }
}

async fn worker_loop<R: Reconciler>(
    id: usize,
    controller: Arc<str>,
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<R>,
    shutdown: watch::Receiver<bool>,
) {
    debug!(controller = %controller, worker = id, "Worker started");

    while let Some(key) = queue.get().await {
        let ctx = ReconcileContext::new(shutdown.clone(), queue.num_requeues(&key));
        let span = info_span!(
            "reconcile",
            controller = %controller,
            key = %key,
            attempt = %ctx.attempt,
        );

        let result = AssertUnwindSafe(reconciler.reconcile(&key, &ctx))
            .catch_unwind()
            .instrument(span)
            .await
            .unwrap_or_else(|_| Err(ReconcileError::retryable("reconciler panicked")));

        match result {
            Ok(Action::Done) => {
                queue.forget(&key);
            }
            Ok(Action::RequeueAfter(delay)) => {
                queue.forget(&key);
                queue.add_after(key.clone(), delay);
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    controller = %controller,
                    key = %key,
                    requeues = ctx.requeues,
                    error = %e,
                    "Reconcile failed, retrying with backoff"
                );
                queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                error!(
                    controller = %controller,
                    key = %key,
                    error = %e,
                    "Reconcile failed permanently"
                );
                queue.forget(&key);
            }
        }

        queue.done(&key);
    }

    debug!(controller = %controller, worker = id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use nodepool_events::{Machine, Worker, OPERATION_ANNOTATION};

    use crate::error::MappingError;
    use crate::mapper::MapMode;

    fn queue() -> WorkQueue<ObjectKey> {
        WorkQueue::new(BackoffPolicy::default())
    }

    fn dispatcher<S: Resource>(
        q: &WorkQueue<ObjectKey>,
        predicate: Predicate,
        handler: EventHandler<S>,
    ) -> Dispatcher<S> {
        Dispatcher::new(Arc::from("test"), q.clone(), predicate, handler)
    }

    #[test]
    fn test_dispatch_filters_then_enqueues() {
        let q = queue();
        let d = dispatcher(&q, Predicate::OperationAnnotation, EventHandler::ForObject);

        let old = Worker::new("shoot--a", "w", "aws");
        let mut new = old.clone();
        new.spec.region = "eu".to_string();
        assert_eq!(
            d.dispatch(&WatchEvent::Updated {
                old: old.clone(),
                new: new.clone()
            }),
            0
        );

        new.metadata
            .annotations
            .insert(OPERATION_ANNOTATION.to_string(), "reconcile".to_string());
        assert_eq!(d.dispatch(&WatchEvent::Updated { old, new }), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_dispatch_drops_unmappable_events() {
        let q = queue();
        let d = dispatcher(
            &q,
            Predicate::Always,
            EventHandler::mapped(
                |m: &Machine| {
                    Err(MappingError::MalformedOwnerReference {
                        object: m.key(),
                        reason: "broken".to_string(),
                    })
                },
                MapMode::UpdateWithNew,
            ),
        );

        assert_eq!(
            d.dispatch(&WatchEvent::Created(Machine::new("ns", "m", "s"))),
            0
        );
        assert!(q.is_empty());
    }

    #[test]
    fn test_dispatch_coalesces_fan_out() {
        let q = queue();
        let keys = BTreeSet::from([ObjectKey::new("ns", "a"), ObjectKey::new("ns", "b")]);
        let d = dispatcher(
            &q,
            Predicate::Always,
            EventHandler::mapped(
                move |_: &Machine| Ok(keys.clone()),
                MapMode::UpdateWithNew,
            ),
        );

        let event = WatchEvent::Generic(Machine::new("ns", "m", "s"));
        assert_eq!(d.dispatch(&event), 2);
        assert_eq!(d.dispatch(&event), 2);
        assert_eq!(q.len(), 2);
    }

    struct Recording {
        seen: Mutex<Vec<ObjectKey>>,
        result: Result<Action, ReconcileError>,
    }

    #[async_trait]
    impl Reconciler for Recording {
        async fn reconcile(
            &self,
            key: &ObjectKey,
            _ctx: &ReconcileContext,
        ) -> Result<Action, ReconcileError> {
            self.seen.lock().unwrap().push(key.clone());
            self.result.clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reconciles_and_stops() {
        let reconciler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            result: Ok(Action::Done),
        });
        let controller = Controller::new("test", Arc::clone(&reconciler), ControllerOptions::default());
        let handle = controller.handle();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(controller.run(rx));

        handle.enqueue(ObjectKey::new("ns", "a"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*reconciler.seen.lock().unwrap(), vec![ObjectKey::new("ns", "a")]);

        tx.send(true).unwrap();
        task.await.unwrap();

        handle.enqueue(ObjectKey::new("ns", "b"));
        assert!(handle.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let reconciler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            result: Err(ReconcileError::terminal("bad spec")),
        });
        let controller = Controller::new("test", Arc::clone(&reconciler), ControllerOptions::default());
        let handle = controller.handle();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(controller.run(rx));

        handle.enqueue(ObjectKey::new("ns", "a"));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reconciler.seen.lock().unwrap().len(), 1);
        assert_eq!(handle.queue().num_requeues(&ObjectKey::new("ns", "a")), 0);

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    struct Panicking;

    #[async_trait]
    impl Reconciler for Panicking {
        async fn reconcile(
            &self,
            key: &ObjectKey,
            _ctx: &ReconcileContext,
        ) -> Result<Action, ReconcileError> {
            if key.name == "boom" {
                panic!("reconciler bug");
            }
            Ok(Action::Done)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_retried_and_does_not_kill_worker() {
        let controller = Controller::new("test", Arc::new(Panicking), ControllerOptions::default());
        let handle = controller.handle();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(controller.run(rx));

        handle.enqueue(ObjectKey::new("ns", "boom"));
        handle.enqueue(ObjectKey::new("ns", "fine"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handle.queue().num_requeues(&ObjectKey::new("ns", "boom")) >= 1);
        assert_eq!(handle.queue().processing_len(), 0);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
