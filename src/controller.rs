//! Reconciliation infrastructure
//!
//! Wraps resource-typed reconciliation into an untyped interface driven by a
//! run loop:
//! - **Reconciler**: the untyped interface the run loop drives
//! - **TypedController** / **TypedDecorator**: fetch the object, snapshot a
//!   deep copy, dispatch to reconcile or finalize, then patch body and
//!   status independently when they changed
//! - **run_controller**: bounded-concurrency loop with requeue support

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error};

use crate::error::{Result, SkyliftError};

/// A request to reconcile the object with the given key
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    /// Key of the object to reconcile
    pub key: String,
}

impl ReconcileRequest {
    /// Create a request for a key
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Re-enqueue the request after this delay
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    /// Finish without requeueing
    pub fn done() -> Self {
        Self::default()
    }

    /// Requeue after a delay
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }
}

/// Untyped reconciler driven by the run loop
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Controller name, used in logs
    fn name(&self) -> &str;

    /// Reconcile one request
    async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileOutcome>;
}

/// A reconcilable object with separable body and status
pub trait Object: Clone + Send + Sync + 'static {
    /// Stable lookup key
    fn key(&self) -> String;

    /// When set, the object is being deleted
    fn deletion_timestamp(&self) -> Option<DateTime<Utc>>;

    /// Compare everything except status
    fn body_equal(&self, other: &Self) -> bool;

    /// Compare status only
    fn status_equal(&self, other: &Self) -> bool;
}

/// Fetch and patch access to typed objects
#[async_trait]
pub trait ObjectClient<T: Object>: Send + Sync {
    /// Fetch an object; `None` when it no longer exists
    async fn get(&self, key: &str) -> Result<Option<T>>;

    /// Patch the non-status fields
    async fn patch_body(&self, obj: &T) -> Result<()>;

    /// Patch the status fields
    async fn patch_status(&self, obj: &T) -> Result<()>;
}

/// A resource-typed reconciler
#[async_trait]
pub trait TypedController<T: Object>: Send + Sync {
    /// Controller name, used in logs
    fn name(&self) -> &str;

    /// Whether deleted objects are dispatched to `finalize`
    fn finalizing(&self) -> bool {
        false
    }

    /// Reconcile a live object
    ///
    /// Returns the outcome and, when the object should be written back, the
    /// updated object. The outcome error and updated object are independent
    /// so a failed reconcile can still persist partial progress.
    async fn reconcile(&self, obj: T) -> (Result<ReconcileOutcome>, Option<T>);

    /// Reconcile an object bearing a deletion timestamp
    async fn finalize(&self, obj: T) -> (Result<ReconcileOutcome>, Option<T>) {
        self.reconcile(obj).await
    }
}

/// Adapts a [`TypedController`] to the untyped [`Reconciler`] interface
pub struct TypedDecorator<T: Object> {
    client: Arc<dyn ObjectClient<T>>,
    controller: Arc<dyn TypedController<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Object> TypedDecorator<T> {
    /// Wrap a typed controller
    pub fn new(client: Arc<dyn ObjectClient<T>>, controller: Arc<dyn TypedController<T>>) -> Self {
        Self {
            client,
            controller,
            _marker: PhantomData,
        }
    }

    async fn patch(&self, stored: &T, updated: &T) -> Result<()> {
        if !stored.body_equal(updated) {
            self.client.patch_body(updated).await?;
        }
        if !stored.status_equal(updated) {
            self.client.patch_status(updated).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Object> Reconciler for TypedDecorator<T> {
    fn name(&self) -> &str {
        self.controller.name()
    }

    async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileOutcome> {
        let Some(obj) = self.client.get(&request.key).await? else {
            return Ok(ReconcileOutcome::done());
        };
        let stored = obj.clone();

        let (result, updated) = if obj.deletion_timestamp().is_some() && self.controller.finalizing()
        {
            self.controller.finalize(obj).await
        } else {
            self.controller.reconcile(obj).await
        };

        if let Some(updated) = &updated {
            if let Err(patch_err) = self.patch(&stored, updated).await {
                // patch failures combine with whatever the reconcile returned
                return Err(match result {
                    Err(reconcile_err) => SkyliftError::Multiple(vec![patch_err, reconcile_err]),
                    Ok(_) => patch_err,
                });
            }
        }
        result
    }
}

/// Run-loop configuration for a controller
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Period after which a successfully reconciled object is resynced
    pub resync_period: Duration,
    /// Maximum reconciliations in flight at once
    pub max_concurrent_reconciles: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(60),
            max_concurrent_reconciles: 10,
        }
    }
}

impl ControllerOptions {
    /// Create default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the resync period
    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    /// Set the concurrency bound
    pub fn max_concurrent_reconciles(mut self, max: usize) -> Self {
        self.max_concurrent_reconciles = max.max(1);
        self
    }
}

/// Drive a reconciler from a request channel until the channel closes
///
/// At most `max_concurrent_reconciles` requests are processed at once.
/// Outcomes asking to requeue are re-sent on `requeue` after their delay.
pub async fn run_controller(
    reconciler: Arc<dyn Reconciler>,
    requeue: mpsc::Sender<ReconcileRequest>,
    mut requests: mpsc::Receiver<ReconcileRequest>,
    options: ControllerOptions,
) {
    // hold only a weak handle so the loop still observes channel closure
    // once every external sender is gone
    let requeue = {
        let weak = requeue.downgrade();
        drop(requeue);
        weak
    };
    let semaphore = Arc::new(Semaphore::new(options.max_concurrent_reconciles));
    while let Some(request) = requests.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let reconciler = reconciler.clone();
        let requeue = requeue.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let key = request.key.clone();
            match reconciler.reconcile(request).await {
                Ok(outcome) => {
                    if let Some(delay) = outcome.requeue_after {
                        debug!(controller = %reconciler.name(), key = %key, ?delay, "requeueing");
                        tokio::time::sleep(delay).await;
                        if let Some(requeue) = requeue.upgrade() {
                            let _ = requeue.send(ReconcileRequest::new(key)).await;
                        }
                    }
                }
                Err(err) => {
                    error!(controller = %reconciler.name(), key = %key, %err, "reconcile failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq)]
    struct Machine {
        name: String,
        spec: String,
        status: String,
        deleted_at: Option<DateTime<Utc>>,
    }

    impl Object for Machine {
        fn key(&self) -> String {
            self.name.clone()
        }
        fn deletion_timestamp(&self) -> Option<DateTime<Utc>> {
            self.deleted_at
        }
        fn body_equal(&self, other: &Self) -> bool {
            self.spec == other.spec
        }
        fn status_equal(&self, other: &Self) -> bool {
            self.status == other.status
        }
    }

    #[derive(Default)]
    struct FakeClient {
        objects: Mutex<HashMap<String, Machine>>,
        body_patches: Mutex<u32>,
        status_patches: Mutex<u32>,
    }

    #[async_trait]
    impl ObjectClient<Machine> for FakeClient {
        async fn get(&self, key: &str) -> Result<Option<Machine>> {
            Ok(self.objects.lock().get(key).cloned())
        }
        async fn patch_body(&self, obj: &Machine) -> Result<()> {
            *self.body_patches.lock() += 1;
            self.objects.lock().insert(obj.name.clone(), obj.clone());
            Ok(())
        }
        async fn patch_status(&self, obj: &Machine) -> Result<()> {
            *self.status_patches.lock() += 1;
            self.objects.lock().insert(obj.name.clone(), obj.clone());
            Ok(())
        }
    }

    struct StatusWriter;

    #[async_trait]
    impl TypedController<Machine> for StatusWriter {
        fn name(&self) -> &str {
            "status-writer"
        }
        fn finalizing(&self) -> bool {
            true
        }
        async fn reconcile(&self, mut obj: Machine) -> (Result<ReconcileOutcome>, Option<Machine>) {
            obj.status = "ready".to_string();
            (Ok(ReconcileOutcome::done()), Some(obj))
        }
        async fn finalize(&self, mut obj: Machine) -> (Result<ReconcileOutcome>, Option<Machine>) {
            obj.status = "finalized".to_string();
            (Ok(ReconcileOutcome::done()), Some(obj))
        }
    }

    fn machine(name: &str) -> Machine {
        Machine {
            name: name.to_string(),
            spec: "v1".to_string(),
            status: String::new(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_patches_only_changed_status() {
        let client = Arc::new(FakeClient::default());
        client.objects.lock().insert("m1".to_string(), machine("m1"));

        let decorator = TypedDecorator::new(client.clone(), Arc::new(StatusWriter));
        decorator.reconcile(ReconcileRequest::new("m1")).await.unwrap();

        assert_eq!(*client.body_patches.lock(), 0);
        assert_eq!(*client.status_patches.lock(), 1);
        assert_eq!(client.objects.lock().get("m1").unwrap().status, "ready");
    }

    #[tokio::test]
    async fn test_missing_object_is_ignored() {
        let client = Arc::new(FakeClient::default());
        let decorator = TypedDecorator::new(client.clone(), Arc::new(StatusWriter));
        let outcome = decorator.reconcile(ReconcileRequest::new("ghost")).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::done());
    }

    #[tokio::test]
    async fn test_deleted_objects_dispatch_to_finalize() {
        let client = Arc::new(FakeClient::default());
        let mut doomed = machine("m1");
        doomed.deleted_at = Some(Utc::now());
        client.objects.lock().insert("m1".to_string(), doomed);

        let decorator = TypedDecorator::new(client.clone(), Arc::new(StatusWriter));
        decorator.reconcile(ReconcileRequest::new("m1")).await.unwrap();
        assert_eq!(client.objects.lock().get("m1").unwrap().status, "finalized");
    }

    #[tokio::test]
    async fn test_run_controller_processes_and_requeues() {
        struct Counting {
            seen: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl Reconciler for Counting {
            fn name(&self) -> &str {
                "counting"
            }
            async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileOutcome> {
                let mut seen = self.seen.lock();
                seen.push(request.key.clone());
                // requeue each key exactly once
                if seen.iter().filter(|k| **k == request.key).count() < 2 {
                    Ok(ReconcileOutcome::requeue_after(Duration::from_millis(1)))
                } else {
                    Ok(ReconcileOutcome::done())
                }
            }
        }

        let reconciler = Arc::new(Counting {
            seen: Mutex::new(Vec::new()),
        });
        let (tx, rx) = mpsc::channel(16);
        tx.send(ReconcileRequest::new("a")).await.unwrap();

        let runner = tokio::spawn(run_controller(
            reconciler.clone(),
            tx.clone(),
            rx,
            ControllerOptions::new().max_concurrent_reconciles(2),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(tx);
        runner.await.unwrap();

        assert_eq!(reconciler.seen.lock().len(), 2);
    }
}
