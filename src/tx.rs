//! Transaction-phase orchestration.
//!
//! Every verb handler expresses its work as an ordered list of async phases.
//! [`PhaseRunner::run`] acquires a connection, opens a transaction, drives
//! the phases, commits on success and rolls back on the first failure, and
//! releases the connection exactly once on every exit path. A phase may set
//! the context's `complete` flag to skip the remaining phases and go
//! straight to commit; conditional-request short-circuits use this so locks
//! already taken are preserved, not rolled back.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::conditional::VersionDescriptor;
use crate::patch::PatchSpec;
use crate::query::params::ParamCollector;
use crate::query::QuerySpec;
use crate::store::{FetchResult, UpdateResult};
use crate::{Error, Result};

/// An open transaction on one pooled connection.
#[async_trait]
pub trait TransactionHandle: Send {
    async fn start(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;
    /// Whether a transaction is open and neither committed nor rolled back.
    fn is_active(&self) -> bool;
}

/// The external connection pool.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    type Handle: TransactionHandle;

    async fn acquire(&self) -> Result<Self::Handle>;

    /// Return a connection to the pool. `error` is the call's failure, if
    /// any, so the pool can track connection health.
    async fn release(&self, handle: Self::Handle, error: Option<&Error>);
}

type Listener = Box<dyn FnOnce() + Send>;

/// Per-call control state shared by every operation context: the `complete`
/// early-exit flag and the commit/rollback listener registry. Listeners are
/// registered by extensions during phase execution and drained exactly once,
/// after the connection has been released.
#[derive(Default)]
pub struct CallControl {
    complete: bool,
    commit_listeners: Vec<Listener>,
    rollback_listeners: Vec<Listener>,
}

impl CallControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip all remaining phases and proceed to commit.
    pub fn set_complete(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn on_commit(&mut self, listener: impl FnOnce() + Send + 'static) {
        self.commit_listeners.push(Box::new(listener));
    }

    pub fn on_rollback(&mut self, listener: impl FnOnce() + Send + 'static) {
        self.rollback_listeners.push(Box::new(listener));
    }

    fn fire_commit(&mut self) {
        self.rollback_listeners.clear();
        for listener in self.commit_listeners.drain(..) {
            listener();
        }
    }

    fn fire_rollback(&mut self) {
        self.commit_listeners.clear();
        for listener in self.rollback_listeners.drain(..) {
            listener();
        }
    }
}

impl std::fmt::Debug for CallControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallControl")
            .field("complete", &self.complete)
            .field("commit_listeners", &self.commit_listeners.len())
            .field("rollback_listeners", &self.rollback_listeners.len())
            .finish()
    }
}

/// Context access every phase-driven operation provides.
pub trait PhaseContext {
    fn control(&self) -> &CallControl;
    fn control_mut(&mut self) -> &mut CallControl;
}

/// One step of a call's transaction. Phases communicate through the context,
/// never through return values.
pub type Phase<H, C> =
    Box<dyn for<'a> FnMut(&'a mut H, &'a mut C) -> BoxFuture<'a, Result<()>> + Send>;

/// Box a closure as a [`Phase`].
pub fn phase<H, C, F>(f: F) -> Phase<H, C>
where
    F: for<'a> FnMut(&'a mut H, &'a mut C) -> BoxFuture<'a, Result<()>> + Send + 'static,
{
    Box::new(f)
}

/// Drives one call's phase chain over a pooled connection.
pub struct PhaseRunner<P: ConnectionPool> {
    pool: P,
}

impl<P: ConnectionPool> PhaseRunner<P> {
    pub fn new(pool: P) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Run `phases` in order inside one transaction.
    ///
    /// On the first phase failure the transaction is rolled back (when still
    /// active) and the original error propagates; a failure of the rollback
    /// itself is logged and swallowed. The connection is released exactly
    /// once on every path, and the context's commit or rollback listeners
    /// fire exactly once, after release.
    pub async fn run<C>(&self, context: &mut C, mut phases: Vec<Phase<P::Handle, C>>) -> Result<()>
    where
        C: PhaseContext + Send,
    {
        let mut handle = match self.pool.acquire().await {
            Ok(handle) => handle,
            Err(err) => {
                // No connection was ever held; the call's outcome is still
                // a failure, so rollback listeners drain here.
                context.control_mut().fire_rollback();
                return Err(err);
            }
        };

        let result = Self::drive(&mut handle, context, &mut phases).await;

        if let Err(err) = &result {
            if handle.is_active() {
                if let Err(rollback_err) = handle.rollback().await {
                    tracing::warn!(
                        error = %err,
                        rollback_error = %rollback_err,
                        "rollback failed after phase error"
                    );
                }
            }
        }

        self.pool.release(handle, result.as_ref().err()).await;

        match &result {
            Ok(()) => context.control_mut().fire_commit(),
            Err(_) => context.control_mut().fire_rollback(),
        }
        result
    }

    async fn drive<C>(
        handle: &mut P::Handle,
        context: &mut C,
        phases: &mut [Phase<P::Handle, C>],
    ) -> Result<()>
    where
        C: PhaseContext + Send,
    {
        handle.start().await?;
        for phase in phases.iter_mut() {
            if context.control().is_complete() {
                break;
            }
            phase(&mut *handle, &mut *context).await?;
        }
        handle.commit().await
    }
}

macro_rules! impl_phase_context {
    ($context:ty) => {
        impl PhaseContext for $context {
            fn control(&self) -> &CallControl {
                &self.control
            }

            fn control_mut(&mut self) -> &mut CallControl {
                &mut self.control
            }
        }
    };
}

/// Context of a collection GET.
#[derive(Debug)]
pub struct SearchContext {
    pub query: QuerySpec,
    pub params: ParamCollector,
    pub results: Option<FetchResult>,
    pub version: Option<VersionDescriptor>,
    control: CallControl,
}

impl SearchContext {
    pub fn new(query: QuerySpec, params: ParamCollector) -> Self {
        Self {
            query,
            params,
            results: None,
            version: None,
            control: CallControl::new(),
        }
    }
}

/// Context of an individual GET.
#[derive(Debug)]
pub struct ReadContext {
    pub record_type: String,
    pub record_id: String,
    pub record: Option<Value>,
    pub version: Option<VersionDescriptor>,
    control: CallControl,
}

impl ReadContext {
    pub fn new(record_type: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            record_id: record_id.into(),
            record: None,
            version: None,
            control: CallControl::new(),
        }
    }
}

/// Context of a collection POST.
#[derive(Debug)]
pub struct CreateContext {
    pub record_type: String,
    pub payload: Value,
    pub created: Option<Value>,
    control: CallControl,
}

impl CreateContext {
    pub fn new(record_type: impl Into<String>, payload: Value) -> Self {
        Self {
            record_type: record_type.into(),
            payload,
            created: None,
            control: CallControl::new(),
        }
    }
}

/// Context of a PATCH, individual or bulk.
#[derive(Debug)]
pub struct UpdateContext {
    pub query: QuerySpec,
    pub params: ParamCollector,
    pub patch: PatchSpec,
    pub record: Option<Value>,
    pub update_result: Option<UpdateResult>,
    pub version: Option<VersionDescriptor>,
    control: CallControl,
}

impl UpdateContext {
    pub fn new(query: QuerySpec, params: ParamCollector, patch: PatchSpec) -> Self {
        Self {
            query,
            params,
            patch,
            record: None,
            update_result: None,
            version: None,
            control: CallControl::new(),
        }
    }
}

/// Context of a DELETE, individual or bulk.
#[derive(Debug)]
pub struct DeleteContext {
    pub query: QuerySpec,
    pub params: ParamCollector,
    pub removed: Option<u64>,
    pub version: Option<VersionDescriptor>,
    control: CallControl,
}

impl DeleteContext {
    pub fn new(query: QuerySpec, params: ParamCollector) -> Self {
        Self {
            query,
            params,
            removed: None,
            version: None,
            control: CallControl::new(),
        }
    }
}

impl_phase_context!(SearchContext);
impl_phase_context!(ReadContext);
impl_phase_context!(CreateContext);
impl_phase_context!(UpdateContext);
impl_phase_context!(DeleteContext);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    type EventLog = Arc<Mutex<Vec<String>>>;

    fn log(events: &EventLog, event: &str) {
        events.lock().unwrap().push(event.to_string());
    }

    fn logged(events: &EventLog) -> Vec<String> {
        events.lock().unwrap().clone()
    }

    struct MockHandle {
        events: EventLog,
        active: bool,
        fail_start: bool,
        fail_commit: bool,
        fail_rollback: bool,
    }

    #[async_trait]
    impl TransactionHandle for MockHandle {
        async fn start(&mut self) -> Result<()> {
            if self.fail_start {
                log(&self.events, "start-failed");
                return Err(Error::Database("cannot start".to_string()));
            }
            self.active = true;
            log(&self.events, "start");
            Ok(())
        }

        async fn commit(&mut self) -> Result<()> {
            self.active = false;
            if self.fail_commit {
                log(&self.events, "commit-failed");
                return Err(Error::Database("cannot commit".to_string()));
            }
            log(&self.events, "commit");
            Ok(())
        }

        async fn rollback(&mut self) -> Result<()> {
            self.active = false;
            if self.fail_rollback {
                log(&self.events, "rollback-failed");
                return Err(Error::Database("cannot rollback".to_string()));
            }
            log(&self.events, "rollback");
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.active
        }
    }

    #[derive(Default)]
    struct MockPoolConfig {
        fail_acquire: bool,
        fail_start: bool,
        fail_commit: bool,
        fail_rollback: bool,
    }

    struct MockPool {
        events: EventLog,
        releases: AtomicUsize,
        config: MockPoolConfig,
    }

    impl MockPool {
        fn new(events: EventLog, config: MockPoolConfig) -> Self {
            Self {
                events,
                releases: AtomicUsize::new(0),
                config,
            }
        }

        fn release_count(&self) -> usize {
            self.releases.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConnectionPool for MockPool {
        type Handle = MockHandle;

        async fn acquire(&self) -> Result<MockHandle> {
            if self.config.fail_acquire {
                return Err(Error::Database("pool exhausted".to_string()));
            }
            log(&self.events, "acquire");
            Ok(MockHandle {
                events: self.events.clone(),
                active: false,
                fail_start: self.config.fail_start,
                fail_commit: self.config.fail_commit,
                fail_rollback: self.config.fail_rollback,
            })
        }

        async fn release(&self, _handle: MockHandle, error: Option<&Error>) {
            self.releases.fetch_add(1, Ordering::SeqCst);
            log(
                &self.events,
                if error.is_some() {
                    "release-with-error"
                } else {
                    "release"
                },
            );
        }
    }

    struct TestContext {
        events: EventLog,
        control: CallControl,
    }

    impl TestContext {
        fn new(events: EventLog) -> Self {
            Self {
                events,
                control: CallControl::new(),
            }
        }
    }

    impl_phase_context!(TestContext);

    fn noting(event: &'static str) -> Phase<MockHandle, TestContext> {
        phase(move |_handle: &mut MockHandle, cx: &mut TestContext| {
            Box::pin(async move {
                log(&cx.events, event);
                Ok(())
            })
        })
    }

    fn failing(message: &'static str, after_await: bool) -> Phase<MockHandle, TestContext> {
        phase(move |_handle: &mut MockHandle, _cx: &mut TestContext| {
            Box::pin(async move {
                if after_await {
                    tokio::task::yield_now().await;
                }
                Err(Error::Data(message.to_string()))
            })
        })
    }

    fn runner(config: MockPoolConfig) -> (PhaseRunner<MockPool>, EventLog) {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let runner = PhaseRunner::new(MockPool::new(events.clone(), config));
        (runner, events)
    }

    #[tokio::test]
    async fn success_commits_and_releases_once() {
        let (runner, events) = runner(MockPoolConfig::default());
        let mut cx = TestContext::new(events.clone());

        let committed = Arc::new(AtomicUsize::new(0));
        let seen = committed.clone();
        cx.control_mut().on_commit(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        runner
            .run(&mut cx, vec![noting("p1"), noting("p2"), noting("p3")])
            .await
            .unwrap();

        assert_eq!(
            logged(&events),
            ["acquire", "start", "p1", "p2", "p3", "commit", "release"]
        );
        assert_eq!(runner.pool().release_count(), 1);
        assert_eq!(committed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn immediate_phase_failure_rolls_back_and_releases_once() {
        let (runner, events) = runner(MockPoolConfig::default());
        let mut cx = TestContext::new(events.clone());

        let err = runner
            .run(
                &mut cx,
                vec![noting("p1"), failing("boom", false), noting("p3")],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Data(message) if message == "boom"));
        assert_eq!(
            logged(&events),
            ["acquire", "start", "p1", "rollback", "release-with-error"]
        );
        assert_eq!(runner.pool().release_count(), 1);
    }

    #[tokio::test]
    async fn deferred_phase_failure_rolls_back_and_releases_once() {
        let (runner, events) = runner(MockPoolConfig::default());
        let mut cx = TestContext::new(events.clone());

        let rolled_back = Arc::new(AtomicUsize::new(0));
        let seen = rolled_back.clone();
        cx.control_mut().on_rollback(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let err = runner
            .run(
                &mut cx,
                vec![noting("p1"), failing("boom", true), noting("p3")],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Data(message) if message == "boom"));
        assert_eq!(
            logged(&events),
            ["acquire", "start", "p1", "rollback", "release-with-error"]
        );
        assert_eq!(runner.pool().release_count(), 1);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_failure_releases_without_rollback() {
        let (runner, events) = runner(MockPoolConfig {
            fail_start: true,
            ..Default::default()
        });
        let mut cx = TestContext::new(events.clone());

        let err = runner.run(&mut cx, vec![noting("p1")]).await.unwrap_err();

        assert!(matches!(err, Error::Database(_)));
        assert_eq!(
            logged(&events),
            ["acquire", "start-failed", "release-with-error"]
        );
        assert_eq!(runner.pool().release_count(), 1);
    }

    #[tokio::test]
    async fn commit_failure_releases_once_with_the_commit_error() {
        let (runner, events) = runner(MockPoolConfig {
            fail_commit: true,
            ..Default::default()
        });
        let mut cx = TestContext::new(events.clone());

        let rolled_back = Arc::new(AtomicUsize::new(0));
        let seen = rolled_back.clone();
        cx.control_mut().on_rollback(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let err = runner.run(&mut cx, vec![noting("p1")]).await.unwrap_err();

        assert!(matches!(err, Error::Database(message) if message == "cannot commit"));
        assert_eq!(
            logged(&events),
            ["acquire", "start", "p1", "commit-failed", "release-with-error"]
        );
        assert_eq!(runner.pool().release_count(), 1);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acquire_failure_fires_rollback_listeners_without_release() {
        let (runner, events) = runner(MockPoolConfig {
            fail_acquire: true,
            ..Default::default()
        });
        let mut cx = TestContext::new(events.clone());

        let rolled_back = Arc::new(AtomicUsize::new(0));
        let seen = rolled_back.clone();
        cx.control_mut().on_rollback(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let err = runner.run(&mut cx, vec![noting("p1")]).await.unwrap_err();

        assert!(matches!(err, Error::Database(_)));
        assert!(logged(&events).is_empty());
        assert_eq!(runner.pool().release_count(), 0);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rollback_failure_is_swallowed_and_the_original_error_propagates() {
        let (runner, events) = runner(MockPoolConfig {
            fail_rollback: true,
            ..Default::default()
        });
        let mut cx = TestContext::new(events.clone());

        let err = runner
            .run(&mut cx, vec![failing("boom", false)])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Data(message) if message == "boom"));
        assert_eq!(
            logged(&events),
            ["acquire", "start", "rollback-failed", "release-with-error"]
        );
        assert_eq!(runner.pool().release_count(), 1);
    }

    #[tokio::test]
    async fn complete_flag_skips_remaining_phases_and_commits() {
        let (runner, events) = runner(MockPoolConfig::default());
        let mut cx = TestContext::new(events.clone());

        let completing = phase(|_handle: &mut MockHandle, cx: &mut TestContext| {
            Box::pin(async move {
                log(&cx.events, "p1");
                cx.control_mut().set_complete();
                Ok(())
            })
        });

        runner
            .run(&mut cx, vec![completing, noting("p2"), noting("p3")])
            .await
            .unwrap();

        assert_eq!(logged(&events), ["acquire", "start", "p1", "commit", "release"]);
        assert_eq!(runner.pool().release_count(), 1);
    }

    #[tokio::test]
    async fn listeners_for_the_other_outcome_are_dropped() {
        let (runner, events) = runner(MockPoolConfig::default());
        let mut cx = TestContext::new(events);

        let committed = Arc::new(AtomicUsize::new(0));
        let rolled_back = Arc::new(AtomicUsize::new(0));
        let on_commit = committed.clone();
        let on_rollback = rolled_back.clone();
        cx.control_mut().on_commit(move || {
            on_commit.fetch_add(1, Ordering::SeqCst);
        });
        cx.control_mut().on_rollback(move || {
            on_rollback.fetch_add(1, Ordering::SeqCst);
        });

        runner.run(&mut cx, vec![noting("p1")]).await.unwrap();

        assert_eq!(committed.load(Ordering::SeqCst), 1);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn search_context_accumulates_results_through_phases() {
        let (runner, _events) = runner(MockPoolConfig::default());

        let compiled = QuerySpec {
            record_type: "Order".to_string(),
            projection: Vec::new(),
            filter: None,
            ordering: Vec::new(),
            range: None,
        };
        let mut cx = SearchContext::new(compiled, ParamCollector::new());

        let fetch = phase(|_handle: &mut MockHandle, cx: &mut SearchContext| {
            Box::pin(async move {
                cx.results = Some(FetchResult {
                    records: vec![serde_json::json!({ "id": 1 })],
                    referred: Vec::new(),
                    count: Some(1),
                });
                Ok(())
            })
        });

        runner.run(&mut cx, vec![fetch]).await.unwrap();
        assert_eq!(cx.results.unwrap().count, Some(1));
    }
}
