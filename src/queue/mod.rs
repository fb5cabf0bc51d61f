//! 编排队列：通过闸门链将多个服务串联起来，在显式启动后才开始执行。
//!
//! # Orchestration Queue
//!
//! The queue sequences [`ScriptService`] loads. Each queued service gets a composite
//! gate: "the queue has started, then the predecessor settled". Predecessors can be
//! another service's load, a wait primitive or a document readiness condition, so
//! chains form a graph of completion-then-begin edges. Independent chains run
//! concurrently once the queue starts.
//!
//! A predecessor that fails still releases its gate; the failure is only logged.
//!
//! ```rust,no_run
//! use scriptflow::host::{Host, RecordingInjector};
//! use scriptflow::queue::{Predecessor, ScriptQueue};
//! use scriptflow::service::{ScriptService, ServiceConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> scriptflow::Result<()> {
//! let host = Host::builder()
//!     .with_injector(Arc::new(RecordingInjector::new()))
//!     .build()?;
//! let queue = ScriptQueue::new(host.clone());
//!
//! let consent = Arc::new(ScriptService::new(
//!     ServiceConfig::new().with_name("consent").with_url("https://cmp.example/cmp.js"),
//!     host.clone(),
//! ));
//! let ads = Arc::new(ScriptService::new(
//!     ServiceConfig::new().with_name("gpt").with_url("https://ads.example/gpt.js"),
//!     host,
//! ));
//!
//! let _ = queue.enqueue(&consent, None);
//! let _ = queue.enqueue(&ads, Some(Predecessor::service(&consent)));
//! queue.start();
//! # Ok(())
//! # }
//! ```

use crate::error::LoadFailed;
use crate::host::{Host, ReadyState};
use crate::idle::IdleConfig;
use crate::service::gate::{self, Gate};
use crate::service::{LoadHandle, ScriptService};
use crate::wait::{self, WaitTask};
use crate::{Error, ErrorContext, Result};
use futures::future::{BoxFuture, FutureExt};
use once_cell::sync::OnceCell;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// What a queued service waits for after the queue has started.
///
/// Invoked at most once, and only after the start signal.
pub struct Predecessor(Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>);

impl Predecessor {
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self(Box::new(move || f().boxed()))
    }

    /// Wait for a gate.
    pub fn gate(gate: Gate) -> Self {
        Self::from_fn(move || async move {
            gate.await;
            Ok(())
        })
    }

    /// Wait for another service's load to settle, successfully or not.
    pub fn service(service: &Arc<ScriptService>) -> Self {
        let service = service.clone();
        Self::from_fn(move || async move {
            service.load().await.map_err(|LoadFailed| {
                Error::runtime_with_context(
                    "predecessor service failed to load",
                    ErrorContext::new()
                        .with_details(service.element_id().unwrap_or_default())
                        .with_source("script_queue"),
                )
            })
        })
    }

    /// Run a wait primitive with its own token.
    pub fn wait(task: WaitTask) -> Self {
        Self::from_fn(move || task(CancellationToken::new()))
    }

    /// Wait for the first of several wait primitives.
    pub fn first_of(tasks: Vec<WaitTask>) -> Self {
        Self::from_fn(move || wait::on_first_of(tasks, None))
    }

    pub fn duration(host: &Host, duration: Duration) -> Self {
        Self::wait(wait::duration_task(host.clock.clone(), duration))
    }

    pub fn idle(host: &Host, config: IdleConfig) -> Self {
        Self::wait(wait::idle_task(host.idle.clone(), host.clock.clone(), config))
    }

    pub fn user_activity(host: &Host) -> Self {
        Self::wait(wait::user_activity_task(host.activity.clone()))
    }

    fn run(self) -> BoxFuture<'static, Result<()>> {
        (self.0)()
    }
}

/// Global sequencer of service loads.
pub struct ScriptQueue {
    host: Host,
    started_tx: watch::Sender<bool>,
    started: Gate,
    now: OnceCell<Gate>,
    interactive: OnceCell<Gate>,
    complete: OnceCell<Gate>,
    default_gate: OnceCell<Gate>,
}

impl ScriptQueue {
    pub fn new(host: Host) -> Self {
        let (started_tx, mut rx) = watch::channel(false);
        let started = gate::from_future(async move {
            let released = rx.wait_for(|started| *started).await.is_ok();
            if !released {
                // Queue dropped before start: stay closed.
                futures::future::pending::<()>().await;
            }
        });
        Self {
            host,
            started_tx,
            started,
            now: OnceCell::new(),
            interactive: OnceCell::new(),
            complete: OnceCell::new(),
            default_gate: OnceCell::new(),
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Open immediately.
    pub fn now(&self) -> Gate {
        self.now.get_or_init(gate::open).clone()
    }

    /// Open once the document is interactive or complete.
    pub fn when_document_interactive(&self) -> Gate {
        self.interactive
            .get_or_init(|| self.readiness_gate(ReadyState::Interactive))
            .clone()
    }

    /// Open once the document is complete.
    pub fn when_document_complete(&self) -> Gate {
        self.complete
            .get_or_init(|| self.readiness_gate(ReadyState::Complete))
            .clone()
    }

    fn readiness_gate(&self, state: ReadyState) -> Gate {
        let document = self.host.document.clone();
        gate::from_future(async move { document.wait_until(state).await })
    }

    /// Queue started and [`ScriptQueue::now`] open.
    pub fn default_gate(&self) -> Gate {
        self.default_gate
            .get_or_init(|| {
                let started = self.started.clone();
                let now = self.now();
                gate::from_future(async move {
                    started.await;
                    now.await;
                })
            })
            .clone()
    }

    /// Gate `service` behind the start signal and `predecessor`, then start its load.
    ///
    /// Without a predecessor the service waits for [`ScriptQueue::default_gate`].
    /// Failures of the predecessor and of the load itself are swallowed here; the load
    /// reports through its own failure hook. The returned handle is for observation
    /// only. A service whose load already started keeps its previous gate.
    pub fn enqueue(&self, service: &ScriptService, predecessor: Option<Predecessor>) -> LoadHandle {
        let started = self.started.clone();
        let predecessor =
            predecessor.unwrap_or_else(|| Predecessor::gate(self.default_gate()));
        let name = service.element_id().unwrap_or_default();

        if service.has_started() {
            tracing::warn!(service = name.as_str(), "service already loading, gate not replaced");
        }

        service.set_gate(gate::from_future(async move {
            started.await;
            if let Err(e) = predecessor.run().await {
                tracing::debug!(
                    service = name.as_str(),
                    error = %e,
                    "predecessor failed, releasing gate anyway"
                );
            }
        }));
        service.load()
    }

    /// Release every queued gate chain. Only the first call has an effect.
    pub fn start(&self) -> bool {
        let first = self.started_tx.send_if_modified(|started| {
            if *started {
                false
            } else {
                *started = true;
                true
            }
        });
        if first {
            tracing::info!("script queue started");
        }
        first
    }

    pub fn is_started(&self) -> bool {
        *self.started_tx.borrow()
    }
}
