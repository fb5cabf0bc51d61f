//! 宿主环境抽象：时钟、脚本注入、空闲回调、用户活动与文档就绪状态。
//!
//! # Host Collaborators
//!
//! The orchestration core never talks to a browser directly. Everything it needs from
//! the page is expressed as a small trait or channel in this module and bundled into a
//! [`Host`], so the core can run against a real page adapter or against the in-memory
//! doubles shipped here.
//!
//! | Collaborator | Description |
//! |--------------|-------------|
//! | [`Clock`] | Current instant and cancellable sleeps ([`TokioClock`]) |
//! | [`ScriptInjector`] | Inject a script element and await its load |
//! | [`HintInjector`] | Fire-and-forget resource hints |
//! | [`IdleScheduler`] | One "when idle" callback per request ([`SimulatedIdleScheduler`]) |
//! | [`ActivityBus`] | Stream of user interaction events |
//! | [`DocumentReadiness`] | Document ready-state transitions |

mod activity;
mod clock;
mod document;
mod idle;
mod recording;

pub use activity::{ActivityBus, ActivityKind};
pub use clock::TokioClock;
pub use document::{DocumentReadiness, ReadyState};
pub use idle::{IdleFrame, SimulatedIdleScheduler};
pub use recording::{InjectionRecord, RecordingHints, RecordingInjector};

use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Source of time for every timer in the crate.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Injects a script element and resolves once it has loaded.
#[async_trait]
pub trait ScriptInjector: Send + Sync {
    async fn inject(
        &self,
        element_id: &str,
        url: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Relation kind of a resource hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HintRel {
    Preconnect,
    DnsPrefetch,
    Preload,
    Prefetch,
}

impl HintRel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HintRel::Preconnect => "preconnect",
            HintRel::DnsPrefetch => "dns-prefetch",
            HintRel::Preload => "preload",
            HintRel::Prefetch => "prefetch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHint {
    pub rel: HintRel,
    pub href: String,
    pub attributes: BTreeMap<String, String>,
}

impl ResourceHint {
    pub fn new(rel: HintRel, href: impl Into<String>) -> Self {
        Self {
            rel,
            href: href.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Inserts resource hints into the document. Never fails.
pub trait HintInjector: Send + Sync {
    fn insert_hint(&self, hint: ResourceHint);
}

/// Hint injector that drops everything.
pub struct NoopHintInjector;

impl HintInjector for NoopHintInjector {
    fn insert_hint(&self, _hint: ResourceHint) {}
}

/// What a single idle callback observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleDeadline {
    /// Idle time left in the current frame when the callback ran.
    pub time_remaining: Duration,
    /// The scheduler's own timeout fired before an idle period was found.
    pub did_timeout: bool,
}

/// Schedules one "when idle" callback per call.
#[async_trait]
pub trait IdleScheduler: Send + Sync {
    async fn request_idle(&self, timeout: Duration) -> IdleDeadline;
}

/// Bundle of page collaborators shared by services, queues and slots.
#[derive(Clone)]
pub struct Host {
    pub clock: Arc<dyn Clock>,
    pub injector: Arc<dyn ScriptInjector>,
    pub hints: Arc<dyn HintInjector>,
    pub idle: Arc<dyn IdleScheduler>,
    pub activity: ActivityBus,
    pub document: DocumentReadiness,
}

impl Host {
    pub fn builder() -> HostBuilder {
        HostBuilder::new()
    }
}

/// Builder for [`Host`]. Only the script injector is mandatory.
///
/// Defaults for the rest: [`TokioClock`], no resource hints, a fresh
/// [`ActivityBus`] and [`DocumentReadiness`], and a [`SimulatedIdleScheduler`]
/// replaying a quiet page. The simulated scheduler never observes real frames, so a
/// page adapter must pass its own scheduler through [`HostBuilder::with_idle`];
/// without one, every idle gate opens after roughly one frame.
pub struct HostBuilder {
    clock: Option<Arc<dyn Clock>>,
    injector: Option<Arc<dyn ScriptInjector>>,
    hints: Option<Arc<dyn HintInjector>>,
    idle: Option<Arc<dyn IdleScheduler>>,
    activity: Option<ActivityBus>,
    document: Option<DocumentReadiness>,
}

impl HostBuilder {
    pub fn new() -> Self {
        Self {
            clock: None,
            injector: None,
            hints: None,
            idle: None,
            activity: None,
            document: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_injector(mut self, injector: Arc<dyn ScriptInjector>) -> Self {
        self.injector = Some(injector);
        self
    }

    pub fn with_hints(mut self, hints: Arc<dyn HintInjector>) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn with_idle(mut self, idle: Arc<dyn IdleScheduler>) -> Self {
        self.idle = Some(idle);
        self
    }

    pub fn with_activity(mut self, activity: ActivityBus) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn with_document(mut self, document: DocumentReadiness) -> Self {
        self.document = Some(document);
        self
    }

    /// Whether an idle scheduler was given explicitly.
    pub fn has_idle(&self) -> bool {
        self.idle.is_some()
    }

    pub fn build(self) -> Result<Host> {
        let injector = self.injector.ok_or_else(|| {
            Error::configuration_with_context(
                "a script injector is required",
                ErrorContext::new()
                    .with_field_path("injector")
                    .with_source("host_builder"),
            )
        })?;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(TokioClock));
        let idle = match self.idle {
            Some(idle) => idle,
            None => {
                tracing::debug!("no idle scheduler given, using the simulated quiet page");
                Arc::new(SimulatedIdleScheduler::new(clock.clone()))
            }
        };
        Ok(Host {
            clock,
            injector,
            hints: self.hints.unwrap_or_else(|| Arc::new(NoopHintInjector)),
            idle,
            activity: self.activity.unwrap_or_default(),
            document: self.document.unwrap_or_default(),
        })
    }
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self::new()
    }
}
