//! 可加载服务：按需、至多一次地加载一个外部脚本，并受前置闸门控制。
//!
//! # Loadable Services
//!
//! A [`ScriptService`] loads exactly one external script, at most once. Loading is
//! single-flight: the first [`ScriptService::load`] starts the pipeline and every later
//! or concurrent call shares the same [`LoadHandle`].
//!
//! The pipeline:
//!
//! 1. await the service [`Gate`] (captured when the load starts)
//! 2. check that `name` and `url` are configured
//! 3. inject the script under an element id derived from the name
//! 4. on success flip [`ScriptService::loaded`] and run [`ServiceHooks::on_loaded`];
//!    on failure run [`ServiceHooks::on_failed`] and settle with [`LoadFailed`]
//!
//! Nothing is retried at this layer.
//!
//! ```rust,no_run
//! use scriptflow::host::{Host, RecordingInjector};
//! use scriptflow::service::{ScriptService, ServiceConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> scriptflow::Result<()> {
//! let host = Host::builder()
//!     .with_injector(Arc::new(RecordingInjector::new()))
//!     .build()?;
//! let analytics = ScriptService::new(
//!     ServiceConfig::new()
//!         .with_name("Analytics")
//!         .with_url("https://stats.example/a.js"),
//!     host,
//! );
//! let ok = analytics.load().await.is_ok();
//! # let _ = ok;
//! # Ok(())
//! # }
//! ```

mod config;
pub mod gate;
mod registry;

pub use config::{ServiceConfig, ServiceConfigPatch};
pub use gate::Gate;
pub use registry::ServiceRegistry;

use crate::error::LoadFailed;
use crate::host::{HintRel, Host, ResourceHint};
use crate::Error;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Shared outcome of a service load. Every clone settles with the same value.
pub type LoadHandle = Shared<BoxFuture<'static, std::result::Result<(), LoadFailed>>>;

/// Extension points around a load.
#[async_trait]
pub trait ServiceHooks: Send + Sync {
    /// Runs once, after the script loaded.
    async fn on_loaded(&self, _config: &ServiceConfig) {}

    /// Runs once, when the load failed. The error never reaches the callers of `load`.
    async fn on_failed(&self, config: &ServiceConfig, error: &Error) {
        log_failure(config, error);
    }
}

/// Default hooks: log failures, nothing else.
pub struct LoggingHooks;

impl ServiceHooks for LoggingHooks {}

/// Default failure diagnostic. Loud only for services configured with `debug`.
pub fn log_failure(config: &ServiceConfig, error: &Error) {
    let service = config.name.as_deref().unwrap_or("<unnamed>");
    if config.debug {
        tracing::warn!(service, error = %error, "script service failed to load");
    } else {
        tracing::debug!(service, error = %error, "script service failed to load");
    }
}

/// A single external script with a gated, single-flight load.
pub struct ScriptService {
    config: ServiceConfig,
    host: Host,
    hooks: Arc<dyn ServiceHooks>,
    gate: Mutex<Gate>,
    load_result: OnceCell<LoadHandle>,
    loaded: Arc<AtomicBool>,
}

impl ScriptService {
    /// Build a service from a config snapshot. The config is not validated here.
    pub fn new(config: ServiceConfig, host: Host) -> Self {
        Self {
            config,
            host,
            hooks: Arc::new(LoggingHooks),
            gate: Mutex::new(gate::open()),
            load_result: OnceCell::new(),
            loaded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ServiceHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn element_id(&self) -> Option<String> {
        self.config.element_id()
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn gate(&self) -> Gate {
        self.lock_gate().clone()
    }

    /// Replace the gate. A load that already started keeps the gate it captured.
    pub fn set_gate(&self, gate: Gate) {
        *self.lock_gate() = gate;
    }

    /// The script finished loading successfully.
    pub fn loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// `load` has been called at least once.
    pub fn has_started(&self) -> bool {
        self.load_result.get().is_some()
    }

    /// Started but not settled yet.
    pub fn is_loading(&self) -> bool {
        self.load_result
            .get()
            .map_or(false, |handle| handle.peek().is_none())
    }

    /// Load the script, once.
    ///
    /// The first call starts the pipeline on the tokio runtime, so it makes progress even
    /// if nobody awaits the returned handle. Later calls return a clone of the same
    /// handle and never inject twice.
    ///
    /// # Panics
    ///
    /// The first call panics when made outside a tokio runtime.
    pub fn load(&self) -> LoadHandle {
        self.load_result
            .get_or_init(|| {
                let handle = self.load_task().boxed().shared();
                tokio::spawn(handle.clone());
                handle
            })
            .clone()
    }

    fn load_task(&self) -> impl std::future::Future<Output = Result<(), LoadFailed>> + Send + 'static {
        let gate = self.gate();
        let config = self.config.clone();
        let injector = self.host.injector.clone();
        let clock = self.host.clock.clone();
        let hooks = self.hooks.clone();
        let loaded = self.loaded.clone();

        async move {
            gate.await;

            let outcome = match config.load_target() {
                Ok(target) => {
                    tracing::debug!(
                        service = target.element_id.as_str(),
                        url = target.url.as_str(),
                        "injecting script"
                    );
                    let start = clock.now();
                    injector
                        .inject(&target.element_id, &target.url, &config.script_attributes)
                        .await
                        .map(|()| (target, start))
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok((target, start)) => {
                    loaded.store(true, Ordering::Release);
                    tracing::info!(
                        service = target.element_id.as_str(),
                        url = target.url.as_str(),
                        duration_ms = (clock.now() - start).as_millis() as u64,
                        "script loaded"
                    );
                    hooks.on_loaded(&config).await;
                    Ok(())
                }
                Err(e) => {
                    hooks.on_failed(&config, &e).await;
                    Err(LoadFailed)
                }
            }
        }
    }

    /// Hint the browser about the script ahead of loading it.
    ///
    /// Fire-and-forget and independent of `load`: may be called any number of times.
    /// Hints are inserted after a minimal delay, off the caller's path.
    pub fn preload(&self) {
        let Some(url) = self.config.url.clone() else {
            tracing::debug!(
                service = self.config.name.as_deref().unwrap_or("<unnamed>"),
                "preload skipped, no url configured"
            );
            return;
        };
        let hints = self.host.hints.clone();
        let clock = self.host.clock.clone();

        tokio::spawn(async move {
            clock.sleep(Duration::ZERO).await;
            if let Some(origin) = origin_of(&url) {
                hints.insert_hint(ResourceHint::new(HintRel::Preconnect, origin));
            }
            hints.insert_hint(ResourceHint::new(HintRel::Preload, url).with_attribute("as", "script"));
        });
    }

    fn lock_gate(&self) -> std::sync::MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ScriptService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptService")
            .field("name", &self.config.name)
            .field("url", &self.config.url)
            .field("started", &self.has_started())
            .field("loaded", &self.loaded())
            .finish_non_exhaustive()
    }
}

fn origin_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let origin = parsed.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}
