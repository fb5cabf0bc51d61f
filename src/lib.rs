//! # scriptflow
//!
//! 第三方脚本编排核心：受闸门控制的单次加载、空闲检测与广告位生命周期管理。
//!
//! Orchestration core for third-party scripts (ads, consent, analytics, tag managers):
//! decides *when* each script runs so that none of them blocks rendering or shifts the
//! layout.
//!
//! ## Overview
//!
//! Scripts are modelled as [`service::ScriptService`]s that load at most once behind a
//! gate. The [`queue::ScriptQueue`] chains those gates together: a service may wait for
//! another service, for document readiness, for user activity or for the page to go
//! idle, and nothing runs until the queue is started. Ad slots sit on top of one
//! service and keep their own retry and refresh schedule.
//!
//! Everything the page provides (injecting a script, idle callbacks, input events,
//! readiness, the clock) is reached through the [`host::Host`] collaborators, so the
//! whole core runs deterministically under a paused tokio clock.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scriptflow::host::{Host, RecordingInjector};
//! use scriptflow::queue::{Predecessor, ScriptQueue};
//! use scriptflow::service::{ServiceConfigPatch, ServiceRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> scriptflow::Result<()> {
//!     let host = Host::builder()
//!         .with_injector(Arc::new(RecordingInjector::new()))
//!         .build()?;
//!     let registry = ServiceRegistry::new(host.clone());
//!     let queue = ScriptQueue::new(host.clone());
//!
//!     registry.configure(
//!         "consent",
//!         &ServiceConfigPatch::new().name("consent").url("https://cmp.example/cmp.js"),
//!     );
//!     registry.configure(
//!         "analytics",
//!         &ServiceConfigPatch::new().name("analytics").url("https://stats.example/a.js"),
//!     );
//!
//!     let consent = registry.instance("consent");
//!     let _ = queue.enqueue(&consent, None);
//!     let _ = queue.enqueue(
//!         &registry.instance("analytics"),
//!         Some(Predecessor::service(&consent)),
//!     );
//!     queue.start();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`host`] | Page collaborators: clock, injector, idle callbacks, input, readiness |
//! | [`idle`] | Idle estimation over a sliding window of frames |
//! | [`wait`] | Cancellable wait primitives and races |
//! | [`service`] | Single-flight script services and their registry |
//! | [`queue`] | Orchestration queue chaining service gates |
//! | [`ad`] | Ad slot status, retry and refresh state machine |
//! | [`config`] | Boot file loading (YAML / JSON) |

pub mod ad;
pub mod config;
pub mod host;
pub mod idle;
pub mod queue;
pub mod service;
pub mod wait;

// Re-export main types for convenience
pub use ad::{AdService, AdSlot, AdSlotConfig, AdStatus, StatusFeed};
pub use config::BootConfig;
pub use host::{Host, HostBuilder};
pub use idle::IdleConfig;
pub use queue::{Predecessor, ScriptQueue};
pub use service::{ScriptService, ServiceConfig, ServiceConfigPatch, ServiceRegistry};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext, LoadFailed};
