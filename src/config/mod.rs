//! 启动配置：从 YAML 或 JSON 文件声明服务、闸门与广告位。
//!
//! # Boot Configuration
//!
//! A boot file declares the services of a page, the gate each one waits for and the
//! ad slots to create. Configuration is a boot-time operation: [`BootConfig::apply`]
//! merges every service template into the registry and enqueues the services in file
//! order. Nothing runs until the queue is started.
//!
//! ```yaml
//! idle:
//!   overall_timeout_ms: 5000
//! services:
//!   - kind: consent
//!     config: { name: consent, url: "https://cmp.example/cmp.js" }
//!   - kind: gpt
//!     config: { name: gpt, url: "https://ads.example/gpt.js" }
//!     after: { service: consent }
//!   - kind: analytics
//!     config: { name: analytics, url: "https://stats.example/a.js" }
//!     after: idle
//! ad_library: gpt
//! slots:
//!   - id: top
//!     config: { retry_delay: 5, retry_count: 3, refresh_interval: 30 }
//! ```

use crate::ad::{AdService, AdSlot, AdSlotConfig, SlotRenderer};
use crate::idle::IdleConfig;
use crate::queue::{Predecessor, ScriptQueue};
use crate::service::{ScriptService, ServiceConfigPatch, ServiceRegistry};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable holding the boot file path.
pub const CONFIG_ENV: &str = "SCRIPTFLOW_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    pub services: Vec<ServiceEntry>,
    /// Options of every `idle` gate in this file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle: Option<IdleOptions>,
    /// Service kind acting as the ad library for `slots`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ad_library: Option<String>,
    pub slots: Vec<SlotEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub kind: String,
    #[serde(default)]
    pub config: ServiceConfigPatch,
    /// Predecessor gate; the queue default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<GateSpec>,
}

/// What a service waits for once the queue has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateSpec {
    Now,
    Interactive,
    Complete,
    Idle,
    UserActivity,
    DurationMs(u64),
    /// The load of an earlier service in the same file.
    Service(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_idle_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_idle_duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_timeout_ms: Option<u64>,
}

impl IdleOptions {
    pub fn to_config(&self) -> Result<IdleConfig> {
        let mut config = IdleConfig::default();
        if let Some(ratio) = self.min_idle_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(invalid("idle.min_idle_ratio", format!("{ratio} is outside 0..=1")));
            }
            config = config.with_min_idle_ratio(ratio);
        }
        if let Some(ms) = self.min_idle_duration_ms {
            let duration = Duration::try_from_secs_f64(ms / 1000.0)
                .map_err(|e| invalid("idle.min_idle_duration_ms", e.to_string()))?;
            config = config.with_min_idle_duration(duration);
        }
        if let Some(ms) = self.overall_timeout_ms {
            config = config.with_overall_timeout(Duration::from_millis(ms));
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotEntry {
    pub id: String,
    #[serde(default)]
    pub config: AdSlotConfig,
}

fn invalid(field: impl Into<String>, details: impl Into<String>) -> Error {
    Error::configuration_with_context(
        "invalid boot configuration",
        ErrorContext::new()
            .with_field_path(field)
            .with_details(details)
            .with_source("boot_config"),
    )
}

impl BootConfig {
    /// Parse YAML. Gates with a value are written as single-key maps
    /// (`after: { service: consent }`), gates without one as plain strings.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let deserializer = serde_yaml::Deserializer::from_str(content);
        Ok(serde_yaml::with::singleton_map_recursive::deserialize(
            deserializer,
        )?)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Read a boot file, YAML or JSON depending on the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_ascii_lowercase);
        let json = match extension.as_deref() {
            Some("json") => true,
            Some("yaml") | Some("yml") => false,
            _ => {
                return Err(Error::configuration_with_context(
                    "unsupported boot file format",
                    ErrorContext::new()
                        .with_details(path.to_string_lossy().to_string())
                        .with_source("boot_config"),
                ))
            }
        };

        let content = tokio::fs::read_to_string(path).await?;
        let config = if json {
            Self::from_json_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };
        tracing::debug!(
            path = %path.display(),
            services = config.services.len(),
            slots = config.slots.len(),
            "boot config loaded"
        );
        Ok(config)
    }

    /// Read the boot file named by `SCRIPTFLOW_CONFIG`.
    pub async fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).map_err(|_| {
            Error::configuration_with_context(
                "boot file path is not set",
                ErrorContext::new()
                    .with_field_path(CONFIG_ENV)
                    .with_source("boot_config"),
            )
        })?;
        Self::from_path(path).await
    }

    /// Check references and options without touching any registry.
    pub fn validate(&self) -> Result<()> {
        let mut declared = HashSet::new();
        for (i, entry) in self.services.iter().enumerate() {
            if entry.kind.trim().is_empty() {
                return Err(invalid(format!("services[{i}].kind"), "empty service kind"));
            }
            if let Some(GateSpec::Service(kind)) = &entry.after {
                if !declared.contains(kind.as_str()) {
                    return Err(invalid(
                        format!("services[{i}].after"),
                        format!("service '{kind}' must be declared before '{}'", entry.kind),
                    ));
                }
            }
            if !declared.insert(entry.kind.as_str()) {
                return Err(invalid(
                    format!("services[{i}].kind"),
                    format!("duplicate service kind '{}'", entry.kind),
                ));
            }
        }
        if let Some(idle) = &self.idle {
            idle.to_config()?;
        }
        if !self.slots.is_empty() {
            match &self.ad_library {
                Some(kind) if declared.contains(kind.as_str()) => {}
                Some(kind) => {
                    return Err(invalid("ad_library", format!("unknown service '{kind}'")));
                }
                None => return Err(invalid("ad_library", "slots need an ad library")),
            }
        }
        Ok(())
    }

    /// Merge every service template into `registry`.
    ///
    /// Idempotent: merging the same patches again leaves the templates unchanged.
    pub fn configure(&self, registry: &ServiceRegistry) {
        for entry in &self.services {
            registry.configure(&entry.kind, &entry.config);
        }
    }

    /// Configure every service template, then enqueue the services in file order.
    ///
    /// Returns the queued singletons in file order.
    pub fn apply(
        &self,
        registry: &ServiceRegistry,
        queue: &ScriptQueue,
    ) -> Result<Vec<Arc<ScriptService>>> {
        self.validate()?;
        let idle = self
            .idle
            .as_ref()
            .map(IdleOptions::to_config)
            .transpose()?
            .unwrap_or_default();

        self.configure(registry);

        let host = queue.host();
        let mut queued = Vec::with_capacity(self.services.len());
        for entry in &self.services {
            let predecessor = entry.after.as_ref().map(|spec| match spec {
                GateSpec::Now => Predecessor::gate(queue.now()),
                GateSpec::Interactive => Predecessor::gate(queue.when_document_interactive()),
                GateSpec::Complete => Predecessor::gate(queue.when_document_complete()),
                GateSpec::Idle => Predecessor::idle(host, idle),
                GateSpec::UserActivity => Predecessor::user_activity(host),
                GateSpec::DurationMs(ms) => Predecessor::duration(host, Duration::from_millis(*ms)),
                GateSpec::Service(kind) => Predecessor::service(&registry.instance(kind)),
            });
            let service = registry.instance(&entry.kind);
            // Outcomes are reported through the service hooks.
            let _ = queue.enqueue(&service, predecessor);
            tracing::debug!(kind = entry.kind.as_str(), after = ?entry.after, "service queued");
            queued.push(service);
        }
        Ok(queued)
    }

    /// Ad service over the `ad_library` singleton plus one slot per entry.
    ///
    /// Creates the library singleton from the configured templates. Call before
    /// [`BootConfig::apply`] so that singleton gets the feed hooks.
    pub fn ad_slots(
        &self,
        registry: &ServiceRegistry,
        renderer: Arc<dyn SlotRenderer>,
    ) -> Result<Option<(AdService, Vec<AdSlot>)>> {
        self.validate()?;
        let Some(kind) = &self.ad_library else {
            return Ok(None);
        };
        self.configure(registry);
        let ads = AdService::from_registry(registry, kind, renderer);
        let slots = self
            .slots
            .iter()
            .map(|entry| ads.slot(entry.id.clone(), entry.config.clone()))
            .collect();
        Ok(Some((ads, slots)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Host, RecordingInjector};

    const BOOT: &str = r#"
idle:
  overall_timeout_ms: 5000
services:
  - kind: consent
    config: { name: consent, url: "https://cmp.example/cmp.js" }
    after: now
  - kind: gpt
    config: { name: gpt, url: "https://ads.example/gpt.js", debug: true }
    after: { service: consent }
  - kind: analytics
    config: { name: analytics, url: "https://stats.example/a.js" }
    after: { duration_ms: 300 }
  - kind: chat
    config: { name: chat, url: "https://chat.example/w.js" }
    after: user_activity
ad_library: gpt
slots:
  - id: top
    config: { retry_delay: 5, retry_count: 3 }
"#;

    #[test]
    fn test_parse_yaml() {
        let config = BootConfig::from_yaml_str(BOOT).unwrap();
        assert_eq!(config.services.len(), 4);
        assert_eq!(config.services[0].after, Some(GateSpec::Now));
        assert_eq!(
            config.services[1].after,
            Some(GateSpec::Service("consent".to_string()))
        );
        assert_eq!(config.services[2].after, Some(GateSpec::DurationMs(300)));
        assert_eq!(config.services[3].after, Some(GateSpec::UserActivity));
        assert_eq!(config.services[1].config.debug, Some(true));
        assert_eq!(config.slots[0].config.retry_count, 3);
        assert_eq!(
            config.idle.unwrap().to_config().unwrap().overall_timeout,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_parse_module_example() {
        let config = BootConfig::from_yaml_str(
            r#"
idle:
  overall_timeout_ms: 5000
services:
  - kind: consent
    config: { name: consent, url: "https://cmp.example/cmp.js" }
  - kind: gpt
    config: { name: gpt, url: "https://ads.example/gpt.js" }
    after: { service: consent }
  - kind: analytics
    config: { name: analytics, url: "https://stats.example/a.js" }
    after: idle
ad_library: gpt
slots:
  - id: top
    config: { retry_delay: 5, retry_count: 3, refresh_interval: 30 }
"#,
        )
        .unwrap();
        assert_eq!(config.services[0].after, None);
        assert_eq!(
            config.services[1].after,
            Some(GateSpec::Service("consent".to_string()))
        );
        assert_eq!(config.services[2].after, Some(GateSpec::Idle));
        assert_eq!(
            config.slots[0].config.refresh_interval,
            Duration::from_secs(30)
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_gate_is_rejected() {
        let err = BootConfig::from_yaml_str(
            "services:\n  - kind: gpt\n    after: { after_lunch: 1 }\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Yaml(_)));
    }

    #[test]
    fn test_parse_json() {
        let config = BootConfig::from_json_str(
            r#"{"services":[{"kind":"tags","config":{"name":"gtm"},"after":"interactive"}]}"#,
        )
        .unwrap();
        assert_eq!(config.services[0].after, Some(GateSpec::Interactive));
        assert!(config.slots.is_empty());
    }

    #[test]
    fn test_reference_must_be_declared_earlier() {
        let config = BootConfig::from_yaml_str(
            "services:\n  - kind: gpt\n    after: { service: consent }\n  - kind: consent\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("services[0].after")
        );
    }

    #[test]
    fn test_duplicate_kind_is_rejected() {
        let config =
            BootConfig::from_yaml_str("services:\n  - kind: gpt\n  - kind: gpt\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_slots_need_library() {
        let config = BootConfig::from_yaml_str("slots:\n  - id: top\n").unwrap();
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("ad_library")
        );
    }

    #[test]
    fn test_bad_idle_ratio() {
        let options = IdleOptions {
            min_idle_ratio: Some(1.5),
            ..Default::default()
        };
        assert!(options.to_config().is_err());
    }

    #[tokio::test]
    async fn test_unsupported_extension() {
        let err = BootConfig::from_path("boot.toml").await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let err = BootConfig::from_path("/nonexistent/scriptflow/boot.yaml")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_apply_configures_and_queues() {
        let host = Host::builder()
            .with_injector(Arc::new(RecordingInjector::new()))
            .build()
            .unwrap();
        let registry = ServiceRegistry::new(host.clone());
        let queue = ScriptQueue::new(host);

        let config = BootConfig::from_yaml_str(BOOT).unwrap();
        let queued = config.apply(&registry, &queue).unwrap();

        assert_eq!(queued.len(), 4);
        assert_eq!(registry.kinds(), vec!["analytics", "chat", "consent", "gpt"]);
        assert!(registry.defaults("gpt").debug);
        assert!(queued.iter().all(|s| s.has_started() && !s.loaded()));
    }

    #[tokio::test]
    async fn test_ad_library_sees_boot_template() {
        let host = Host::builder()
            .with_injector(Arc::new(RecordingInjector::new()))
            .build()
            .unwrap();
        let registry = ServiceRegistry::new(host.clone());
        let queue = ScriptQueue::new(host);
        let config = BootConfig::from_yaml_str(BOOT).unwrap();

        let (ads, slots) = config
            .ad_slots(&registry, Arc::new(crate::ad::RecordingRenderer::new()))
            .unwrap()
            .unwrap();
        config.apply(&registry, &queue).unwrap();

        assert_eq!(slots.len(), 1);
        assert_eq!(
            ads.service().config().url.as_deref(),
            Some("https://ads.example/gpt.js")
        );
        assert!(Arc::ptr_eq(ads.service(), &registry.instance("gpt")));
    }
}
