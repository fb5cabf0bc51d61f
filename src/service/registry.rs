//! Service registry.
//!
//! One entry per service kind: a mutable default template and a lazily created
//! singleton. Callers choose explicitly between the shared singleton
//! ([`ServiceRegistry::instance`]) and a private instance ([`ServiceRegistry::create`]).

use super::{LoggingHooks, ScriptService, ServiceConfig, ServiceConfigPatch, ServiceHooks};
use crate::host::Host;
use arc_swap::ArcSwap;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

struct Entry {
    template: ArcSwap<ServiceConfig>,
    hooks: RwLock<Arc<dyn ServiceHooks>>,
    singleton: OnceCell<Arc<ScriptService>>,
}

impl Entry {
    fn new() -> Self {
        Self {
            template: ArcSwap::from_pointee(ServiceConfig::default()),
            hooks: RwLock::new(Arc::new(LoggingHooks)),
            singleton: OnceCell::new(),
        }
    }

    fn hooks(&self) -> Arc<dyn ServiceHooks> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn build(&self, host: &Host) -> ScriptService {
        let config = ServiceConfig::clone(&self.template.load());
        ScriptService::new(config, host.clone()).with_hooks(self.hooks())
    }
}

/// Registry of service kinds, their default templates and singletons.
pub struct ServiceRegistry {
    host: Host,
    entries: RwLock<HashMap<String, Arc<Entry>>>,
}

impl ServiceRegistry {
    pub fn new(host: Host) -> Self {
        Self {
            host,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    fn entry(&self, kind: &str) -> Arc<Entry> {
        if let Some(entry) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
        {
            return entry.clone();
        }
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind.to_string())
            .or_insert_with(|| Arc::new(Entry::new()))
            .clone()
    }

    /// Merge `patch` into the default template of `kind`.
    ///
    /// Affects instances built afterwards only; existing instances keep their snapshot.
    pub fn configure(&self, kind: &str, patch: &ServiceConfigPatch) {
        let entry = self.entry(kind);
        entry
            .template
            .rcu(|current| Arc::new(current.merged(patch)));
        tracing::debug!(kind, "service template updated");
    }

    /// Current default template of `kind`.
    pub fn defaults(&self, kind: &str) -> ServiceConfig {
        ServiceConfig::clone(&self.entry(kind).template.load())
    }

    /// Hooks given to instances of `kind` built from now on.
    pub fn set_hooks(&self, kind: &str, hooks: Arc<dyn ServiceHooks>) {
        let entry = self.entry(kind);
        *entry.hooks.write().unwrap_or_else(PoisonError::into_inner) = hooks;
    }

    /// The process-wide instance of `kind`, built from the template on first access.
    pub fn instance(&self, kind: &str) -> Arc<ScriptService> {
        let entry = self.entry(kind);
        entry
            .singleton
            .get_or_init(|| {
                tracing::debug!(kind, "creating service singleton");
                Arc::new(entry.build(&self.host))
            })
            .clone()
    }

    /// The singleton of `kind`, if it was created already.
    pub fn get(&self, kind: &str) -> Option<Arc<ScriptService>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .and_then(|entry| entry.singleton.get().cloned())
    }

    /// A fresh instance of `kind`, independent of the singleton.
    pub fn create(&self, kind: &str) -> ScriptService {
        self.entry(kind).build(&self.host)
    }

    /// A fresh instance from an explicit config, sharing this registry's host.
    pub fn create_with(&self, config: ServiceConfig) -> ScriptService {
        ScriptService::new(config, self.host.clone())
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RecordingInjector;

    fn registry() -> ServiceRegistry {
        let host = Host::builder()
            .with_injector(Arc::new(RecordingInjector::new()))
            .build()
            .unwrap();
        ServiceRegistry::new(host)
    }

    #[test]
    fn test_singleton_is_shared() {
        let registry = registry();
        registry.configure("gpt", &ServiceConfigPatch::new().name("gpt"));
        let a = registry.instance("gpt");
        let b = registry.instance("gpt");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("gpt").is_some());
        assert!(registry.get("consent").is_none());
    }

    #[test]
    fn test_configure_does_not_touch_existing_instances() {
        let registry = registry();
        registry.configure("gpt", &ServiceConfigPatch::new().name("gpt"));
        let explicit = registry.create("gpt");
        let singleton = registry.instance("gpt");

        registry.configure(
            "gpt",
            &ServiceConfigPatch::new().url("https://ads.example/gpt.js"),
        );

        assert!(explicit.config().url.is_none());
        assert!(singleton.config().url.is_none());
        assert_eq!(
            registry.create("gpt").config().url.as_deref(),
            Some("https://ads.example/gpt.js")
        );
        assert_eq!(registry.defaults("gpt").name.as_deref(), Some("gpt"));
    }

    #[test]
    fn test_kinds_are_listed_sorted() {
        let registry = registry();
        registry.configure("tagmanager", &ServiceConfigPatch::new());
        registry.configure("consent", &ServiceConfigPatch::new());
        assert_eq!(registry.kinds(), vec!["consent", "tagmanager"]);
    }
}
