use super::{AdSlot, AdSlotConfig, SlotRenderer, StatusFeed};
use crate::host::Host;
use crate::service::{LoadHandle, ScriptService, ServiceConfig, ServiceHooks, ServiceRegistry};
use async_trait::async_trait;
use std::sync::Arc;

/// Opens the status feed once the ad library is on the page.
struct FeedHooks {
    feed: StatusFeed,
}

#[async_trait]
impl ServiceHooks for FeedHooks {
    async fn on_loaded(&self, config: &ServiceConfig) {
        if self.feed.begin_observing() {
            tracing::info!(
                service = config.name.as_deref().unwrap_or("<unnamed>"),
                "observing ad slot status"
            );
        }
    }
}

/// The ad library service together with the slots it fills.
pub struct AdService {
    service: Arc<ScriptService>,
    feed: StatusFeed,
    renderer: Arc<dyn SlotRenderer>,
}

impl AdService {
    /// Private ad library instance built from `config`.
    pub fn new(config: ServiceConfig, host: Host, renderer: Arc<dyn SlotRenderer>) -> Self {
        let feed = StatusFeed::new();
        let service = ScriptService::new(config, host)
            .with_hooks(Arc::new(FeedHooks { feed: feed.clone() }));
        Self {
            service: Arc::new(service),
            feed,
            renderer,
        }
    }

    /// Use the registry singleton of `kind` as the ad library.
    ///
    /// The feed hooks only reach the singleton if it has not been created yet.
    pub fn from_registry(
        registry: &ServiceRegistry,
        kind: &str,
        renderer: Arc<dyn SlotRenderer>,
    ) -> Self {
        let feed = StatusFeed::new();
        if registry.get(kind).is_some() {
            tracing::warn!(kind, "ad service singleton already exists, status feed stays closed");
        }
        registry.set_hooks(kind, Arc::new(FeedHooks { feed: feed.clone() }));
        Self {
            service: registry.instance(kind),
            feed,
            renderer,
        }
    }

    pub fn service(&self) -> &Arc<ScriptService> {
        &self.service
    }

    pub fn feed(&self) -> &StatusFeed {
        &self.feed
    }

    pub fn load(&self) -> LoadHandle {
        self.service.load()
    }

    /// A slot rendered by this service and driven by its status feed.
    pub fn slot(&self, id: impl Into<String>, config: AdSlotConfig) -> AdSlot {
        let slot = AdSlot::builder(id, self.renderer.clone())
            .with_config(config)
            .with_clock(self.service.host().clock.clone())
            .build();
        // Detached: the task stops when the last clone of the slot is dropped.
        let _ = slot.attach(&self.feed);
        slot
    }

    /// First activation of `slot` once the ad library has loaded.
    pub async fn activate(&self, slot: &AdSlot) {
        slot.activate(self.load()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::{AdStatus, RecordingRenderer};
    use crate::host::RecordingInjector;
    use crate::service::ServiceConfigPatch;
    use std::time::Duration;

    fn gpt() -> ServiceConfig {
        ServiceConfig::new()
            .with_name("gpt")
            .with_url("https://ads.example/gpt.js")
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_opens_after_library_loads() {
        let host = Host::builder()
            .with_injector(Arc::new(RecordingInjector::new()))
            .build()
            .unwrap();
        let ads = AdService::new(gpt(), host, Arc::new(RecordingRenderer::new()));
        let slot = ads.slot("top", AdSlotConfig::new());

        ads.feed().publish_raw("top", "filled");
        assert!(!ads.feed().is_observing());

        ads.activate(&slot).await;
        assert!(ads.feed().is_observing());
        assert_eq!(slot.status(), AdStatus::Pending);

        ads.feed().publish_raw("top", "filled");
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(slot.status(), AdStatus::Filled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_library_marks_slot_failed() {
        let injector = RecordingInjector::new().with_failure("https://ads.example/gpt.js");
        let host = Host::builder()
            .with_injector(Arc::new(injector))
            .build()
            .unwrap();
        let ads = AdService::new(gpt(), host, Arc::new(RecordingRenderer::new()));
        let slot = ads.slot("top", AdSlotConfig::new());

        ads.activate(&slot).await;
        assert_eq!(slot.status(), AdStatus::Failed);
        assert!(!ads.feed().is_observing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_slot_stops_listening() {
        let host = Host::builder()
            .with_injector(Arc::new(RecordingInjector::new()))
            .build()
            .unwrap();
        let ads = AdService::new(gpt(), host, Arc::new(RecordingRenderer::new()));
        let slot = ads.slot("top", AdSlotConfig::new());
        assert_eq!(ads.feed().subscriber_count(), 1);

        drop(slot);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(ads.feed().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_registry_singleton_gets_feed_hooks() {
        let host = Host::builder()
            .with_injector(Arc::new(RecordingInjector::new()))
            .build()
            .unwrap();
        let registry = ServiceRegistry::new(host);
        registry.configure("gpt", &ServiceConfigPatch::from(gpt()));

        let ads = AdService::from_registry(&registry, "gpt", Arc::new(RecordingRenderer::new()));
        assert!(Arc::ptr_eq(ads.service(), &registry.instance("gpt")));
        ads.load().await.unwrap();
        assert!(ads.feed().is_observing());
    }
}
