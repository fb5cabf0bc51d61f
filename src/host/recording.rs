use super::{Clock, HintInjector, ResourceHint, ScriptInjector};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// One observed injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionRecord {
    pub element_id: String,
    pub url: String,
    pub attributes: BTreeMap<String, String>,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
    pub succeeded: bool,
}

#[derive(Default)]
struct Plan {
    latency: HashMap<String, Duration>,
    failing: HashSet<String>,
}

/// In-memory script injector for testing and simulation.
///
/// Records every call; per-url latency and failures can be configured up front.
pub struct RecordingInjector {
    clock: Option<Arc<dyn Clock>>,
    plan: RwLock<Plan>,
    records: Arc<RwLock<Vec<InjectionRecord>>>,
}

impl RecordingInjector {
    pub fn new() -> Self {
        Self {
            clock: None,
            plan: RwLock::new(Plan::default()),
            records: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Clock used to simulate latency. Without one, injections complete at once.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_latency(self, url: impl Into<String>, latency: Duration) -> Self {
        self.plan.write().unwrap().latency.insert(url.into(), latency);
        self
    }

    pub fn with_failure(self, url: impl Into<String>) -> Self {
        self.plan.write().unwrap().failing.insert(url.into());
        self
    }

    pub fn records(&self) -> Vec<InjectionRecord> {
        self.records.read().unwrap().clone()
    }

    /// Element ids in the order their injection started.
    pub fn started_order(&self) -> Vec<String> {
        self.records
            .read()
            .unwrap()
            .iter()
            .map(|r| r.element_id.clone())
            .collect()
    }

    pub fn count_for(&self, element_id: &str) -> usize {
        self.records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.element_id == element_id)
            .count()
    }

    pub fn record_for(&self, element_id: &str) -> Option<InjectionRecord> {
        self.records
            .read()
            .unwrap()
            .iter()
            .find(|r| r.element_id == element_id)
            .cloned()
    }

    fn now(&self) -> Instant {
        self.clock.as_ref().map_or_else(Instant::now, |c| c.now())
    }
}

impl Default for RecordingInjector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScriptInjector for RecordingInjector {
    async fn inject(
        &self,
        element_id: &str,
        url: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<()> {
        let (latency, fails) = {
            let plan = self.plan.read().unwrap();
            (plan.latency.get(url).copied(), plan.failing.contains(url))
        };

        let index = {
            let mut records = self.records.write().unwrap();
            records.push(InjectionRecord {
                element_id: element_id.to_string(),
                url: url.to_string(),
                attributes: attributes.clone(),
                started_at: self.now(),
                finished_at: None,
                succeeded: false,
            });
            records.len() - 1
        };

        if let (Some(latency), Some(clock)) = (latency, self.clock.as_ref()) {
            clock.sleep(latency).await;
        }

        let finished_at = self.now();
        let mut records = self.records.write().unwrap();
        records[index].finished_at = Some(finished_at);
        records[index].succeeded = !fails;
        if fails {
            return Err(Error::injection_with_context(
                "script failed to load",
                ErrorContext::new()
                    .with_details(format!("{element_id} <- {url}"))
                    .with_source("recording_injector"),
            ));
        }
        Ok(())
    }
}

/// In-memory hint injector for testing.
pub struct RecordingHints {
    hints: Arc<RwLock<Vec<ResourceHint>>>,
}

impl RecordingHints {
    pub fn new() -> Self {
        Self {
            hints: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn hints(&self) -> Vec<ResourceHint> {
        self.hints.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.hints.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecordingHints {
    fn default() -> Self {
        Self::new()
    }
}

impl HintInjector for RecordingHints {
    fn insert_hint(&self, hint: ResourceHint) {
        self.hints.write().unwrap().push(hint);
    }
}
