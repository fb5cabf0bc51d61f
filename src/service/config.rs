//! Service configuration.
//!
//! Configuration may be incomplete when a service is built; it is only checked when the
//! service loads, so templates can be assembled from several partial patches at boot.

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service identifier; the script element id is derived from it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Script url.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Passed through untouched to the script injector.
    pub script_attributes: BTreeMap<String, String>,
    /// Surface failures as warnings instead of debug logs.
    pub debug: bool,
}

/// Partial configuration merged over a [`ServiceConfig`].
///
/// Fields left `None` keep the current value; `script_attributes` replaces the whole map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_attributes: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
}

/// Everything the load step needs, known to be present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LoadTarget {
    pub element_id: String,
    pub url: String,
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_script_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.script_attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// A copy of this config with `patch` applied.
    pub fn merged(&self, patch: &ServiceConfigPatch) -> Self {
        let mut next = self.clone();
        if let Some(name) = &patch.name {
            next.name = Some(name.clone());
        }
        if let Some(url) = &patch.url {
            next.url = Some(url.clone());
        }
        if let Some(attributes) = &patch.script_attributes {
            next.script_attributes = attributes.clone();
        }
        if let Some(debug) = patch.debug {
            next.debug = debug;
        }
        next
    }

    /// Element id derived from the name: whitespace removed, lower-cased.
    pub fn element_id(&self) -> Option<String> {
        self.name.as_deref().map(element_id_for).filter(|id| !id.is_empty())
    }

    pub(crate) fn load_target(&self) -> Result<LoadTarget> {
        let element_id = self.element_id().ok_or_else(|| {
            Error::configuration_with_context(
                "service name is required before loading",
                ErrorContext::new()
                    .with_field_path("name")
                    .with_source("script_service"),
            )
        })?;
        let url = self
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                Error::configuration_with_context(
                    "service url is required before loading",
                    ErrorContext::new()
                        .with_field_path("url")
                        .with_details(format!("service '{element_id}'"))
                        .with_source("script_service"),
                )
            })?;
        Ok(LoadTarget {
            element_id,
            url: url.to_string(),
        })
    }
}

impl ServiceConfigPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn script_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.script_attributes = Some(attributes);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }
}

impl From<ServiceConfig> for ServiceConfigPatch {
    fn from(config: ServiceConfig) -> Self {
        Self {
            name: config.name,
            url: config.url,
            script_attributes: Some(config.script_attributes),
            debug: Some(config.debug),
        }
    }
}

fn element_id_for(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_id_strips_whitespace_and_lowercases() {
        let config = ServiceConfig::new().with_name(" Google Publisher Tag ");
        assert_eq!(config.element_id().as_deref(), Some("googlepublishertag"));
    }

    #[test]
    fn test_blank_name_has_no_element_id() {
        assert_eq!(ServiceConfig::new().with_name("   ").element_id(), None);
    }

    #[test]
    fn test_merge_keeps_unset_fields() {
        let base = ServiceConfig::new()
            .with_name("consent")
            .with_script_attribute("async", "")
            .with_debug(true);
        let merged = base.merged(&ServiceConfigPatch::new().url("https://cmp.example/cmp.js"));

        assert_eq!(merged.name.as_deref(), Some("consent"));
        assert_eq!(merged.url.as_deref(), Some("https://cmp.example/cmp.js"));
        assert!(merged.debug);
        assert!(merged.script_attributes.contains_key("async"));
    }

    #[test]
    fn test_merge_replaces_attribute_map() {
        let base = ServiceConfig::new().with_script_attribute("async", "");
        let mut attrs = BTreeMap::new();
        attrs.insert("nonce".to_string(), "abc".to_string());
        let merged = base.merged(&ServiceConfigPatch::new().script_attributes(attrs));
        assert_eq!(merged.script_attributes.len(), 1);
        assert_eq!(merged.script_attributes["nonce"], "abc");
    }

    #[test]
    fn test_missing_name_fails_first() {
        let err = ServiceConfig::new().load_target().unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("name")
        );
    }

    #[test]
    fn test_missing_url_fails() {
        let err = ServiceConfig::new()
            .with_name("analytics")
            .load_target()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("url")
        );
    }

    #[test]
    fn test_patch_from_yaml() {
        let patch: ServiceConfigPatch =
            serde_yaml::from_str("url: https://tags.example/gtm.js\ndebug: true\n").unwrap();
        assert_eq!(patch.url.as_deref(), Some("https://tags.example/gtm.js"));
        assert_eq!(patch.debug, Some(true));
        assert!(patch.name.is_none());
    }
}
