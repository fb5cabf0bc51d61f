use crate::{Error, ErrorContext};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of one ad slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdStatus {
    #[default]
    Init,
    Pending,
    Hidden,
    Filled,
    Unfilled,
    Failed,
}

impl AdStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdStatus::Init => "init",
            AdStatus::Pending => "pending",
            AdStatus::Hidden => "hidden",
            AdStatus::Filled => "filled",
            AdStatus::Unfilled => "unfilled",
            AdStatus::Failed => "failed",
        }
    }

    /// `unfilled` is handled by the retry path, every other status by the refresh path.
    pub fn is_retry_path(&self) -> bool {
        matches!(self, AdStatus::Unfilled)
    }
}

impl fmt::Display for AdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "init" => Ok(AdStatus::Init),
            "pending" => Ok(AdStatus::Pending),
            "hidden" => Ok(AdStatus::Hidden),
            "filled" => Ok(AdStatus::Filled),
            "unfilled" => Ok(AdStatus::Unfilled),
            "failed" => Ok(AdStatus::Failed),
            other => Err(Error::configuration_with_context(
                "unknown ad status",
                ErrorContext::new()
                    .with_details(other.to_string())
                    .with_source("ad_status"),
            )),
        }
    }
}
