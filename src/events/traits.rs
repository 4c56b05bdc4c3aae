use std::fmt::{self, Debug, Display};

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

pub const ONE_HOUR_MS: Timestamp = 60 * 60 * 1000;
pub const ONE_DAY_MS: Timestamp = 24 * ONE_HOUR_MS;

/// Kind of ad interaction a source was registered for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Event,
    Navigation,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Event => "event",
            SourceType::Navigation => "navigation",
        }
    }
}

impl Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Surface an origin lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSurfaceType {
    App,
    Web,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceStatus {
    Active,
    Ignored,
    MarkedToDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerStatus {
    Pending,
    Ignored,
    Attributed,
}

/// Whether a source's event-level output reflects real triggers.
///
/// Moves out of `Unassigned` exactly once; see
/// [`crate::mechanisms::noise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributionMode {
    Unassigned,
    Truthfully,
    Falsely,
}

/// What to do when a new source would exceed the distinct destination limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DestinationLimitAlgorithm {
    /// Reject the incoming source.
    #[default]
    Lifo,
    /// Evict the sources of the oldest destinations.
    Fifo,
}

/// Origins a registration is tied to, plus the site-level views used by the
/// rate limits.
pub trait Registration: Debug {
    fn registration_id(&self) -> &str;

    fn enrollment_id(&self) -> &str;

    fn registration_origin(&self) -> &str;

    fn registration_time(&self) -> Timestamp;
}

/// Reduces an origin such as `https://shop.example.com:443/path` to its
/// registrable site `https://example.com`. App origins (`android-app://`)
/// are returned unchanged.
pub fn site_of(origin: &str) -> String {
    let Some((scheme, rest)) = origin.split_once("://") else {
        return origin.to_string();
    };
    if scheme != "https" && scheme != "http" {
        return origin.to_string();
    }
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    let site = if labels.len() > 2 {
        labels[labels.len() - 2..].join(".")
    } else {
        labels.join(".")
    };
    format!("{scheme}://{site}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_of() {
        assert_eq!(site_of("https://shop.example.com/path"), "https://example.com");
        assert_eq!(site_of("https://example.com:443"), "https://example.com");
        assert_eq!(site_of("android-app://com.example"), "android-app://com.example");
    }
}
