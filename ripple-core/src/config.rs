//! Container configuration.

use serde::{Deserialize, Serialize};

/// Tunables for a [`ProviderContainer`](crate::ProviderContainer).
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```rust
/// use ripple_core::GraphConfig;
///
/// let config = GraphConfig::from_json(r#"{ "label": "session" }"#).unwrap();
/// assert_eq!(config.label.as_deref(), Some("session"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Enables the assertion-level checks: override list shape validation in
    /// `update_overrides` and the dependency-depth ordering check in
    /// `mark_may_have_changed`. Defaults to on in debug builds.
    pub debug_checks: bool,

    /// Name attached to the container's log events.
    pub label: Option<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            debug_checks: cfg!(debug_assertions),
            label: None,
        }
    }
}

impl GraphConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(source: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(source)
    }

    /// Same configuration with debug checks forced on or off.
    pub fn with_debug_checks(mut self, enabled: bool) -> Self {
        self.debug_checks = enabled;
        self
    }

    /// Same configuration with a log label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub(crate) fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("container")
    }
}
