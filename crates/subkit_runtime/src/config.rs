//! Runtime configuration.

use serde::{Deserialize, Serialize};

/// What schema compilation does with a field directive no handler is
/// registered for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownDirectivePolicy {
    /// Treat the directive as a passthrough and log a warning.
    #[default]
    Skip,
    /// Fail compilation.
    Reject,
}

/// Request service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Complexity ceiling. `None` or `0` disables admission control.
    pub max_complexity: Option<u64>,
    /// Attach the cache-control and tracing report to responses.
    pub extensions: bool,
    /// Handling of unregistered schema directives.
    pub unknown_directives: UnknownDirectivePolicy,
}

impl RuntimeConfig {
    /// Creates a config with admission control and reports disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the complexity ceiling.
    pub fn with_max_complexity(mut self, ceiling: u64) -> Self {
        self.max_complexity = Some(ceiling);
        self
    }

    /// Enables or disables the response report.
    pub fn with_extensions(mut self, enabled: bool) -> Self {
        self.extensions = enabled;
        self
    }

    /// Sets the unknown directive policy.
    pub fn with_unknown_directives(mut self, policy: UnknownDirectivePolicy) -> Self {
        self.unknown_directives = policy;
        self
    }

    /// The active ceiling, if admission control is enabled.
    pub fn ceiling(&self) -> Option<u64> {
        self.max_complexity.filter(|ceiling| *ceiling > 0)
    }
}
