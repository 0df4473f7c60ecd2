//! Supervisor configuration.

use std::str::FromStr;
use std::time::Duration;

/// Largest expression buffered for one EVALUATE.
pub const DEFAULT_MAX_EXPRESSION_BYTES: usize = 1024 * 1024;

/// Delay after teardown before accepting again, so the transport can release
/// the previous channel.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3);

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// What EVALUATE does when the buffer is not yet a complete expression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncompletePolicy {
    /// Leave the buffer untouched and send nothing; more blocks may follow.
    #[default]
    Wait,
    /// Discard the buffer and answer with an error response.
    Reject,
}

impl FromStr for IncompletePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(Self::Wait),
            "reject" => Ok(Self::Reject),
            other => Err(format!("invalid incomplete policy '{other}', expected 'wait' or 'reject'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub cooldown: Duration,
    pub incomplete_policy: IncompletePolicy,
    pub max_expression_bytes: usize,
    /// How long `stop()` waits for in-flight evaluation/interrupt tasks.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            incomplete_policy: IncompletePolicy::Wait,
            max_expression_bytes: DEFAULT_MAX_EXPRESSION_BYTES,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `SCHMEEP_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "SCHMEEP_COOLDOWN_MS") {
            config.cooldown = Duration::from_millis(ms);
        }
        if let Some(policy) = parse_var::<IncompletePolicy>(&lookup, "SCHMEEP_INCOMPLETE_POLICY") {
            config.incomplete_policy = policy;
        }
        if let Some(max) = parse_var::<usize>(&lookup, "SCHMEEP_MAX_EXPRESSION_BYTES") {
            config.max_expression_bytes = max;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "SCHMEEP_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace = Duration::from_millis(ms);
        }

        config
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_incomplete_policy(mut self, policy: IncompletePolicy) -> Self {
        self.incomplete_policy = policy;
        self
    }

    pub fn with_max_expression_bytes(mut self, max: usize) -> Self {
        self.max_expression_bytes = max;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Ignoring invalid config value");
            None
        }
    }
}
