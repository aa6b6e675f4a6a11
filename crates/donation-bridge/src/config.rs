//! Host-side configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::codec::DEFAULT_MAX_FRAME_BYTES;

/// How much prior session state a (re)started worker receives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResumePolicy {
    /// Every stored fragment.
    #[default]
    Full,
    /// Only the most recently stored fragment.
    LastFragment,
    /// Nothing; the worker starts from scratch (sequence numbering still continues).
    None,
}

impl ResumePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResumePolicy::Full => "full",
            ResumePolicy::LastFragment => "last-fragment",
            ResumePolicy::None => "none",
        }
    }
}

impl FromStr for ResumePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(ResumePolicy::Full),
            "last-fragment" | "last_fragment" => Ok(ResumePolicy::LastFragment),
            "none" => Ok(ResumePolicy::None),
            other => Err(format!(
                "unknown resume policy '{other}' (expected full, last-fragment or none)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub spawn_timeout: Duration,
    pub startup_timeout: Duration,
    pub quiet_period: Duration,
    pub present_timeout: Duration,
    pub user_response_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    pub submit_timeout: Duration,
    /// Retries after the first submission attempt.
    pub submit_retries: u32,
    pub submit_backoff: Duration,
    pub max_payload_bytes: usize,
    pub resume_policy: ResumePolicy,
    pub locale: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            spawn_timeout: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(30),
            quiet_period: Duration::from_secs(20),
            present_timeout: Duration::from_secs(10),
            user_response_timeout: Duration::from_secs(1800),
            shutdown_grace: Duration::from_secs(2),
            max_restarts: 2,
            restart_backoff: Duration::from_millis(500),
            submit_timeout: Duration::from_secs(30),
            submit_retries: 3,
            submit_backoff: Duration::from_millis(500),
            max_payload_bytes: DEFAULT_MAX_FRAME_BYTES,
            resume_policy: ResumePolicy::Full,
            locale: "en".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `BRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `BRIDGE_*` name.
    ///
    /// Durations are seconds (fractions allowed). Unparseable values are logged
    /// and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let secs = |name: &str, target: &mut Duration| {
            if let Some(d) = lookup(name).and_then(|raw| parse_secs(name, &raw)) {
                *target = d;
            }
        };
        secs("BRIDGE_SPAWN_TIMEOUT", &mut config.spawn_timeout);
        secs("BRIDGE_STARTUP_TIMEOUT", &mut config.startup_timeout);
        secs("BRIDGE_QUIET_PERIOD", &mut config.quiet_period);
        secs("BRIDGE_PRESENT_TIMEOUT", &mut config.present_timeout);
        secs("BRIDGE_USER_RESPONSE_TIMEOUT", &mut config.user_response_timeout);
        secs("BRIDGE_SHUTDOWN_GRACE", &mut config.shutdown_grace);
        secs("BRIDGE_RESTART_BACKOFF", &mut config.restart_backoff);
        secs("BRIDGE_SUBMIT_TIMEOUT", &mut config.submit_timeout);
        secs("BRIDGE_SUBMIT_BACKOFF", &mut config.submit_backoff);

        if let Some(v) = parse_var(&lookup, "BRIDGE_MAX_RESTARTS") {
            config.max_restarts = v;
        }
        if let Some(v) = parse_var(&lookup, "BRIDGE_SUBMIT_RETRIES") {
            config.submit_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "BRIDGE_MAX_PAYLOAD_BYTES") {
            config.max_payload_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, "BRIDGE_RESUME_POLICY") {
            config.resume_policy = v;
        }
        if let Some(v) = lookup("BRIDGE_LOCALE").filter(|s| !s.is_empty()) {
            config.locale = v;
        }

        config
    }

    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_quiet_period(mut self, period: Duration) -> Self {
        self.quiet_period = period;
        self
    }

    pub fn with_present_timeout(mut self, timeout: Duration) -> Self {
        self.present_timeout = timeout;
        self
    }

    pub fn with_user_response_timeout(mut self, timeout: Duration) -> Self {
        self.user_response_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_restarts(mut self, n: u32) -> Self {
        self.max_restarts = n;
        self
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    pub fn with_submit_retries(mut self, n: u32) -> Self {
        self.submit_retries = n;
        self
    }

    pub fn with_submit_backoff(mut self, backoff: Duration) -> Self {
        self.submit_backoff = backoff;
        self
    }

    pub fn with_max_payload_bytes(mut self, n: usize) -> Self {
        self.max_payload_bytes = n;
        self
    }

    pub fn with_resume_policy(mut self, policy: ResumePolicy) -> Self {
        self.resume_policy = policy;
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    /// Delay before submission retry `attempt` (1-based).
    pub fn submit_backoff_for(&self, attempt: u32) -> Duration {
        self.submit_backoff
            .checked_mul(1u32 << attempt.saturating_sub(1).min(10))
            .unwrap_or(Duration::MAX)
    }
}

/// Parse a non-negative number of seconds (fractions allowed).
///
/// Unparseable, negative and out-of-range values are logged and ignored.
pub fn parse_secs(name: &str, raw: &str) -> Option<Duration> {
    let secs = match raw.trim().parse::<f64>() {
        Ok(secs) => secs,
        Err(e) => {
            tracing::warn!(var = name, value = %raw, error = %e, "Ignoring invalid configuration value");
            return None;
        }
    };
    match Duration::try_from_secs_f64(secs) {
        Ok(d) => Some(d),
        Err(e) => {
            tracing::warn!(var = name, value = %raw, error = %e, "Ignoring out-of-range duration");
            None
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(var = name, value = %raw, error = %e, "Ignoring invalid configuration value");
            None
        }
    }
}
