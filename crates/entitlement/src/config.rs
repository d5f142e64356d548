//! Engine configuration
//!
//! Read from the environment the same way the rest of the platform
//! configures itself; every knob has a production default so an empty
//! environment is valid.

/// Tunables for the lifecycle engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Trial length granted at signup
    pub trial_days: i64,
    /// Billing cycle length for paid periods
    pub cycle_days: i64,
    /// Grace window applied when an admin grant omits a day count
    pub default_grace_days: u32,
    /// How many times a lost conditional update is retried before the
    /// operation surfaces as temporarily unavailable
    pub max_conflict_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trial_days: 7,
            cycle_days: 30,
            default_grace_days: 7,
            max_conflict_retries: 3,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Load from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            trial_days: env_parse("HIREDESK_TRIAL_DAYS", defaults.trial_days),
            cycle_days: env_parse("HIREDESK_CYCLE_DAYS", defaults.cycle_days),
            default_grace_days: env_parse("HIREDESK_GRACE_DAYS", defaults.default_grace_days),
            max_conflict_retries: env_parse(
                "HIREDESK_CONFLICT_RETRIES",
                defaults.max_conflict_retries,
            ),
        }
    }
}
