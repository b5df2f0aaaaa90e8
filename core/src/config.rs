use serde::{Deserialize, Serialize};

/// Upper bound applied to `speed_modifier` wherever it enters the system.
pub const DEFAULT_MAX_SPEED_MODIFIER: f64 = 1000.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Occurrences generated per schedule entry on each regeneration.
    pub gen_count: u32,
    /// Single clamp for the clock rate, used at load time and on assignment.
    pub max_speed_modifier: f64,
    /// Worst-case duration of a maintenance window before it is aborted.
    pub maintenance_timeout_ms: u64,
    /// Rate for a clock created without a persisted snapshot.
    pub default_speed_modifier: f64,
    /// Whether a fresh clock requires "manage time" to start or stop.
    pub default_restricted: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            gen_count: 3,
            max_speed_modifier: DEFAULT_MAX_SPEED_MODIFIER,
            maintenance_timeout_ms: 30_000,
            default_speed_modifier: 1.0,
            default_restricted: false,
        }
    }
}

impl DispatchConfig {
    /// Load from a JSON file. Missing keys fall back to defaults.
    /// In tests, use DispatchConfig::default_test().
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: DispatchConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_test() -> Self {
        Self {
            gen_count: 3,
            max_speed_modifier: DEFAULT_MAX_SPEED_MODIFIER,
            maintenance_timeout_ms: 5_000,
            default_speed_modifier: 1.0,
            default_restricted: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.max_speed_modifier.is_finite() && self.max_speed_modifier > 0.0) {
            anyhow::bail!("max_speed_modifier must be a positive number");
        }
        if !(self.default_speed_modifier.is_finite() && self.default_speed_modifier >= 0.0) {
            anyhow::bail!("default_speed_modifier must be non-negative");
        }
        if self.maintenance_timeout_ms == 0 {
            anyhow::bail!("maintenance_timeout_ms must be non-zero");
        }
        Ok(())
    }
}
