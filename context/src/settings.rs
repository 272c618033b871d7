//! Engine settings: defaults layered under `KILN_*` environment variables.

use crate::hot_reload::{HotReloadConfig, HotReloadMode};
use config::{Config, ConfigError, Environment};
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct EngineSettings {
    /// `disabled`, `automatic_independent` or `on_request`.
    pub hot_reload_mode: HotReloadMode,
    pub hot_reload_change_wait_time_ns: u64,
    /// Formatting buffer for a single log message; longer messages are
    /// truncated with a visible marker.
    pub log_buffer_size: usize,
    /// Upper bound on resource bytes scheduled for reading per tick.
    pub resource_io_byte_budget: u64,
}

impl EngineSettings {
    pub fn load() -> Result<EngineSettings, ConfigError> {
        let mut config = Config::new();
        config.set_default("hot_reload_mode", "automatic_independent")?;
        config.set_default("hot_reload_change_wait_time_ns", 100_000_000i64)?;
        config.set_default("log_buffer_size", 4096i64)?;
        config.set_default("resource_io_byte_budget", 8 * 1024 * 1024i64)?;
        config.merge(Environment::with_prefix("KILN"))?;
        config.try_into()
    }

    pub fn hot_reload_config(&self) -> HotReloadConfig {
        HotReloadConfig {
            mode: self.hot_reload_mode,
            change_wait_time_ns: self.hot_reload_change_wait_time_ns,
            ..HotReloadConfig::default()
        }
    }

    /// Applies the configured formatting buffer to one log message; clipped
    /// messages carry a visible marker.
    pub fn clip_message<'a>(&self, message: &'a str) -> std::borrow::Cow<'a, str> {
        kiln_base::clip_log_message(message, self.log_buffer_size)
    }
}

impl Default for EngineSettings {
    fn default() -> EngineSettings {
        EngineSettings {
            hot_reload_mode: HotReloadMode::AutomaticIndependent,
            hot_reload_change_wait_time_ns: 100_000_000,
            log_buffer_size: 4096,
            resource_io_byte_budget: 8 * 1024 * 1024,
        }
    }
}
