//! Configuration loading.
//!
//! Settings are layered: built-in defaults, then an optional
//! `config/default.*` file, then `POPMQ_`-prefixed environment variables
//! (nested keys separated by `__`, e.g. `POPMQ_BROKER__DATA_DIR`).

mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{BrokerSettings, LogSettings, ServerSettings, Settings};

/// Loads the configuration from the default file and environment variables
/// and merges it over `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("POPMQ")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}

#[cfg(test)]
mod tests;
