//! Picks the configuration source for the binary.

use gateway_engine::{ConfigSource, EnvConfigSource, FileConfigSource, GatewayConfig};

const CONFIG_FILE_VAR: &str = "GATEWAY_CONFIG_FILE";

/// Loads configuration from the file named by `GATEWAY_CONFIG_FILE`, or from
/// the process environment when it is unset.
pub fn load() -> anyhow::Result<GatewayConfig> {
    let source: Box<dyn ConfigSource> = match std::env::var(CONFIG_FILE_VAR) {
        Ok(path) if !path.trim().is_empty() => {
            tracing::info!(path = %path, "Loading configuration file");
            Box::new(FileConfigSource::load(&path)?)
        }
        _ => Box::new(EnvConfigSource),
    };
    Ok(GatewayConfig::load(&*source)?)
}
