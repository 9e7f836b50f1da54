//! Config command implementation.

use anyhow::Result;
use convo_sync_client::EngineConfig;

use crate::config;

/// Print the effective engine configuration.
pub fn run(engine_config: &EngineConfig) -> Result<()> {
    println!("=== convo-sync config ===");
    println!();
    print!("{}", config::render(engine_config)?);
    println!();
    println!("Effective poll interval: {:?}", engine_config.poll_interval());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_prints_defaults() {
        run(&EngineConfig::default()).unwrap();
    }

    #[test]
    fn config_prints_clamped_interval() {
        let mut engine_config = EngineConfig::default();
        engine_config.poll_interval_secs = 0;
        run(&engine_config).unwrap();
    }
}
