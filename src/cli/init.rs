//! Init command - write a default configuration file.

use std::path::PathBuf;

use anyhow::Result;

use crate::config;

pub async fn cmd_init(path: Option<PathBuf>) -> Result<()> {
    let cfg_path = path.clone().unwrap_or_else(config::config_path);
    if cfg_path.exists() {
        println!("Config already exists at {}", cfg_path.display());
        println!("Delete it first if you want to re-initialize.");
        return Ok(());
    }

    let cfg = config::BridgeConfig::default();
    config::save_config(&cfg, path.as_deref())?;
    println!("✓ Created config at {}", cfg_path.display());
    println!("\nNext steps:");
    println!("  sandbox-bridge run program.json");
    Ok(())
}
