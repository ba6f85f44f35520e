//! Config command - print the effective configuration.

use std::path::PathBuf;

use anyhow::Result;

use crate::config;
use crate::logging;

pub async fn cmd_config(path: Option<PathBuf>) -> Result<()> {
    logging::init_simple_logging();
    let cfg = config::load_config(path.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}
