//! Config command implementation.

use std::path::Path;

/// Prints the effective configuration, defaults filled in.
pub fn execute(path: Option<&Path>) -> anyhow::Result<()> {
    let config = super::load_config(path)?;
    print!("{}", config.to_toml()?);
    Ok(())
}
