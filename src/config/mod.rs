//! Configuration management
//!
//! Handles config.toml (user-defined) and the resolved settings generated
//! from it with every default filled in.

mod types;
mod validation;

pub use types::*;
pub use validation::{validate, validate_settings, ValidationResult};

use crate::{Error, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    parse(&content)
}

/// Parse configuration from TOML text
pub fn parse(content: &str) -> Result<Config> {
    toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
}

/// Fill in every default
pub fn resolve(config: &Config) -> NatSettings {
    NatSettings::from_config(config)
}

/// Load resolved settings previously written by `config generate`
pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<NatSettings> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
}
