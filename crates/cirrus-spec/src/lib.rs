//! Cirrus shared data model
//!
//! Types shared across the control plane: function/runtime metadata, resource
//! quantities, and the controller configuration file format.

mod config;
mod error;
mod types;

pub use config::*;
pub use error::*;
pub use types::*;

/// Parse a controller configuration from a YAML string
pub fn config_from_yaml_str(yaml: &str) -> Result<CirrusConfig, SpecError> {
    let config: CirrusConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

/// Parse a controller configuration from a YAML file
pub fn config_from_yaml_file(path: &std::path::Path) -> Result<CirrusConfig, SpecError> {
    let content = std::fs::read_to_string(path).map_err(|e| SpecError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    config_from_yaml_str(&content)
}
