//! # Configuration Management
//!
//! Layered configuration for the identity plane: defaults, then an
//! optional YAML file, then `IDPLANE_`-prefixed environment variables.
//! Everything is validated before use; a misconfigured authorizer or a
//! malformed trust domain fails startup with a message naming the
//! offending option.

pub mod settings;

pub use settings::{AppConfig, RegistrationEntry, UidSelectors};

use std::path::Path;

use config::{Config, Environment, File, FileFormat};

use crate::errors::{IdPlaneError, Result};

/// Load application configuration from multiple sources.
///
/// Later sources override earlier ones:
/// 1. Default values
/// 2. Configuration file (if specified)
/// 3. Environment variables with the `IDPLANE_` prefix
pub fn load_config<P: AsRef<Path>>(config_path: Option<P>) -> Result<AppConfig> {
    let mut builder = Config::builder();

    builder = builder.add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        let path = path.as_ref();
        if path.exists() {
            // Config files are YAML regardless of extension (tempfiles in
            // tests have none).
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        } else {
            return Err(IdPlaneError::config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
    }

    builder = builder.add_source(Environment::with_prefix("IDPLANE").try_parsing(true));

    let config = builder
        .build()
        .map_err(|e| IdPlaneError::config_with_source("Failed to build configuration", Box::new(e)))?;

    let app_config: AppConfig = config.try_deserialize().map_err(|e| {
        IdPlaneError::config_with_source("Failed to deserialize configuration", Box::new(e))
    })?;

    app_config.validate()?;

    Ok(app_config)
}

/// Load configuration from environment variables only. Useful for
/// containerized deployments.
pub fn load_config_from_env() -> Result<AppConfig> {
    load_config::<&str>(None)
}

/// Load configuration from a YAML file.
pub fn load_config_from_file<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    load_config(Some(path))
}
