//! `config.json` load/save.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use queuectl_core::{ConfigError, QueueConfig};
use tracing::info;

/// Read and validate the configuration, writing defaults if the file is missing.
pub(crate) fn load_or_init(path: &Path) -> Result<QueueConfig, ConfigError> {
    match fs::read_to_string(path) {
        Ok(text) => QueueConfig::from_json(&text),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let config = QueueConfig::default();
            save(path, &config)?;
            info!(path = %path.display(), "wrote default queue configuration");
            Ok(config)
        }
        Err(err) => Err(ConfigError::Io(err)),
    }
}

pub(crate) fn save(path: &Path, config: &QueueConfig) -> Result<(), ConfigError> {
    config.validate()?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut text = config.to_json_pretty()?;
    text.push('\n');
    fs::write(path, text)?;
    Ok(())
}
