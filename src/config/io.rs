use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str;
use directories_next::ProjectDirs;
use fd_lock::RwLock;
use log::info;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::config::types::Config;
use crate::error::ConfigError;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "pageflip", "pageflip")
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    match project_dirs() {
        None => Err(ConfigError::NoConfigPath),
        Some(dirs) => Ok(dirs.config_dir().join("pageflip.json")),
    }
}

/// Where the attribute cache and the instance lock live. Honors the
/// `stateDir` config override.
pub fn state_dir(config: &Config) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = &config.state_dir {
        return Ok(dir.clone());
    }

    match project_dirs() {
        None => Err(ConfigError::NoConfigPath),
        Some(dirs) => Ok(dirs.data_local_dir().to_path_buf()),
    }
}

pub async fn read_config(path: &Path) -> Result<Config, ConfigError> {
    info!("Using config file {}", path.display());

    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!("Config file not found, using defaults");
            return Ok(Config::default());
        },
        Err(err) => return Err(err.into()),
    };

    let mut content = vec![];
    file.read_to_end(&mut content).await?;

    if content.is_empty() {
        return Ok(Config::default());
    }

    let content = str::from_utf8(&content)?;
    let config: Config = serde_json::from_str(content)?;
    Ok(config)
}

/// Exclusive lock so only one daemon instance owns the state directory (and
/// with it the kernel uhid channel). Hold the returned lock plus its write
/// guard for the daemon's lifetime.
pub fn instance_locker(state_dir: &Path) -> Result<RwLock<std::fs::File>, ConfigError> {
    std::fs::create_dir_all(state_dir)?;

    let path = state_dir.join("pageflipd.lock");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    Ok(RwLock::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_config_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = read_config(&dir.path().join("nope.json")).await.unwrap();
        assert_eq!(config, Config::default());
    }

    #[tokio::test]
    async fn reads_config_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pageflip.json");
        std::fs::write(&path, br#"{"devices": ["AA:BB:CC:DD:EE:FF"], "buttons": {"debounceMs": 350}}"#)
            .unwrap();

        let config = read_config(&path).await.unwrap();
        assert_eq!(config.devices, vec!["AA:BB:CC:DD:EE:FF"]);
        assert_eq!(config.buttons.debounce_ms, 350);
    }

    #[tokio::test]
    async fn malformed_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pageflip.json");
        std::fs::write(&path, b"{ nope").unwrap();
        assert!(matches!(read_config(&path).await, Err(ConfigError::JsonError { .. })));
    }

    #[test]
    fn second_instance_lock_fails() {
        let dir = TempDir::new().unwrap();

        let mut first = instance_locker(dir.path()).unwrap();
        let _guard = first.try_write().unwrap();

        let mut second = instance_locker(dir.path()).unwrap();
        assert!(second.try_write().is_err());
    }
}
