//! 驱动配置目录：`<dir>/<key>/config.json` 与同目录的 `converter.js`。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use domain::DeviceConfig;
use gw_protocol::is_known_protocol;
use gw_script::SCRIPT_FILE;
use tracing::{debug, info, warn};

use crate::ConfigError;

pub const CONFIG_FILE: &str = "config.json";

/// 一个驱动目录的加载结果。
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorDir {
    pub config: DeviceConfig,
    /// 同目录下的脚本文件（存在时）
    pub script: Option<PathBuf>,
}

/// 加载并校验整个配置目录。目录不存在时返回空集合。
pub fn load_device_configs(dir: &Path) -> Result<BTreeMap<String, ConnectorDir>, ConfigError> {
    let mut loaded = BTreeMap::new();
    if !dir.exists() {
        warn!(target: "gw.config", dir = %dir.display(), "config dir not found, no connectors loaded");
        return Ok(loaded);
    }
    let entries = fs::read_dir(dir).map_err(|source| io_error(dir, source))?;
    for entry in entries {
        let entry = entry.map_err(|source| io_error(dir, source))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let config_path = path.join(CONFIG_FILE);
        if !config_path.is_file() {
            debug!(target: "gw.config", dir = %path.display(), "no config.json, skipped");
            continue;
        }
        let key = entry.file_name().to_string_lossy().into_owned();
        let text = fs::read_to_string(&config_path).map_err(|source| io_error(&config_path, source))?;
        let mut config: DeviceConfig = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: config_path.display().to_string(),
            source,
        })?;
        config.key = key.clone();
        let script = Some(path.join(SCRIPT_FILE)).filter(|p| p.is_file());
        loaded.insert(key, ConnectorDir { config, script });
    }

    let configs: BTreeMap<String, DeviceConfig> = loaded
        .iter()
        .map(|(key, dir)| (key.clone(), dir.config.clone()))
        .collect();
    validate_device_configs(&configs)?;
    info!(target: "gw.config", connectors = loaded.len(), "device configs loaded");
    Ok(loaded)
}

/// 校验全部驱动目录：协议名、模型/点位/设备唯一性与引用关系。
pub fn validate_device_configs(configs: &BTreeMap<String, DeviceConfig>) -> Result<(), ConfigError> {
    let mut models: HashMap<&str, &str> = HashMap::new();
    let mut devices: HashMap<&str, &str> = HashMap::new();
    for (key, config) in configs {
        let invalid = |reason: String| ConfigError::Device {
            key: key.clone(),
            reason,
        };
        if !is_known_protocol(&config.protocol_name) {
            return Err(invalid(format!("unknown protocol {}", config.protocol_name)));
        }
        for model in &config.device_models {
            if let Some(other) = models.insert(&model.name, key) {
                return Err(invalid(format!("model {} already declared in {other}", model.name)));
            }
            let mut points = HashSet::new();
            for point in &model.device_points {
                if !points.insert(point.name.as_str()) {
                    return Err(invalid(format!(
                        "duplicate point {} on model {}",
                        point.name, model.name
                    )));
                }
            }
        }
        let local_models: HashSet<&str> = config.device_models.iter().map(|m| m.name.as_str()).collect();
        for (_, device) in config.devices() {
            if let Some(other) = devices.insert(&device.device_sn, key) {
                return Err(invalid(format!("device {} already declared in {other}", device.device_sn)));
            }
            if !local_models.contains(device.model_name.as_str()) {
                return Err(invalid(format!(
                    "device {} references unknown model {}",
                    device.device_sn, device.model_name
                )));
            }
            if !config.connections.contains_key(&device.connection_key) {
                return Err(invalid(format!(
                    "device {} references unknown connection {}",
                    device.device_sn, device.connection_key
                )));
            }
        }
    }
    Ok(())
}

/// 写入 `<dir>/<key>/config.json`，返回写入前的文件内容（用于回滚）。
pub fn write_device_config(dir: &Path, config: &DeviceConfig) -> Result<Option<String>, ConfigError> {
    if config.key.is_empty() || config.key.contains(['/', '\\']) || config.key.starts_with('.') {
        return Err(ConfigError::Invalid("key".to_string(), config.key.clone()));
    }
    let connector_dir = dir.join(&config.key);
    fs::create_dir_all(&connector_dir).map_err(|source| io_error(&connector_dir, source))?;
    let path = connector_dir.join(CONFIG_FILE);
    let previous = fs::read_to_string(&path).ok();
    let text = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    fs::write(&path, text).map_err(|source| io_error(&path, source))?;
    info!(target: "gw.config", key = %config.key, path = %path.display(), "device config written");
    Ok(previous)
}

/// 回滚 [`write_device_config`]：恢复旧内容，或删除新建的文件。
pub fn restore_device_config(dir: &Path, key: &str, previous: Option<String>) -> Result<(), ConfigError> {
    let path = dir.join(key).join(CONFIG_FILE);
    match previous {
        Some(text) => fs::write(&path, text).map_err(|source| io_error(&path, source)),
        None => fs::remove_file(&path).map_err(|source| io_error(&path, source)),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.display().to_string(),
        source,
    }
}
