//! 网关运行配置加载。
//!
//! - [`AppConfig`]：进程级配置，来自 `GATEWAY_*` 环境变量
//! - [`load_device_configs`]：驱动配置目录 `<dir>/<key>/config.json`

mod device;

use std::env;
use std::path::PathBuf;

pub use device::{
    CONFIG_FILE, ConnectorDir, load_device_configs, restore_device_config, validate_device_configs,
    write_device_config,
};

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse error in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid device config {key}: {reason}")]
    Device { key: String, reason: String },
}

/// 上行 MQTT 桥接配置。
#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub topic_prefix: String,
}

/// 网关运行配置。
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub http_addr: String,
    pub config_dir: PathBuf,
    pub shadow_ttl_seconds: u64,
    pub shadow_sweep_ms: u64,
    /// 所有连接走脚本 mockRead/mockWrite
    pub virtual_mode: bool,
    /// `None` 表示未启用上行桥接
    pub mqtt: Option<MqttConfig>,
}

impl AppConfig {
    /// 从环境变量读取配置（`.env` 由调用方预先加载）。
    pub fn from_env() -> Result<Self, ConfigError> {
        let http_addr = env::var("GATEWAY_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8081".to_string());
        let config_dir = PathBuf::from(
            env::var("GATEWAY_CONFIG_DIR").unwrap_or_else(|_| "./res/driver".to_string()),
        );
        let shadow_ttl_seconds = read_u64_with_default("GATEWAY_SHADOW_TTL_SECONDS", 86_400)?;
        if shadow_ttl_seconds == 0 {
            return Err(ConfigError::Invalid(
                "GATEWAY_SHADOW_TTL_SECONDS".to_string(),
                "0".to_string(),
            ));
        }
        let shadow_sweep_ms = read_u64_with_default("GATEWAY_SHADOW_SWEEP_MS", 1_000)?
            .clamp(10, shadow_ttl_seconds.saturating_mul(1_000));
        let virtual_mode = read_bool_with_default("GATEWAY_VIRTUAL", false)?;

        let mqtt = if read_bool_with_default("GATEWAY_MQTT_ENABLED", false)? {
            Some(MqttConfig {
                host: env::var("GATEWAY_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: read_u16_with_default("GATEWAY_MQTT_PORT", 1883)?,
                username: read_optional("GATEWAY_MQTT_USERNAME"),
                password: read_optional("GATEWAY_MQTT_PASSWORD"),
                client_id: env::var("GATEWAY_MQTT_CLIENT_ID")
                    .unwrap_or_else(|_| "driver-gateway".to_string()),
                topic_prefix: env::var("GATEWAY_MQTT_TOPIC_PREFIX")
                    .map(|p| p.trim_end_matches('/').to_string())
                    .unwrap_or_else(|_| "driverbox".to_string()),
            })
        } else {
            None
        };

        Ok(Self {
            http_addr,
            config_dir,
            shadow_ttl_seconds,
            shadow_sweep_ms,
            virtual_mode,
            mqtt,
        })
    }
}

fn read_u16_with_default(key: &str, default: u16) -> Result<u16, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_bool_with_default(key: &str, default: bool) -> Result<bool, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid(key.to_string(), value)),
    }
}
