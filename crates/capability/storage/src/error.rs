//! 存储层错误类型
//!
//! 注册表构建失败（声明冲突）与影子操作失败（设备/点位不存在）统一在此表达。

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("duplicate declaration: {0}")]
    Duplicate(String),
    #[error("invalid declaration: {0}")]
    Invalid(String),
    #[error("lock failed")]
    Lock,
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::DeviceNotFound(_) | Self::ModelNotFound(_))
    }
}
