//! 协议错误类型定义

use gw_script::ScriptError;

/// 协议通信错误
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// 配置错误（初始化阶段致命）
    #[error("config error: {0}")]
    Config(String),

    /// 设备/点位/连接/插件不存在
    #[error("not found: {0}")]
    NotFound(String),

    /// 连接错误
    #[error("connection error: {0}")]
    Connection(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 超时错误
    #[error("timeout: {0}")]
    Timeout(String),

    /// Modbus 错误
    #[error("modbus error: {0}")]
    Modbus(String),

    /// BACnet 错误（对端返回 Error/Reject/Abort）
    #[error("bacnet error: {0}")]
    Bacnet(String),

    /// 数据解析错误
    #[error("decode error: {0}")]
    Decode(String),

    /// 编码错误
    #[error("encode error: {0}")]
    Encode(String),

    /// 插件不支持的操作（如服务端插件下发）
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// 脚本调用失败
    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    /// 寄存器数量与类型不符
    #[error("length mismatch: expected {expected} registers, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// 未知的寄存器原始类型
    #[error("unknown raw type: {0}")]
    UnknownRawType(String),

    /// 不支持写入的 BACnet 对象类型
    #[error("unsupported object type: {0}")]
    UnsupportedObjectType(String),

    /// 通道关闭
    #[error("channel closed")]
    ChannelClosed,
}

impl ProtocolError {
    /// 传输层失败（需要上报 `may_be_offline`）。
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::Io(_)
                | Self::Timeout(_)
                | Self::Modbus(_)
                | Self::Bacnet(_)
                | Self::ChannelClosed
        )
    }
}
