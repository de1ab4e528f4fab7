//! Modbus TCP / RTU over TCP 插件。
//!
//! - `codec`：寄存器 ↔ 标量
//! - `address`：寄存器表与地址记法
//! - `model`：连接配置、点位扩展属性、采集分组
//! - `adapter`：编码读组/写请求，解码读数
//! - `connector`：链路与租约，掩码写入的读改写
//! - `plugin`：链路池与周期采集

pub mod adapter;
pub mod address;
pub mod codec;
pub mod connector;
pub mod model;
mod plugin;

pub use adapter::ModbusAdapter;
pub use address::{ParsedAddress, PrimaryTable, parse_address};
pub use codec::{RawType, ScalarValue, decode_scalar, encode_scalar};
pub use connector::{
    LinkEnv, ModbusCommand, ModbusConnector, ModbusLink, RegisterIo, TcpRegisterIo, WriteRequest,
    decode_group, decode_point,
};
pub use model::{ConnectionConfig, ModbusPoint, PointGroup, TransportMode, build_groups};
pub use plugin::ModbusPlugin;
