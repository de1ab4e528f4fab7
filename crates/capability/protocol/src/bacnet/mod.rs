//! BACnet/IP 插件。
//!
//! - `encoding`：应用/上下文标签，对象与属性标识
//! - `npdu`：BVLC 与网络层
//! - `apdu`：ReadProperty(Multiple)、WriteProperty、Who-Is/I-Am
//! - `client`：UDP 端点，按 invoke id 分发应答
//! - `model`：连接配置、设备寻址、点位扩展属性、采集批次
//! - `adapter` / `connector` / `plugin`：与 Modbus 插件同构

pub mod adapter;
pub mod apdu;
pub mod client;
pub mod connector;
pub mod encoding;
pub mod model;
pub mod npdu;
mod plugin;

pub use adapter::{BacnetAdapter, BacnetCommand, PreOp, WriteCommand, WriteOp, write_value};
pub use client::{BacnetClient, BacnetTarget};
pub use connector::{BacnetConnector, BacnetEnv, BacnetLink, ObjectIo, StatusFlags, collect_readings};
pub use encoding::{BacnetValue, ObjectId, ObjectType};
pub use model::{BacnetPoint, ConnectionConfig, ReadBatch, RemoteDevice, build_batches};
pub use plugin::BacnetPlugin;
