//! # Gateway Storage 模块
//!
//! 网关运行时的内存存储，生命周期与一个配置周期相同，重载时整体替换。
//!
//! ## 模块说明
//!
//! - [`registry`]：CoreCache 注册表（物模型 → 设备 → 点位，运行中的插件）
//!   - 构建后结构只读，并发读取无需外部加锁
//!   - 插件按驱动目录 key 登记，可按设备 SN / 物模型名 / 目录 key 查找
//! - [`shadow`]：设备影子（在线状态、最近点位值、最近写入值）
//!   - 每台设备一把锁，巡检与写入同一设备互斥
//!   - 上下线回调在锁外调用
//! - [`error`]：存储错误类型定义
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use gw_storage::{CoreCache, DeviceShadow};
//!
//! let registry: CoreCache<dyn Plugin> = CoreCache::build(&configs)?;
//! let shadow = DeviceShadow::new(Duration::from_secs(86400));
//! for device in registry.devices() {
//!     shadow.add_device(&device.device_sn, &device.model_name);
//! }
//! let sweeper = shadow.spawn_sweeper(Duration::from_secs(1));
//! ```

pub mod error;
pub mod registry;
pub mod shadow;

pub use error::*;
pub use registry::{CoreCache, Model};
pub use shadow::{
    DeviceShadow, DeviceSnapshot, MAY_BE_OFFLINE_GRACE, MAY_BE_OFFLINE_TIMES, OnlineChangeCallback,
    PointSnapshot,
};
