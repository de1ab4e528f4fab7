//! BACnet 连接配置、设备寻址、点位扩展属性与采集批次。

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use domain::{Device, Point};
use serde::Deserialize;
use serde_json::Value;

use crate::bacnet::client::{BacnetTarget, DEFAULT_PORT};
use crate::bacnet::encoding::{ObjectId, ObjectType};
use crate::bacnet::npdu::NetworkAddress;
use crate::error::ProtocolError;
use crate::types::duration_field;

/// 单批最多读取的对象数。
pub const MAX_BATCH_OBJECTS: usize = 15;
/// 点位默认采集周期。
pub const DEFAULT_POINT_DURATION: Duration = Duration::from_secs(1);
/// 连接级节拍上限。
pub const DEFAULT_TICK: Duration = Duration::from_secs(5);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConnection {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    interface: String,
    #[serde(default)]
    local_ip: String,
    #[serde(default)]
    local_subnet: u8,
    #[serde(default)]
    local_port: u16,
    #[serde(default)]
    duration: Option<Value>,
    #[serde(default)]
    timeout: Option<Value>,
    #[serde(default, rename = "virtual")]
    virtual_mode: bool,
}

/// `connections.<key>`（`mode: "ip"`）。
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// 仅记录，绑定以 `localIp` 为准
    pub interface: String,
    pub local_ip: IpAddr,
    pub local_subnet: u8,
    pub local_port: u16,
    /// 连接级节拍；未配置时由批次周期推导
    pub tick: Option<Duration>,
    pub timeout: Duration,
    pub virtual_mode: bool,
}

impl ConnectionConfig {
    pub fn parse(key: &str, raw: &Value) -> Result<Self, ProtocolError> {
        let raw: RawConnection = serde_json::from_value(raw.clone())
            .map_err(|e| ProtocolError::Config(format!("connection {key}: {e}")))?;
        if let Some(mode) = raw.mode.as_deref()
            && !mode.eq_ignore_ascii_case("ip")
        {
            return Err(ProtocolError::Config(format!(
                "connection {key}: unsupported bacnet mode {mode}"
            )));
        }
        let local_ip = if raw.local_ip.trim().is_empty() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            raw.local_ip.trim().parse().map_err(|e| {
                ProtocolError::Config(format!("connection {key}: localIp {}: {e}", raw.local_ip))
            })?
        };
        if raw.local_subnet > 32 {
            return Err(ProtocolError::Config(format!(
                "connection {key}: localSubnet {} out of range",
                raw.local_subnet
            )));
        }
        let tick = match raw.duration.as_ref() {
            None | Some(Value::Null) => None,
            Some(v) => Some(non_zero(
                duration_field(Some(v), DEFAULT_TICK)?,
                &format!("connection {key}: duration"),
            )?),
        };
        Ok(Self {
            interface: raw.interface,
            local_ip,
            local_subnet: raw.local_subnet,
            local_port: if raw.local_port == 0 {
                DEFAULT_PORT
            } else {
                raw.local_port
            },
            tick,
            timeout: duration_field(raw.timeout.as_ref(), DEFAULT_TIMEOUT)?,
            virtual_mode: raw.virtual_mode,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_ip, self.local_port)
    }

    /// 节拍：显式配置优先，否则取 5s 与最短批次周期中的较小者。
    pub fn tick_for(&self, batches: &[ReadBatch]) -> Duration {
        self.tick.unwrap_or_else(|| {
            batches
                .iter()
                .map(|b| b.duration)
                .min()
                .map(|d| d.min(DEFAULT_TICK))
                .unwrap_or(DEFAULT_TICK)
        })
    }
}

/// 设备 `properties` 中的寻址信息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    pub device_id: u32,
    /// 缺省时依赖 I-Am 发现的地址
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub network_number: u16,
    pub mac_mstp: u8,
    pub max_apdu: u32,
    pub segmentation: u32,
}

fn property<T: std::str::FromStr>(device: &Device, name: &str, default: T) -> Result<T, ProtocolError>
where
    T::Err: std::fmt::Display,
{
    match device.properties.get(name).map(|s| s.trim()) {
        None | Some("") => Ok(default),
        Some(raw) => raw.parse().map_err(|e| {
            ProtocolError::Config(format!(
                "device {}: property {name}={raw}: {e}",
                device.device_sn
            ))
        }),
    }
}

impl RemoteDevice {
    pub fn from_device(device: &Device) -> Result<Self, ProtocolError> {
        let ip = match device.properties.get("ip").map(|s| s.trim()) {
            Some(raw) if !raw.is_empty() => Some(raw.parse::<IpAddr>().map_err(|e| {
                ProtocolError::Config(format!("device {}: ip {raw}: {e}", device.device_sn))
            })?),
            _ => None,
        };
        let device_id = match device.properties.get("id").map(|s| s.trim()) {
            Some(raw) if !raw.is_empty() => raw.parse::<u32>().map_err(|e| {
                ProtocolError::Config(format!("device {}: id {raw}: {e}", device.device_sn))
            })?,
            _ => {
                return Err(ProtocolError::Config(format!(
                    "device {}: property id missing",
                    device.device_sn
                )));
            }
        };
        if device_id > ObjectId::MAX_INSTANCE {
            return Err(ProtocolError::Config(format!(
                "device {}: id {device_id} out of range",
                device.device_sn
            )));
        }
        Ok(Self {
            device_id,
            ip,
            port: property(device, "port", DEFAULT_PORT)?,
            network_number: property(device, "networkNumber", 0)?,
            mac_mstp: property(device, "macMstp", 0)?,
            max_apdu: property(device, "maxApdu", 1476)?,
            segmentation: property(device, "segmentation", 0)?,
        })
    }

    /// 配置给出的寻址；没有 ip 时返回 `None`。
    pub fn target(&self) -> Option<BacnetTarget> {
        let ip = self.ip?;
        Some(BacnetTarget {
            addr: SocketAddr::new(ip, self.port),
            network: (self.network_number != 0).then(|| NetworkAddress {
                network: self.network_number,
                mac: vec![self.mac_mstp],
            }),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointExtends {
    object_type: Value,
    instance: Value,
    #[serde(default)]
    default_priority: Option<Value>,
    #[serde(default)]
    default_null: bool,
    #[serde(default)]
    duration: Option<Value>,
}

fn as_u32(field: &str, value: &Value) -> Result<u32, ProtocolError> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| ProtocolError::Config(format!("{field} {value} is not an unsigned integer")))
}

/// 点位的 BACnet 扩展属性。
#[derive(Debug, Clone, PartialEq)]
pub struct BacnetPoint {
    pub device_sn: String,
    pub name: String,
    pub object: ObjectId,
    pub default_priority: Option<u8>,
    pub default_null: bool,
    pub duration: Duration,
    pub readable: bool,
    pub writable: bool,
}

impl BacnetPoint {
    pub fn from_point(device_sn: &str, point: &Point) -> Result<Self, ProtocolError> {
        let ctx = |e: ProtocolError| {
            ProtocolError::Config(format!("point {device_sn}/{}: {e}", point.name))
        };
        let ext: PointExtends = serde_json::from_value(Value::Object(point.extends.clone()))
            .map_err(|e| ProtocolError::Config(format!("point {device_sn}/{}: {e}", point.name)))?;
        let object_type = match &ext.object_type {
            Value::String(s) => ObjectType::parse(s),
            Value::Number(n) => n
                .as_u64()
                .and_then(|v| u16::try_from(v).ok())
                .map(ObjectType::from_code)
                .ok_or_else(|| ProtocolError::Config(format!("objectType {n}"))),
            other => Err(ProtocolError::Config(format!("objectType {other}"))),
        }
        .map_err(ctx)?;
        let instance = as_u32("instance", &ext.instance).map_err(ctx)?;
        if instance > ObjectId::MAX_INSTANCE {
            return Err(ctx(ProtocolError::Config(format!("instance {instance} out of range"))));
        }
        let default_priority = match ext.default_priority.as_ref() {
            None | Some(Value::Null) => None,
            Some(v) => {
                let p = as_u32("defaultPriority", v).map_err(ctx)?;
                if p == 0 {
                    None
                } else if p <= 16 {
                    Some(p as u8)
                } else {
                    return Err(ctx(ProtocolError::Config(format!(
                        "defaultPriority {p} not in 1..=16"
                    ))));
                }
            }
        };
        Ok(Self {
            device_sn: device_sn.to_string(),
            name: point.name.clone(),
            object: ObjectId::new(object_type, instance),
            default_priority,
            default_null: ext.default_null,
            duration: duration_field(ext.duration.as_ref(), DEFAULT_POINT_DURATION)
                .and_then(|d| non_zero(d, "duration"))
                .map_err(ctx)?,
            readable: point.read_write.readable(),
            writable: point.read_write.writable(),
        })
    }
}

/// 采集周期为零会让 interval 直接 panic。
fn non_zero(duration: Duration, what: &str) -> Result<Duration, ProtocolError> {
    if duration.is_zero() {
        return Err(ProtocolError::Config(format!("{what} must be greater than zero")));
    }
    Ok(duration)
}

/// 批次中的一个对象及其映射到的 `(deviceSn, pointName)`。
#[derive(Debug, Clone, PartialEq)]
pub struct BatchObject {
    pub object: ObjectId,
    /// 同一远端设备上的同一对象可被多个网关设备（及同一设备的多个点位）引用
    pub points: BTreeSet<(String, String)>,
}

/// 一次 ReadPropertyMultiple。
#[derive(Debug, Clone, PartialEq)]
pub struct ReadBatch {
    pub device_id: u32,
    pub target: Option<BacnetTarget>,
    pub duration: Duration,
    pub objects: Vec<BatchObject>,
}

impl ReadBatch {
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.objects.iter().map(|o| o.object).collect()
    }

    pub fn points_of(&self, object: ObjectId) -> Option<&BTreeSet<(String, String)>> {
        self.objects
            .iter()
            .find(|o| o.object == object)
            .map(|o| &o.points)
    }

    pub fn device_sns(&self) -> Vec<String> {
        let mut sns: Vec<String> = self
            .objects
            .iter()
            .flat_map(|o| o.points.iter().map(|(sn, _)| sn.clone()))
            .collect();
        sns.sort();
        sns.dedup();
        sns
    }
}

/// 按 (远端设备, 周期) 首次适配装入批次，每批至多 15 个对象。可读性由调用方筛选。
pub fn build_batches<'a>(
    points: impl IntoIterator<Item = (&'a RemoteDevice, &'a BacnetPoint)>,
) -> Vec<ReadBatch> {
    let mut batches: Vec<ReadBatch> = Vec::new();
    for (remote, point) in points {
        if !point.object.object_type.is_point() {
            continue;
        }
        let same_slot = |b: &ReadBatch| b.device_id == remote.device_id && b.duration == point.duration;

        if let Some(existing) = batches
            .iter_mut()
            .filter(|b| same_slot(b))
            .find_map(|b| b.objects.iter_mut().find(|o| o.object == point.object))
        {
            existing
                .points
                .insert((point.device_sn.clone(), point.name.clone()));
            continue;
        }

        let entry = BatchObject {
            object: point.object,
            points: BTreeSet::from([(point.device_sn.clone(), point.name.clone())]),
        };
        match batches
            .iter_mut()
            .find(|b| same_slot(b) && b.objects.len() < MAX_BATCH_OBJECTS)
        {
            Some(batch) => batch.objects.push(entry),
            None => batches.push(ReadBatch {
                device_id: remote.device_id,
                target: remote.target(),
                duration: point.duration,
                objects: vec![entry],
            }),
        }
    }
    batches
}
