//! 设备影子：每台设备的在线状态与最近点位值。
//!
//! - `set_point` 刷新 last_seen，离线 → 在线时触发一次回调
//! - 后台巡检（[`DeviceShadow::spawn_sweeper`]）在超过 TTL 未更新时置为离线
//! - `may_be_offline` 累计通讯失败，达到阈值且超过宽限期才置为离线
//!
//! 回调总是在设备锁之外调用。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use domain::{PointValueData, now_epoch_ms};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::StorageError;

/// 上下线回调：`(device_sn, online)`。
pub type OnlineChangeCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// 连续通讯失败次数阈值。
pub const MAY_BE_OFFLINE_TIMES: u32 = 3;
/// 通讯失败判定离线前，距离最近一次数据的最短时长。
pub const MAY_BE_OFFLINE_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointSnapshot {
    pub value: Option<PointValueData>,
    pub updated_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_value: Option<PointValueData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_at_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub device_sn: String,
    pub model_name: String,
    pub online: bool,
    pub ttl_ms: u64,
    pub last_seen_ms: Option<i64>,
    pub points: BTreeMap<String, PointSnapshot>,
}

#[derive(Debug, Default)]
struct PointEntry {
    value: Option<PointValueData>,
    updated_at_ms: i64,
    write_value: Option<PointValueData>,
    write_at_ms: Option<i64>,
}

#[derive(Debug)]
struct DeviceEntry {
    model_name: String,
    online: bool,
    ttl: Duration,
    last_seen: Option<Instant>,
    last_seen_ms: Option<i64>,
    disconnect_times: u32,
    points: HashMap<String, PointEntry>,
}

impl DeviceEntry {
    /// 刷新活跃时间，返回是否发生离线 → 在线。
    fn touch(&mut self) -> bool {
        self.last_seen = Some(Instant::now());
        self.last_seen_ms = Some(now_epoch_ms());
        self.disconnect_times = 0;
        let edge = !self.online;
        self.online = true;
        edge
    }

    fn expired(&self, now: Instant) -> bool {
        match self.last_seen {
            Some(seen) => now.duration_since(seen) > self.ttl,
            None => true,
        }
    }

    fn snapshot(&self, device_sn: &str) -> DeviceSnapshot {
        DeviceSnapshot {
            device_sn: device_sn.to_string(),
            model_name: self.model_name.clone(),
            online: self.online,
            ttl_ms: self.ttl.as_millis() as u64,
            last_seen_ms: self.last_seen_ms,
            points: self
                .points
                .iter()
                .map(|(name, p)| {
                    (
                        name.clone(),
                        PointSnapshot {
                            value: p.value.clone(),
                            updated_at_ms: p.updated_at_ms,
                            write_value: p.write_value.clone(),
                            write_at_ms: p.write_at_ms,
                        },
                    )
                })
                .collect(),
        }
    }
}

struct ShadowInner {
    default_ttl: Duration,
    devices: RwLock<HashMap<String, Arc<Mutex<DeviceEntry>>>>,
    callback: RwLock<Option<OnlineChangeCallback>>,
}

#[derive(Clone)]
pub struct DeviceShadow {
    inner: Arc<ShadowInner>,
}

impl DeviceShadow {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(ShadowInner {
                default_ttl,
                devices: RwLock::new(HashMap::new()),
                callback: RwLock::new(None),
            }),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    /// 幂等：已存在的设备保持原状态。新设备初始为离线。
    pub fn add_device(&self, device_sn: &str, model_name: &str) {
        self.add_device_with_ttl(device_sn, model_name, None);
    }

    pub fn add_device_with_ttl(&self, device_sn: &str, model_name: &str, ttl: Option<Duration>) {
        let mut devices = self
            .inner
            .devices
            .write()
            .unwrap_or_else(|e| e.into_inner());
        devices.entry(device_sn.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(DeviceEntry {
                model_name: model_name.to_string(),
                online: false,
                ttl: ttl.unwrap_or(self.inner.default_ttl),
                last_seen: None,
                last_seen_ms: None,
                disconnect_times: 0,
                points: HashMap::new(),
            }))
        });
    }

    pub fn has_device(&self, device_sn: &str) -> bool {
        self.entry(device_sn).is_ok()
    }

    pub fn set_online_change_callback(&self, callback: OnlineChangeCallback) {
        *self
            .inner
            .callback
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    /// 写入点位值并刷新活跃时间。
    pub fn set_point(
        &self,
        device_sn: &str,
        point_name: &str,
        value: PointValueData,
    ) -> Result<(), StorageError> {
        let entry = self.entry(device_sn)?;
        let edge = {
            let mut device = entry.lock().map_err(|_| StorageError::Lock)?;
            let point = device.points.entry(point_name.to_string()).or_default();
            point.value = Some(value);
            point.updated_at_ms = now_epoch_ms();
            device.touch()
        };
        if edge {
            self.fire(device_sn, true);
        }
        Ok(())
    }

    /// 变化检测：值与影子中相同则只刷新活跃时间并返回 `false`，
    /// 否则写入并返回 `true`。比较与写入在同一把设备锁内完成。
    pub fn set_point_if_changed(
        &self,
        device_sn: &str,
        point_name: &str,
        value: PointValueData,
    ) -> Result<bool, StorageError> {
        let entry = self.entry(device_sn)?;
        let (changed, edge) = {
            let mut device = entry.lock().map_err(|_| StorageError::Lock)?;
            let point = device.points.entry(point_name.to_string()).or_default();
            let changed = point.value.as_ref() != Some(&value);
            if changed {
                point.value = Some(value);
                point.updated_at_ms = now_epoch_ms();
            }
            (changed, device.touch())
        };
        if edge {
            self.fire(device_sn, true);
        }
        Ok(changed)
    }

    pub fn get_point(&self, device_sn: &str, point_name: &str) -> Option<PointValueData> {
        let entry = self.entry(device_sn).ok()?;
        let device = entry.lock().ok()?;
        device.points.get(point_name)?.value.clone()
    }

    pub fn set_write_point_value(
        &self,
        device_sn: &str,
        point_name: &str,
        value: PointValueData,
    ) -> Result<(), StorageError> {
        let entry = self.entry(device_sn)?;
        let mut device = entry.lock().map_err(|_| StorageError::Lock)?;
        let point = device.points.entry(point_name.to_string()).or_default();
        point.write_value = Some(value);
        point.write_at_ms = Some(now_epoch_ms());
        Ok(())
    }

    pub fn get_write_point_value(&self, device_sn: &str, point_name: &str) -> Option<PointValueData> {
        let entry = self.entry(device_sn).ok()?;
        let device = entry.lock().ok()?;
        device.points.get(point_name)?.write_value.clone()
    }

    pub fn is_online(&self, device_sn: &str) -> Option<bool> {
        let entry = self.entry(device_sn).ok()?;
        let device = entry.lock().ok()?;
        Some(device.online)
    }

    /// 通讯失败上报。离线判定由失败次数与距离最近数据的时长共同决定。
    pub fn may_be_offline(&self, device_sn: &str) -> Result<(), StorageError> {
        self.may_be_offline_with_grace(device_sn, MAY_BE_OFFLINE_GRACE)
    }

    pub fn may_be_offline_with_grace(
        &self,
        device_sn: &str,
        grace: Duration,
    ) -> Result<(), StorageError> {
        let entry = self.entry(device_sn)?;
        let edge = {
            let mut device = entry.lock().map_err(|_| StorageError::Lock)?;
            device.disconnect_times = device.disconnect_times.saturating_add(1);
            let quiet = device
                .last_seen
                .map(|seen| seen.elapsed() > grace)
                .unwrap_or(true);
            debug!(
                target: "gw.shadow",
                device_sn,
                times = device.disconnect_times,
                "device may be offline"
            );
            if device.online && quiet && device.disconnect_times >= MAY_BE_OFFLINE_TIMES {
                device.online = false;
                device.disconnect_times = 0;
                true
            } else {
                false
            }
        };
        if edge {
            self.fire(device_sn, false);
        }
        Ok(())
    }

    /// 巡检一次，返回本轮被置为离线的设备。
    pub fn sweep(&self) -> Vec<String> {
        let entries: Vec<(String, Arc<Mutex<DeviceEntry>>)> = self
            .inner
            .devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(sn, entry)| (sn.clone(), entry.clone()))
            .collect();

        let now = Instant::now();
        let mut offline = Vec::new();
        for (sn, entry) in entries {
            let expired = match entry.lock() {
                Ok(mut device) if device.online && device.expired(now) => {
                    device.online = false;
                    true
                }
                _ => false,
            };
            if expired {
                self.fire(&sn, false);
                offline.push(sn);
            }
        }
        offline
    }

    /// 启动后台巡检，周期不超过默认 TTL。
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let every = every
            .min(self.inner.default_ttl)
            .max(Duration::from_millis(10));
        let shadow = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                shadow.sweep();
            }
        })
    }

    pub fn device_snapshot(&self, device_sn: &str) -> Option<DeviceSnapshot> {
        let entry = self.entry(device_sn).ok()?;
        let device = entry.lock().ok()?;
        Some(device.snapshot(device_sn))
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let devices = self
            .inner
            .devices
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<DeviceSnapshot> = devices
            .iter()
            .filter_map(|(sn, entry)| entry.lock().ok().map(|d| d.snapshot(sn)))
            .collect();
        list.sort_by(|a, b| a.device_sn.cmp(&b.device_sn));
        list
    }

    fn entry(&self, device_sn: &str) -> Result<Arc<Mutex<DeviceEntry>>, StorageError> {
        self.inner
            .devices
            .read()
            .map_err(|_| StorageError::Lock)?
            .get(device_sn)
            .cloned()
            .ok_or_else(|| StorageError::DeviceNotFound(device_sn.to_string()))
    }

    fn fire(&self, device_sn: &str, online: bool) {
        info!(target: "gw.shadow", device_sn, online, "device online state changed");
        let callback = self
            .inner
            .callback
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(device_sn, online);
        }
    }
}
