//! BACnet 链路：每个 connectionKey 一个 UDP 端点，批次读取与写后回读。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::DeviceData;
use gw_script::ScriptSandbox;
use gw_storage::DeviceShadow;
use serde_json::{Value, json};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bacnet::adapter::{BacnetAdapter, BacnetCommand, WriteOp};
use crate::bacnet::apdu::PropertyResult;
use crate::bacnet::client::{BacnetClient, BacnetTarget};
use crate::bacnet::encoding::{BacnetValue, ObjectId, property};
use crate::bacnet::model::ReadBatch;
use crate::error::ProtocolError;
use crate::plugin::{Connector, Frame, ProtocolAdapter, ReceiveHandler};
use crate::types::TaskSet;

/// 回读最多尝试次数；第 n 次前等待 n × 100ms。
pub const READ_BACK_ATTEMPTS: u32 = 10;
const READ_BACK_STEP: Duration = Duration::from_millis(100);
/// I-Am 记录的有效期。
pub const DISCOVERY_TTL: Duration = Duration::from_secs(600);

/// 对象级 IO。
#[async_trait]
pub trait ObjectIo: Send + Sync {
    /// 读取 PRESENT_VALUE 与 STATUS_FLAGS。
    async fn read_objects(
        &self,
        target: &BacnetTarget,
        objects: &[ObjectId],
    ) -> Result<Vec<PropertyResult>, ProtocolError>;

    async fn write_present_value(
        &self,
        target: &BacnetTarget,
        object: ObjectId,
        value: &BacnetValue,
        priority: Option<u8>,
    ) -> Result<(), ProtocolError>;

    /// 解析远端地址：配置优先，其次 I-Am 缓存。
    fn resolve(&self, _device_id: u32, configured: Option<&BacnetTarget>) -> Option<BacnetTarget> {
        configured.cloned()
    }

    /// 广播 Who-Is 以刷新地址缓存。
    async fn discover(&self, _device_id: u32) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn close(&self) {}
}

#[async_trait]
impl ObjectIo for BacnetClient {
    async fn read_objects(
        &self,
        target: &BacnetTarget,
        objects: &[ObjectId],
    ) -> Result<Vec<PropertyResult>, ProtocolError> {
        self.read_property_multiple(
            target,
            objects,
            &[property::PRESENT_VALUE, property::STATUS_FLAGS],
        )
        .await
    }

    async fn write_present_value(
        &self,
        target: &BacnetTarget,
        object: ObjectId,
        value: &BacnetValue,
        priority: Option<u8>,
    ) -> Result<(), ProtocolError> {
        self.write_property(target, object, property::PRESENT_VALUE, value, priority)
            .await
    }

    fn resolve(&self, device_id: u32, configured: Option<&BacnetTarget>) -> Option<BacnetTarget> {
        if let Some(target) = configured {
            return Some(target.clone());
        }
        self.discovered(device_id)
            .filter(|d| d.seen_at.elapsed() <= DISCOVERY_TTL)
            .map(|d| BacnetTarget {
                addr: d.addr,
                network: d.source,
            })
    }

    async fn discover(&self, device_id: u32) -> Result<(), ProtocolError> {
        self.who_is(Some((device_id, device_id))).await
    }

    fn close(&self) {
        BacnetClient::close(self);
    }
}

/// 一个连接的 UDP 端点；虚拟连接不绑定端口。
pub struct BacnetLink {
    key: String,
    io: Option<Arc<dyn ObjectIo>>,
}

impl BacnetLink {
    pub fn new(key: impl Into<String>, io: Option<Arc<dyn ObjectIo>>) -> Self {
        Self {
            key: key.into(),
            io,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_virtual(&self) -> bool {
        self.io.is_none()
    }

    pub fn io(&self) -> Option<&Arc<dyn ObjectIo>> {
        self.io.as_ref()
    }

    pub fn close(&self) {
        if let Some(io) = &self.io {
            io.close();
        }
    }
}

/// 对象读数的状态标志。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub alarm: bool,
    pub fault: bool,
    pub overridden: bool,
    pub out_of_service: bool,
}

impl StatusFlags {
    pub fn from_bits(bits: &[bool]) -> Self {
        let bit = |i: usize| bits.get(i).copied().unwrap_or(false);
        Self {
            alarm: bit(0),
            fault: bit(1),
            overridden: bit(2),
            out_of_service: bit(3),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "alarm": self.alarm.to_string(),
            "fault": self.fault.to_string(),
            "overridden": self.overridden.to_string(),
            "outofservice": self.out_of_service.to_string(),
        })
    }
}

/// 单个对象的读数。
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectReading {
    pub object: ObjectId,
    pub value: BacnetValue,
    pub status: StatusFlags,
}

/// 按对象汇总 ReadPropertyMultiple 结果；读取失败的对象被跳过。
pub fn collect_readings(results: &[PropertyResult]) -> Vec<ObjectReading> {
    let mut readings: Vec<ObjectReading> = Vec::new();
    for result in results {
        let Ok(values) = &result.value else {
            debug!(target: "gw.bacnet", object = %result.object, property = result.property, "property error skipped");
            continue;
        };
        match result.property {
            property::PRESENT_VALUE => {
                let Some(value) = values.first() else {
                    continue;
                };
                match readings.iter_mut().find(|r| r.object == result.object) {
                    Some(reading) => reading.value = value.clone(),
                    None => readings.push(ObjectReading {
                        object: result.object,
                        value: value.clone(),
                        status: StatusFlags::default(),
                    }),
                }
            }
            property::STATUS_FLAGS => {
                let Some(BacnetValue::BitString(bits)) = values.first() else {
                    continue;
                };
                let status = StatusFlags::from_bits(bits);
                match readings.iter_mut().find(|r| r.object == result.object) {
                    Some(reading) => reading.status = status,
                    None => readings.push(ObjectReading {
                        object: result.object,
                        value: BacnetValue::Null,
                        status,
                    }),
                }
            }
            _ => {}
        }
    }
    readings.retain(|r| r.value != BacnetValue::Null);
    readings
}

fn report(device_sn: &str, point_name: &str, value: Value, status: Value) -> String {
    json!({
        "deviceSn": device_sn,
        "pointName": point_name,
        "value": value,
        "status": status,
    })
    .to_string()
}

/// 链路执行命令时需要的插件级依赖。
pub struct BacnetEnv {
    pub key: String,
    pub adapter: Arc<BacnetAdapter>,
    pub script: Option<Arc<ScriptSandbox>>,
    pub on_receive: Arc<dyn ReceiveHandler>,
    pub shadow: DeviceShadow,
    /// 写后回读任务
    pub watchers: TaskSet,
}

impl BacnetEnv {
    fn script(&self) -> Result<&ScriptSandbox, ProtocolError> {
        self.script.as_deref().ok_or_else(|| {
            ProtocolError::Config(format!("{}: virtual connection needs a script", self.key))
        })
    }

    fn resolve(
        &self,
        io: &dyn ObjectIo,
        device_id: u32,
        configured: Option<&BacnetTarget>,
    ) -> Result<BacnetTarget, ProtocolError> {
        io.resolve(device_id, configured).ok_or_else(|| {
            ProtocolError::Connection(format!("bacnet device {device_id} not discovered yet"))
        })
    }

    pub async fn execute(
        self: &Arc<Self>,
        link: &BacnetLink,
        command: BacnetCommand,
    ) -> Result<(), ProtocolError> {
        match command {
            BacnetCommand::Read(batches) => {
                for batch in &batches {
                    self.read_batch(link, batch).await?;
                }
                Ok(())
            }
            BacnetCommand::Write(ops) => {
                for op in &ops {
                    self.write(link, op).await?;
                }
                Ok(())
            }
        }
    }

    /// 读取一个批次并交给接收流水线。
    pub async fn read_batch(&self, link: &BacnetLink, batch: &ReadBatch) -> Result<(), ProtocolError> {
        let mut raws = Vec::new();
        match &link.io {
            None => {
                let script = self.script()?;
                for object in &batch.objects {
                    for (device_sn, point_name) in &object.points {
                        match script.mock_read(device_sn, point_name) {
                            Ok(value) => raws.push(report(
                                device_sn,
                                point_name,
                                value,
                                StatusFlags::default().to_json(),
                            )),
                            Err(e) => {
                                warn!(target: "gw.bacnet", key = %self.key, device_sn, point_name, error = %e, "mock read failed");
                            }
                        }
                    }
                }
            }
            Some(io) => {
                let target = match self.resolve(io.as_ref(), batch.device_id, batch.target.as_ref()) {
                    Ok(target) => target,
                    Err(e) => {
                        if let Err(err) = io.discover(batch.device_id).await {
                            debug!(target: "gw.bacnet", device_id = batch.device_id, error = %err, "who-is failed");
                        }
                        return Err(e);
                    }
                };
                let results = io.read_objects(&target, &batch.object_ids()).await?;
                for reading in collect_readings(&results) {
                    let Some(points) = batch.points_of(reading.object) else {
                        continue;
                    };
                    for (device_sn, point_name) in points {
                        raws.push(report(
                            device_sn,
                            point_name,
                            reading.value.to_json(),
                            reading.status.to_json(),
                        ));
                    }
                }
            }
        }

        let mut data: Vec<DeviceData> = Vec::new();
        for raw in raws {
            match self.adapter.decode(&raw) {
                Ok(decoded) => data.extend(decoded),
                Err(e) => {
                    warn!(target: "gw.bacnet", key = %self.key, error = %e, "decode failed");
                }
            }
        }
        if !data.is_empty() {
            self.on_receive.handle(data).await;
        }
        Ok(())
    }

    /// 写入 PRESENT_VALUE；成功后按需启动回读。
    pub async fn write(self: &Arc<Self>, link: &BacnetLink, op: &WriteOp) -> Result<(), ProtocolError> {
        let Some(io) = &link.io else {
            self.script()?
                .mock_write(&op.device_sn, &op.point_name, &op.requested)?;
            return Ok(());
        };
        let target = self.resolve(io.as_ref(), op.device_id, op.target.as_ref())?;
        io.write_present_value(&target, op.object, &op.value, op.priority)
            .await?;
        debug!(
            target: "gw.bacnet",
            key = %self.key,
            device_sn = %op.device_sn,
            point = %op.point_name,
            object = %op.object,
            "write acknowledged"
        );
        if op.read_back {
            let handle = tokio::spawn(self.clone().read_back(io.clone(), target, op.clone()));
            self.watchers.push(handle);
        }
        Ok(())
    }

    async fn read_back(self: Arc<Self>, io: Arc<dyn ObjectIo>, target: BacnetTarget, op: WriteOp) {
        for attempt in 1..=READ_BACK_ATTEMPTS {
            tokio::time::sleep(READ_BACK_STEP * attempt).await;
            let results = match io.read_objects(&target, &[op.object]).await {
                Ok(results) => results,
                Err(e) => {
                    debug!(target: "gw.bacnet", device_sn = %op.device_sn, attempt, error = %e, "read-back failed");
                    continue;
                }
            };
            let Some(reading) = collect_readings(&results)
                .into_iter()
                .find(|r| r.object == op.object)
            else {
                continue;
            };
            if !reading.value.matches_json(&op.requested) {
                continue;
            }
            let raw = report(
                &op.device_sn,
                &op.point_name,
                reading.value.to_json(),
                reading.status.to_json(),
            );
            match self.adapter.decode(&raw) {
                Ok(data) if !data.is_empty() => self.on_receive.handle(data).await,
                Ok(_) => {}
                Err(e) => {
                    warn!(target: "gw.bacnet", key = %self.key, error = %e, "read-back decode failed");
                }
            }
            return;
        }
        info!(
            target: "gw.bacnet",
            key = %self.key,
            device_sn = %op.device_sn,
            point = %op.point_name,
            "read-back never matched written value"
        );
    }

    /// 采集失败：批次涉及的设备各上报一次。
    pub fn report_failure(&self, batch: &ReadBatch) {
        let mut seen = HashSet::new();
        for sn in batch.device_sns() {
            if seen.insert(sn.clone())
                && let Err(e) = self.shadow.may_be_offline(&sn)
            {
                debug!(target: "gw.bacnet", device_sn = %sn, error = %e, "may_be_offline skipped");
            }
        }
    }
}

/// 链路租约。
pub struct BacnetConnector {
    link: OwnedMutexGuard<BacnetLink>,
    env: Arc<BacnetEnv>,
}

impl BacnetConnector {
    pub fn new(link: OwnedMutexGuard<BacnetLink>, env: Arc<BacnetEnv>) -> Self {
        Self { link, env }
    }
}

#[async_trait]
impl Connector for BacnetConnector {
    async fn send(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        match frame {
            Frame::Bacnet(command) => self.env.execute(&self.link, command).await,
            other => Err(ProtocolError::UnsupportedOperation(format!(
                "bacnet connector cannot send {other:?}"
            ))),
        }
    }
}

/// 采集计划中的一个批次及其上次执行时间。
pub(crate) struct BatchSlot {
    pub batch: ReadBatch,
    pub last_run: Option<Instant>,
}

impl BatchSlot {
    pub fn due(&self, now: Instant) -> bool {
        self.last_run
            .map(|last| now.duration_since(last) >= self.batch.duration)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::encoding::ObjectType;

    fn result(object: ObjectId, property: u32, value: Result<Vec<BacnetValue>, (u32, u32)>) -> PropertyResult {
        PropertyResult {
            object,
            property,
            index: None,
            value,
        }
    }

    #[test]
    fn test_collect_readings() {
        let ai = ObjectId::new(ObjectType::AnalogInput, 1);
        let bv = ObjectId::new(ObjectType::BinaryValue, 2);
        let results = vec![
            result(ai, property::PRESENT_VALUE, Ok(vec![BacnetValue::Real(21.5)])),
            result(
                ai,
                property::STATUS_FLAGS,
                Ok(vec![BacnetValue::BitString(vec![false, true, false, false])]),
            ),
            result(bv, property::PRESENT_VALUE, Err((2, 32))),
            result(
                bv,
                property::STATUS_FLAGS,
                Ok(vec![BacnetValue::BitString(vec![false; 4])]),
            ),
        ];
        let readings = collect_readings(&results);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].object, ai);
        assert!(readings[0].status.fault);
        assert_eq!(readings[0].status.to_json()["fault"], "true");
    }

    #[test]
    fn test_batch_slot_due() {
        let slot = BatchSlot {
            batch: ReadBatch {
                device_id: 1,
                target: None,
                duration: Duration::from_secs(1),
                objects: Vec::new(),
            },
            last_run: None,
        };
        let now = Instant::now();
        assert!(slot.due(now));
        let ran = BatchSlot {
            last_run: Some(now),
            ..slot
        };
        assert!(!ran.due(now));
    }
}
