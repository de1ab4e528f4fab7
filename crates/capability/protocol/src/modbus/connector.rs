//! Modbus 链路：每个 connectionKey 一条物理连接，命令在租约内串行执行。

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::DeviceData;
use gw_script::ScriptSandbox;
use gw_storage::DeviceShadow;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tokio_modbus::client::{Context, Reader, Writer, rtu, tcp};
use tokio_modbus::prelude::{Slave, SlaveContext};
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::modbus::address::PrimaryTable;
use crate::modbus::adapter::ModbusAdapter;
use crate::modbus::codec::{apply_mask, decode_scalar, get_bits};
use crate::modbus::model::{ConnectionConfig, ModbusPoint, PointGroup, TransportMode};
use crate::plugin::{Connector, Frame, ProtocolAdapter, ReceiveHandler};

/// 一次写入（可能由多个连续点位合并而成）。
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub device_sn: String,
    pub unit_id: u8,
    pub table: PrimaryTable,
    pub address: u16,
    pub values: Vec<u16>,
    /// 按寄存器应用的掩码；0 与 0xFFFF 视为整字写入
    pub mask: Option<u16>,
    /// 涉及的点位及其原始目标值
    pub points: Vec<(String, Value)>,
}

impl WriteRequest {
    pub fn needs_read_modify_write(&self) -> bool {
        !self.table.is_bit() && matches!(self.mask, Some(m) if m != 0 && m != 0xFFFF)
    }
}

/// 适配器编码出的 Modbus 命令。
#[derive(Debug, Clone, PartialEq)]
pub enum ModbusCommand {
    Read(Vec<PointGroup>),
    Write(Vec<WriteRequest>),
}

/// 寄存器级 IO。线圈/离散输入以 0/1 表示。
#[async_trait]
pub trait RegisterIo: Send {
    async fn read(
        &mut self,
        unit_id: u8,
        table: PrimaryTable,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ProtocolError>;

    async fn write(
        &mut self,
        unit_id: u8,
        table: PrimaryTable,
        address: u16,
        values: &[u16],
    ) -> Result<(), ProtocolError>;

    /// 丢弃底层连接，下次 IO 时重连。
    fn reset(&mut self) {}
}

/// 基于 tokio-modbus 的 TCP / RTU over TCP 客户端，断线后懒重连。
pub struct TcpRegisterIo {
    address: String,
    mode: TransportMode,
    ctx: Option<Context>,
}

impl TcpRegisterIo {
    pub fn new(address: impl Into<String>, mode: TransportMode) -> Self {
        Self {
            address: address.into(),
            mode,
            ctx: None,
        }
    }

    async fn context(&mut self, unit_id: u8) -> Result<&mut Context, ProtocolError> {
        if self.ctx.is_none() {
            let addr: SocketAddr = tokio::net::lookup_host(&self.address)
                .await?
                .next()
                .ok_or_else(|| {
                    ProtocolError::Connection(format!("cannot resolve {}", self.address))
                })?;
            let ctx = match self.mode {
                TransportMode::Tcp => tcp::connect_slave(addr, Slave(unit_id))
                    .await
                    .map_err(|e| ProtocolError::Connection(format!("{addr}: {e}")))?,
                TransportMode::RtuOverTcp => {
                    let stream = TcpStream::connect(addr)
                        .await
                        .map_err(|e| ProtocolError::Connection(format!("{addr}: {e}")))?;
                    rtu::attach_slave(stream, Slave(unit_id))
                }
            };
            debug!(target: "gw.modbus", address = %self.address, "modbus connected");
            self.ctx = Some(ctx);
        }
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| ProtocolError::Connection("modbus context missing".to_string()))?;
        ctx.set_slave(Slave(unit_id));
        Ok(ctx)
    }
}

fn modbus_err(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::Modbus(e.to_string())
}

fn exception(e: impl std::fmt::Debug) -> ProtocolError {
    ProtocolError::Modbus(format!("exception: {e:?}"))
}

fn bits_to_registers(bits: Vec<bool>) -> Vec<u16> {
    bits.into_iter().map(u16::from).collect()
}

#[async_trait]
impl RegisterIo for TcpRegisterIo {
    async fn read(
        &mut self,
        unit_id: u8,
        table: PrimaryTable,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ProtocolError> {
        let ctx = self.context(unit_id).await?;
        let regs = match table {
            PrimaryTable::Coil => bits_to_registers(
                ctx.read_coils(address, quantity)
                    .await
                    .map_err(modbus_err)?
                    .map_err(exception)?,
            ),
            PrimaryTable::DiscreteInput => bits_to_registers(
                ctx.read_discrete_inputs(address, quantity)
                    .await
                    .map_err(modbus_err)?
                    .map_err(exception)?,
            ),
            PrimaryTable::InputRegister => ctx
                .read_input_registers(address, quantity)
                .await
                .map_err(modbus_err)?
                .map_err(exception)?,
            PrimaryTable::HoldingRegister => ctx
                .read_holding_registers(address, quantity)
                .await
                .map_err(modbus_err)?
                .map_err(exception)?,
        };
        Ok(regs)
    }

    async fn write(
        &mut self,
        unit_id: u8,
        table: PrimaryTable,
        address: u16,
        values: &[u16],
    ) -> Result<(), ProtocolError> {
        let ctx = self.context(unit_id).await?;
        match (table, values) {
            (PrimaryTable::Coil, [one]) => ctx
                .write_single_coil(address, *one != 0)
                .await
                .map_err(modbus_err)?
                .map_err(exception),
            (PrimaryTable::Coil, many) => {
                let bits: Vec<bool> = many.iter().map(|v| *v != 0).collect();
                ctx.write_multiple_coils(address, &bits)
                    .await
                    .map_err(modbus_err)?
                    .map_err(exception)
            }
            (PrimaryTable::HoldingRegister, [one]) => ctx
                .write_single_register(address, *one)
                .await
                .map_err(modbus_err)?
                .map_err(exception),
            (PrimaryTable::HoldingRegister, many) => ctx
                .write_multiple_registers(address, many)
                .await
                .map_err(modbus_err)?
                .map_err(exception),
            (other, _) => Err(ProtocolError::UnsupportedOperation(format!(
                "{other:?} is read-only"
            ))),
        }
    }

    fn reset(&mut self) {
        self.ctx = None;
    }
}

/// 单条 Modbus 链路。
pub struct ModbusLink {
    key: String,
    config: ConnectionConfig,
    io: Box<dyn RegisterIo>,
    last_io: Option<Instant>,
    virtual_mode: bool,
}

impl ModbusLink {
    pub fn new(key: impl Into<String>, config: ConnectionConfig, virtual_mode: bool) -> Self {
        let io = TcpRegisterIo::new(config.address.clone(), config.mode);
        Self::with_io(key, config, virtual_mode, Box::new(io))
    }

    pub fn with_io(
        key: impl Into<String>,
        config: ConnectionConfig,
        virtual_mode: bool,
        io: Box<dyn RegisterIo>,
    ) -> Self {
        let virtual_mode = virtual_mode || config.virtual_mode;
        Self {
            key: key.into(),
            config,
            io,
            last_io: None,
            virtual_mode,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_virtual(&self) -> bool {
        self.virtual_mode
    }

    /// 与上一次 IO 至少间隔 `minInterval`。
    async fn ensure_interval(&mut self) {
        if let Some(last) = self.last_io {
            let next = last + self.config.min_interval();
            if Instant::now() < next {
                tokio::time::sleep_until(next).await;
            }
        }
        self.last_io = Some(Instant::now());
    }

    async fn read_raw(
        &mut self,
        unit_id: u8,
        table: PrimaryTable,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ProtocolError> {
        self.ensure_interval().await;
        let timeout = self.config.timeout();
        let result = match tokio::time::timeout(
            timeout,
            self.io.read(unit_id, table, address, quantity),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout(format!(
                "read {table:?} {address}+{quantity} after {timeout:?}"
            ))),
        };
        match result {
            Ok(regs) if regs.len() < usize::from(quantity) => {
                Err(ProtocolError::LengthMismatch {
                    expected: usize::from(quantity),
                    actual: regs.len(),
                })
            }
            Ok(regs) => Ok(regs),
            Err(e) => {
                self.io.reset();
                Err(e)
            }
        }
    }

    async fn write_raw(
        &mut self,
        unit_id: u8,
        table: PrimaryTable,
        address: u16,
        values: &[u16],
    ) -> Result<(), ProtocolError> {
        self.ensure_interval().await;
        let timeout = self.config.timeout();
        let result = match tokio::time::timeout(
            timeout,
            self.io.write(unit_id, table, address, values),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout(format!(
                "write {table:?} {address} after {timeout:?}"
            ))),
        };
        if result.is_err() {
            self.io.reset();
        }
        result
    }
}

/// 解码单个点位；位段点位取出 `[bit, bit + bitLen)`。
pub fn decode_point(point: &ModbusPoint, regs: &[u16]) -> Result<Value, ProtocolError> {
    if point.table.is_bit() {
        return regs
            .first()
            .map(|v| Value::from(*v))
            .ok_or(ProtocolError::LengthMismatch {
                expected: 1,
                actual: 0,
            });
    }
    let scalar = decode_scalar(point.raw_type, point.byte_swap, point.word_swap, regs)?;
    if point.bit_len > 0 {
        let raw = scalar
            .as_u64()
            .ok_or_else(|| ProtocolError::Decode(format!("{}: bit read on non-integer", point.name)))?;
        return Ok(Value::from(get_bits(raw, point.bit, point.bit_len)));
    }
    Ok(scalar.to_json())
}

fn slice_for<'a>(
    group_address: u16,
    regs: &'a [u16],
    point: &ModbusPoint,
) -> Result<&'a [u16], ProtocolError> {
    let start = usize::from(point.address.saturating_sub(group_address));
    let end = start + usize::from(point.quantity);
    regs.get(start..end).ok_or(ProtocolError::LengthMismatch {
        expected: end,
        actual: regs.len(),
    })
}

/// 把一组寄存器拆分为 `(设备, 点位, 值)`；虚拟点位展开为子点位。
pub fn decode_group(
    group: &PointGroup,
    regs: &[u16],
) -> Vec<(String, String, Result<Value, ProtocolError>)> {
    let mut out = Vec::new();
    for point in &group.points {
        if point.is_virtual() {
            for child in &point.children {
                let value = slice_for(group.address, regs, child).and_then(|s| decode_point(child, s));
                out.push((child.device_sn.clone(), child.name.clone(), value));
            }
        } else {
            let value = slice_for(group.address, regs, point).and_then(|s| decode_point(point, s));
            out.push((point.device_sn.clone(), point.name.clone(), value));
        }
    }
    out
}

/// 链路执行命令时需要的插件级依赖。
pub struct LinkEnv {
    pub key: String,
    pub adapter: Arc<ModbusAdapter>,
    pub script: Option<Arc<ScriptSandbox>>,
    pub on_receive: Arc<dyn ReceiveHandler>,
    pub shadow: DeviceShadow,
}

impl LinkEnv {
    fn script(&self) -> Result<&ScriptSandbox, ProtocolError> {
        self.script.as_deref().ok_or_else(|| {
            ProtocolError::Config(format!("{}: virtual connection needs a script", self.key))
        })
    }

    /// 执行一条命令。
    pub async fn execute(
        &self,
        link: &mut ModbusLink,
        command: ModbusCommand,
    ) -> Result<(), ProtocolError> {
        match command {
            ModbusCommand::Read(groups) => {
                for group in &groups {
                    self.read_group(link, group).await?;
                }
                Ok(())
            }
            ModbusCommand::Write(requests) => {
                for request in &requests {
                    self.write(link, request).await?;
                }
                Ok(())
            }
        }
    }

    /// 读取一组点位并交给接收流水线。
    pub async fn read_group(
        &self,
        link: &mut ModbusLink,
        group: &PointGroup,
    ) -> Result<(), ProtocolError> {
        let values = if link.is_virtual() {
            let script = self.script()?;
            let mut values = Vec::new();
            for point in &group.points {
                let targets: Vec<&ModbusPoint> = if point.is_virtual() {
                    point.children.iter().collect()
                } else {
                    vec![point.as_ref()]
                };
                for target in targets {
                    let value = script
                        .mock_read(&target.device_sn, &target.name)
                        .map_err(ProtocolError::from);
                    values.push((target.device_sn.clone(), target.name.clone(), value));
                }
            }
            values
        } else {
            let regs = link
                .read_raw(group.unit_id, group.table, group.address, group.quantity)
                .await?;
            decode_group(group, &regs)
        };

        let mut batch: Vec<DeviceData> = Vec::new();
        for (device_sn, point_name, value) in values {
            let value = match value {
                Ok(v) => v,
                Err(e) => {
                    warn!(target: "gw.modbus", key = %self.key, device_sn, point_name, error = %e, "point skipped");
                    continue;
                }
            };
            let raw = json!({ "deviceSn": device_sn, "pointName": point_name, "value": value });
            match self.adapter.decode(&raw.to_string()) {
                Ok(data) => batch.extend(data),
                Err(e) => {
                    warn!(target: "gw.modbus", key = %self.key, device_sn, point_name, error = %e, "decode failed");
                }
            }
        }
        if !batch.is_empty() {
            self.on_receive.handle(batch).await;
        }
        Ok(())
    }

    /// 写入；带掩码时先读后写。失败按 `retry` 重试。
    pub async fn write(
        &self,
        link: &mut ModbusLink,
        request: &WriteRequest,
    ) -> Result<(), ProtocolError> {
        if link.is_virtual() {
            let script = self.script()?;
            for (point_name, value) in &request.points {
                script.mock_write(&request.device_sn, point_name, value)?;
            }
            return Ok(());
        }
        if !request.table.is_writable() {
            return Err(ProtocolError::UnsupportedOperation(format!(
                "{:?} is read-only",
                request.table
            )));
        }

        let attempts = link.config().retry.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.write_once(link, request).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        target: "gw.modbus",
                        key = %self.key,
                        device_sn = %request.device_sn,
                        address = request.address,
                        attempt,
                        error = %e,
                        "write failed"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ProtocolError::Modbus("write failed".to_string())))
    }

    async fn write_once(
        &self,
        link: &mut ModbusLink,
        request: &WriteRequest,
    ) -> Result<(), ProtocolError> {
        let values = if request.needs_read_modify_write() {
            let mask = request.mask.unwrap_or(0xFFFF);
            let current = link
                .read_raw(
                    request.unit_id,
                    request.table,
                    request.address,
                    request.values.len() as u16,
                )
                .await?;
            current
                .iter()
                .zip(&request.values)
                .map(|(cur, new)| apply_mask(*cur, *new, mask))
                .collect()
        } else {
            request.values.clone()
        };
        link.write_raw(request.unit_id, request.table, request.address, &values)
            .await
    }

    /// 采集失败：组内涉及的设备各上报一次。
    pub fn report_failure(&self, group: &PointGroup) {
        let mut seen = HashSet::new();
        for sn in group.device_sns() {
            if seen.insert(sn.clone())
                && let Err(e) = self.shadow.may_be_offline(&sn)
            {
                debug!(target: "gw.modbus", device_sn = %sn, error = %e, "may_be_offline skipped");
            }
        }
    }
}

/// 链路租约。
pub struct ModbusConnector {
    link: OwnedMutexGuard<ModbusLink>,
    env: Arc<LinkEnv>,
}

impl ModbusConnector {
    pub fn new(link: OwnedMutexGuard<ModbusLink>, env: Arc<LinkEnv>) -> Self {
        Self { link, env }
    }
}

#[async_trait]
impl Connector for ModbusConnector {
    async fn send(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        match frame {
            Frame::Modbus(command) => self.env.execute(&mut self.link, command).await,
            other => Err(ProtocolError::UnsupportedOperation(format!(
                "modbus connector cannot send {other:?}"
            ))),
        }
    }
}

/// 采集计划中的一组及其上次执行时间。
pub(crate) struct GroupSlot {
    pub group: PointGroup,
    pub last_run: Option<Instant>,
}

impl GroupSlot {
    pub fn due(&self, now: Instant) -> bool {
        self.last_run
            .map(|last| now.duration_since(last) >= self.group.duration)
            .unwrap_or(true)
    }
}

/// 采集节拍。
pub(crate) const COLLECT_TICK: Duration = Duration::from_secs(1);
