//! BACnet/IP UDP 客户端：按 invoke id 分发应答，缓存 I-Am。

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::bacnet::apdu::{self, Apdu, IAm, PropertyResult, Service};
use crate::bacnet::encoding::{BacnetValue, ObjectId};
use crate::bacnet::npdu::{self, NetworkAddress};
use crate::error::ProtocolError;

pub const DEFAULT_PORT: u16 = 47808;
const RECV_BUFFER: usize = 2048;

/// 远端设备寻址。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacnetTarget {
    pub addr: SocketAddr,
    /// MS/TP 设备经路由器访问时的目标网络
    pub network: Option<NetworkAddress>,
}

/// I-Am 发现记录。
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub addr: SocketAddr,
    pub source: Option<NetworkAddress>,
    pub iam: IAm,
    pub seen_at: Instant,
}

type Pending = Arc<Mutex<HashMap<u8, oneshot::Sender<Apdu>>>>;
type Discovered = Arc<Mutex<HashMap<u32, DiscoveredDevice>>>;

pub struct BacnetClient {
    socket: Arc<UdpSocket>,
    pending: Pending,
    discovered: Discovered,
    next_invoke: Mutex<u8>,
    broadcast: SocketAddr,
    timeout: Duration,
    recv_task: JoinHandle<()>,
}

/// 由本地地址与前缀长度计算定向广播地址；未指定时使用受限广播。
pub fn broadcast_address(local_ip: IpAddr, prefix_len: u8, port: u16) -> SocketAddr {
    let ip = match local_ip {
        IpAddr::V4(v4) if !v4.is_unspecified() && (1..32).contains(&prefix_len) => {
            let mask = u32::MAX << (32 - u32::from(prefix_len));
            Ipv4Addr::from(u32::from(v4) | !mask)
        }
        _ => Ipv4Addr::BROADCAST,
    };
    SocketAddr::new(IpAddr::V4(ip), port)
}

impl BacnetClient {
    pub async fn bind(
        local: SocketAddr,
        broadcast: SocketAddr,
        timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| ProtocolError::Connection(format!("bind {local}: {e}")))?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let discovered: Discovered = Arc::new(Mutex::new(HashMap::new()));
        let recv_task = tokio::spawn(recv_loop(
            socket.clone(),
            pending.clone(),
            discovered.clone(),
        ));
        debug!(target: "gw.bacnet", %local, %broadcast, "bacnet client bound");
        Ok(Self {
            socket,
            pending,
            discovered,
            next_invoke: Mutex::new(0),
            broadcast,
            timeout,
            recv_task,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        Ok(self.socket.local_addr()?)
    }

    /// 广播 Who-Is。
    pub async fn who_is(&self, range: Option<(u32, u32)>) -> Result<(), ProtocolError> {
        let frame = npdu::encode_frame(true, None, false, &apdu::who_is(range));
        self.socket.send_to(&frame, self.broadcast).await?;
        Ok(())
    }

    /// 已通过 I-Am 发现的设备。
    pub fn discovered(&self, device_id: u32) -> Option<DiscoveredDevice> {
        self.discovered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&device_id)
            .cloned()
    }

    fn allocate_invoke(&self, tx: oneshot::Sender<Apdu>) -> Result<u8, ProtocolError> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = self.next_invoke.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..=u8::MAX {
            let id = *next;
            *next = next.wrapping_add(1);
            if let std::collections::hash_map::Entry::Vacant(slot) = pending.entry(id) {
                slot.insert(tx);
                return Ok(id);
            }
        }
        Err(ProtocolError::Bacnet("no free invoke id".to_string()))
    }

    fn forget(&self, invoke_id: u8) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&invoke_id);
    }

    async fn confirmed(
        &self,
        target: &BacnetTarget,
        service: Service,
        body: &[u8],
    ) -> Result<Apdu, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        let invoke_id = self.allocate_invoke(tx)?;
        let apdu = apdu::confirmed_request(invoke_id, service, body);
        let frame = npdu::encode_frame(false, target.network.as_ref(), true, &apdu);
        if let Err(e) = self.socket.send_to(&frame, target.addr).await {
            self.forget(invoke_id);
            return Err(e.into());
        }

        let reply = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(ProtocolError::ChannelClosed),
            Err(_) => {
                self.forget(invoke_id);
                return Err(ProtocolError::Timeout(format!(
                    "{service:?} to {} after {:?}",
                    target.addr, self.timeout
                )));
            }
        };
        match reply {
            Apdu::Error { class, code, .. } => Err(ProtocolError::Bacnet(format!(
                "{service:?} error class {class} code {code}"
            ))),
            Apdu::Reject { reason, .. } => Err(ProtocolError::Bacnet(format!(
                "{service:?} rejected, reason {reason}"
            ))),
            Apdu::Abort { reason, .. } => Err(ProtocolError::Bacnet(format!(
                "{service:?} aborted, reason {reason}"
            ))),
            other => Ok(other),
        }
    }

    pub async fn read_property(
        &self,
        target: &BacnetTarget,
        object: ObjectId,
        property: u32,
    ) -> Result<Vec<BacnetValue>, ProtocolError> {
        let body = apdu::read_property(object, property);
        match self.confirmed(target, Service::ReadProperty, &body).await? {
            Apdu::ComplexAck { payload, .. } => apdu::parse_read_property_ack(&payload),
            other => Err(ProtocolError::Bacnet(format!("unexpected reply {other:?}"))),
        }
    }

    pub async fn read_property_multiple(
        &self,
        target: &BacnetTarget,
        objects: &[ObjectId],
        properties: &[u32],
    ) -> Result<Vec<PropertyResult>, ProtocolError> {
        let body = apdu::read_property_multiple(objects, properties);
        match self
            .confirmed(target, Service::ReadPropertyMultiple, &body)
            .await?
        {
            Apdu::ComplexAck { payload, .. } => apdu::parse_read_property_multiple_ack(&payload),
            other => Err(ProtocolError::Bacnet(format!("unexpected reply {other:?}"))),
        }
    }

    pub async fn write_property(
        &self,
        target: &BacnetTarget,
        object: ObjectId,
        property: u32,
        value: &BacnetValue,
        priority: Option<u8>,
    ) -> Result<(), ProtocolError> {
        let body = apdu::write_property(object, property, value, priority);
        match self.confirmed(target, Service::WriteProperty, &body).await? {
            Apdu::SimpleAck { .. } => Ok(()),
            other => Err(ProtocolError::Bacnet(format!("unexpected reply {other:?}"))),
        }
    }

    /// 停止接收任务；未完成的请求以 `ChannelClosed` 结束。
    pub fn close(&self) {
        self.recv_task.abort();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Drop for BacnetClient {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, pending: Pending, discovered: Discovered) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(target: "gw.bacnet", error = %e, "udp receive failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let decoded = match npdu::decode_frame(&buf[..n]) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => continue,
            Err(e) => {
                trace!(target: "gw.bacnet", %peer, error = %e, "frame dropped");
                continue;
            }
        };
        let apdu = match apdu::parse(decoded.apdu) {
            Ok(apdu) => apdu,
            Err(e) => {
                debug!(target: "gw.bacnet", %peer, error = %e, "apdu dropped");
                continue;
            }
        };
        match apdu {
            Apdu::IAm(iam) => {
                trace!(target: "gw.bacnet", %peer, device = iam.device.instance, "i-am");
                discovered
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(
                        iam.device.instance,
                        DiscoveredDevice {
                            addr: peer,
                            source: decoded.source,
                            iam,
                            seen_at: Instant::now(),
                        },
                    );
            }
            Apdu::Ignored => {}
            reply => {
                let Some(invoke_id) = reply.invoke_id() else {
                    continue;
                };
                let waiter = pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&invoke_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => {
                        trace!(target: "gw.bacnet", %peer, invoke_id, "late reply dropped");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_address() {
        let ip: IpAddr = "192.168.1.20".parse().expect("ip");
        assert_eq!(
            broadcast_address(ip, 24, DEFAULT_PORT),
            "192.168.1.255:47808".parse().expect("addr")
        );
        assert_eq!(
            broadcast_address(ip, 0, DEFAULT_PORT),
            "255.255.255.255:47808".parse().expect("addr")
        );
        let any: IpAddr = "0.0.0.0".parse().expect("ip");
        assert_eq!(
            broadcast_address(any, 24, 47809),
            "255.255.255.255:47809".parse().expect("addr")
        );
    }
}
