use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bacnet::adapter::BacnetAdapter;
use crate::bacnet::client::{BacnetClient, broadcast_address, DEFAULT_PORT};
use crate::bacnet::connector::{BacnetConnector, BacnetEnv, BacnetLink, BatchSlot, ObjectIo};
use crate::error::ProtocolError;
use crate::plugin::{Connector, Plugin, PluginContext, ProtocolAdapter};
use crate::types::TaskSet;

/// BACnet/IP 插件：每个 connectionKey 一个 UDP 端点，一个采集任务。
pub struct BacnetPlugin {
    env: Arc<BacnetEnv>,
    links: HashMap<String, Arc<Mutex<BacnetLink>>>,
    tasks: TaskSet,
}

impl BacnetPlugin {
    pub async fn initialize(ctx: &PluginContext) -> Result<Self, ProtocolError> {
        let adapter = Arc::new(BacnetAdapter::new(&ctx.config, ctx.script.clone())?);
        let env = Arc::new(BacnetEnv {
            key: ctx.key().to_string(),
            adapter: adapter.clone(),
            script: ctx.script.clone(),
            on_receive: ctx.on_receive.clone(),
            shadow: ctx.shadow.clone(),
            watchers: TaskSet::new(),
        });

        let mut links = HashMap::new();
        for (key, config) in adapter.connections() {
            let link = if config.virtual_mode || ctx.virtual_mode {
                if ctx.script.is_none() {
                    return Err(ProtocolError::Config(format!(
                        "{}: virtual connection {key} needs a script",
                        ctx.key()
                    )));
                }
                BacnetLink::new(key.clone(), None)
            } else {
                let broadcast =
                    broadcast_address(config.local_ip, config.local_subnet, DEFAULT_PORT);
                let client =
                    BacnetClient::bind(config.local_addr(), broadcast, config.timeout).await?;
                info!(
                    target: "gw.bacnet",
                    key = %ctx.key(),
                    connection = %key,
                    local = %config.local_addr(),
                    interface = %config.interface,
                    "bacnet endpoint bound"
                );
                BacnetLink::new(key.clone(), Some(Arc::new(client) as Arc<dyn ObjectIo>))
            };
            links.insert(key.clone(), link);
        }

        Self::with_links(env, links).await
    }

    /// 由已建立的链路组装插件并启动采集（测试可注入内存 IO）。
    pub async fn with_links(
        env: Arc<BacnetEnv>,
        links: HashMap<String, BacnetLink>,
    ) -> Result<Self, ProtocolError> {
        let links: HashMap<String, Arc<Mutex<BacnetLink>>> = links
            .into_iter()
            .map(|(key, link)| (key, Arc::new(Mutex::new(link))))
            .collect();
        let plugin = Self {
            env,
            links,
            tasks: TaskSet::new(),
        };
        plugin.announce().await;
        plugin.start_collect_tasks();
        Ok(plugin)
    }

    /// 为未配置 ip 的设备广播 Who-Is。
    async fn announce(&self) {
        for (key, link) in &self.links {
            let batches = self.env.adapter.collect_batches(key);
            let guard = link.lock().await;
            let Some(io) = guard.io() else {
                continue;
            };
            let mut asked = Vec::new();
            for batch in batches.iter().filter(|b| b.target.is_none()) {
                if asked.contains(&batch.device_id) {
                    continue;
                }
                asked.push(batch.device_id);
                if let Err(e) = io.discover(batch.device_id).await {
                    warn!(target: "gw.bacnet", connection = %key, device_id = batch.device_id, error = %e, "who-is failed");
                }
            }
        }
    }

    fn start_collect_tasks(&self) {
        for (key, config) in self.env.adapter.connections() {
            let Some(link) = self.links.get(key) else {
                continue;
            };
            let batches = self.env.adapter.collect_batches(key);
            if batches.is_empty() {
                continue;
            }
            let tick = config.tick_for(&batches);
            let slots: Vec<BatchSlot> = batches
                .into_iter()
                .map(|batch| BatchSlot {
                    batch,
                    last_run: None,
                })
                .collect();
            info!(target: "gw.bacnet", key = %self.env.key, connection = %key, batches = slots.len(), ?tick, "bacnet collect task started");
            let handle = tokio::spawn(collect_loop(self.env.clone(), link.clone(), slots, tick));
            self.tasks.push(handle);
        }
    }
}

async fn collect_loop(
    env: Arc<BacnetEnv>,
    link: Arc<Mutex<BacnetLink>>,
    mut slots: Vec<BatchSlot>,
    tick: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        for slot in slots.iter_mut() {
            if !slot.due(Instant::now()) {
                continue;
            }
            let result = {
                let guard = link.lock().await;
                env.read_batch(&guard, &slot.batch).await
            };
            slot.last_run = Some(Instant::now());
            if let Err(e) = result {
                warn!(
                    target: "gw.bacnet",
                    key = %env.key,
                    device_id = slot.batch.device_id,
                    objects = slot.batch.objects.len(),
                    error = %e,
                    "collect failed"
                );
                if e.is_transport() {
                    env.report_failure(&slot.batch);
                }
            }
        }
    }
}

#[async_trait]
impl Plugin for BacnetPlugin {
    fn protocol_name(&self) -> &'static str {
        "bacnet"
    }

    fn protocol_adapter(&self) -> Arc<dyn ProtocolAdapter> {
        self.env.adapter.clone()
    }

    async fn connector(&self, device_sn: &str) -> Result<Box<dyn Connector>, ProtocolError> {
        let key = self
            .env
            .adapter
            .connection_key(device_sn)
            .ok_or_else(|| ProtocolError::NotFound(format!("device {device_sn}")))?;
        let link = self
            .links
            .get(key)
            .ok_or_else(|| ProtocolError::NotFound(format!("connection {key}")))?;
        let guard = link.clone().lock_owned().await;
        Ok(Box::new(BacnetConnector::new(guard, self.env.clone())))
    }

    async fn destroy(&self) -> Result<(), ProtocolError> {
        self.tasks.abort_all();
        self.env.watchers.abort_all();
        for link in self.links.values() {
            let guard = link.lock().await;
            guard.close();
            debug!(target: "gw.bacnet", connection = %guard.key(), "bacnet endpoint closed");
        }
        info!(target: "gw.bacnet", key = %self.env.key, "bacnet plugin destroyed");
        Ok(())
    }
}
