use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::error::ProtocolError;
use crate::modbus::adapter::ModbusAdapter;
use crate::modbus::connector::{COLLECT_TICK, GroupSlot, LinkEnv, ModbusConnector, ModbusLink};
use crate::plugin::{Connector, Plugin, PluginContext, ProtocolAdapter};
use crate::types::TaskSet;

/// Modbus 插件：每个 connectionKey 一条链路，一个采集任务。
pub struct ModbusPlugin {
    env: Arc<LinkEnv>,
    links: HashMap<String, Arc<Mutex<ModbusLink>>>,
    tasks: TaskSet,
}

impl ModbusPlugin {
    pub fn initialize(ctx: &PluginContext) -> Result<Self, ProtocolError> {
        let adapter = Arc::new(ModbusAdapter::new(&ctx.config, ctx.script.clone())?);
        let env = Arc::new(LinkEnv {
            key: ctx.key().to_string(),
            adapter: adapter.clone(),
            script: ctx.script.clone(),
            on_receive: ctx.on_receive.clone(),
            shadow: ctx.shadow.clone(),
        });

        let mut links = HashMap::new();
        for (key, config) in adapter.connections() {
            let link = ModbusLink::new(key.clone(), config.clone(), ctx.virtual_mode);
            if link.is_virtual() && ctx.script.is_none() {
                return Err(ProtocolError::Config(format!(
                    "{}: virtual connection {key} needs a script",
                    ctx.key()
                )));
            }
            links.insert(key.clone(), Arc::new(Mutex::new(link)));
        }

        let plugin = Self {
            env,
            links,
            tasks: TaskSet::new(),
        };
        plugin.start_collect_tasks();
        Ok(plugin)
    }

    fn start_collect_tasks(&self) {
        for (key, config) in self.env.adapter.connections() {
            let Some(link) = self.links.get(key) else {
                continue;
            };
            if !config.enable {
                info!(target: "gw.modbus", key = %self.env.key, connection = %key, "connection disabled, collect task skipped");
                continue;
            }
            let slots: Vec<GroupSlot> = self
                .env
                .adapter
                .collect_groups(key)
                .into_iter()
                .map(|group| GroupSlot {
                    group,
                    last_run: None,
                })
                .collect();
            if slots.is_empty() {
                continue;
            }
            info!(target: "gw.modbus", key = %self.env.key, connection = %key, groups = slots.len(), "modbus collect task started");
            let handle = tokio::spawn(collect_loop(self.env.clone(), link.clone(), slots));
            self.tasks.push(handle);
        }
    }
}

async fn collect_loop(env: Arc<LinkEnv>, link: Arc<Mutex<ModbusLink>>, mut slots: Vec<GroupSlot>) {
    let mut ticker = tokio::time::interval(COLLECT_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        for slot in slots.iter_mut() {
            if !slot.due(Instant::now()) {
                continue;
            }
            let result = {
                let mut guard = link.lock().await;
                env.read_group(&mut guard, &slot.group).await
            };
            slot.last_run = Some(Instant::now());
            if let Err(e) = result {
                warn!(
                    target: "gw.modbus",
                    key = %env.key,
                    unit_id = slot.group.unit_id,
                    address = slot.group.address,
                    error = %e,
                    "collect failed"
                );
                env.report_failure(&slot.group);
            }
        }
    }
}

#[async_trait]
impl Plugin for ModbusPlugin {
    fn protocol_name(&self) -> &'static str {
        "modbus"
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
        Ok(Box::new(ModbusConnector::new(guard, self.env.clone())))
    }

    async fn destroy(&self) -> Result<(), ProtocolError> {
        self.tasks.abort_all();
        info!(target: "gw.modbus", key = %self.env.key, "modbus plugin destroyed");
        Ok(())
    }
}
