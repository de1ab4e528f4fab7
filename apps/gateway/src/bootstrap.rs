//! 配置周期（Epoch）的构建、替换与销毁。
//!
//! 一个 Epoch 由同一份驱动配置目录派生：注册表、设备影子、脚本沙箱、插件、
//! 接收流水线、定时任务与影子巡检。重载分两段：
//!
//! 1. [`Staged`]：校验配置、构建注册表、加载脚本，不触碰运行中的 Epoch；
//! 2. [`Staged::launch`]：旧 Epoch 销毁后启动插件与定时任务。
//!
//! 第 1 段失败时旧 Epoch 原样保留；第 2 段失败时按旧配置重新启动。

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use domain::DeviceConfig;
use gw_config::{
    AppConfig, ConfigError, ConnectorDir, load_device_configs, restore_device_config,
    validate_device_configs, write_device_config,
};
use gw_control::{CommandDispatcher, CommandTarget, ControlError, DeviceCommand, DeviceSender, Scheduler};
use gw_pipeline::{NotificationSink, Publisher, ReceivePipeline, spawn_notifier};
use gw_protocol::{Plugin, PluginContext, ProtocolError, Registry, TaskSet, initialize_plugin, parse_duration};
use gw_script::{PluginCache, ScriptError, ScriptSandbox};
use gw_storage::{DeviceShadow, StorageError};
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info, warn};

/// 启动或重载失败。
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("script {key}: {source}")]
    Script {
        key: String,
        #[source]
        source: ScriptError,
    },
    #[error("plugin {key}: {source}")]
    Plugin {
        key: String,
        #[source]
        source: ProtocolError,
    },
    #[error("device {device_sn}: {source}")]
    Ttl {
        device_sn: String,
        #[source]
        source: ProtocolError,
    },
    #[error(transparent)]
    Control(#[from] ControlError),
}

/// 网关运行参数（取自 [`AppConfig`]）。
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub config_dir: PathBuf,
    pub shadow_ttl: Duration,
    pub sweep_every: Duration,
    pub virtual_mode: bool,
}

impl GatewaySettings {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            config_dir: config.config_dir.clone(),
            shadow_ttl: Duration::from_secs(config.shadow_ttl_seconds),
            sweep_every: Duration::from_millis(config.shadow_sweep_ms),
            virtual_mode: config.virtual_mode,
        }
    }
}

/// 一个配置周期内的全部运行时对象。
pub struct Epoch {
    dirs: BTreeMap<String, ConnectorDir>,
    registry: Arc<Registry>,
    shadow: DeviceShadow,
    pipeline: Arc<ReceivePipeline>,
    dispatcher: CommandDispatcher,
    scheduler: Scheduler,
    /// 影子巡检、脚本 publish 转发、上下线通知
    background: TaskSet,
}

impl Epoch {
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn shadow(&self) -> &DeviceShadow {
        &self.shadow
    }

    pub fn pipeline(&self) -> &Arc<ReceivePipeline> {
        &self.pipeline
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn scheduled_tasks(&self) -> usize {
        self.scheduler.len()
    }

    /// 停止定时任务、销毁插件并中止后台任务。
    async fn destroy(&self) {
        self.scheduler.shutdown();
        destroy_plugins(&self.registry).await;
        self.background.abort_all();
    }
}

async fn destroy_plugins(registry: &Registry) {
    for (key, plugin) in registry.take_running_plugins() {
        if let Err(e) = plugin.destroy().await {
            warn!(target: "gw.bootstrap", key = %key, error = %e, "plugin destroy failed");
        }
    }
}

/// 当前 Epoch 的共享槽位；上游命令（REST、MQTT）总是落在最新的 Epoch 上。
#[derive(Default)]
pub struct EpochCell {
    current: RwLock<Option<Arc<Epoch>>>,
}

impl EpochCell {
    pub fn get(&self) -> Option<Arc<Epoch>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn replace(&self, epoch: Option<Arc<Epoch>>) -> Option<Arc<Epoch>> {
        let mut slot = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, epoch)
    }
}

#[async_trait]
impl CommandTarget for EpochCell {
    async fn execute(&self, device_sn: &str, command: DeviceCommand) -> Result<(), ControlError> {
        let epoch = self
            .get()
            .ok_or_else(|| ControlError::NotFound("no running configuration".to_string()))?;
        epoch.dispatcher().execute(device_sn, command).await
    }
}

/// 已校验、尚未启动插件的新配置周期。
struct Staged {
    dirs: BTreeMap<String, ConnectorDir>,
    registry: Arc<Registry>,
    shadow: DeviceShadow,
    scripts: HashMap<String, Arc<ScriptSandbox>>,
    script_rx: mpsc::UnboundedReceiver<domain::DeviceData>,
    virtual_mode: bool,
    sweep_every: Duration,
}

impl Staged {
    fn prepare(
        dirs: BTreeMap<String, ConnectorDir>,
        settings: &GatewaySettings,
        cache: &PluginCache,
    ) -> Result<Self, BootstrapError> {
        let configs: BTreeMap<String, DeviceConfig> = dirs
            .iter()
            .map(|(key, dir)| (key.clone(), dir.config.clone()))
            .collect();
        validate_device_configs(&configs)?;
        let registry = Arc::new(Registry::build(&configs)?);

        let shadow = DeviceShadow::new(settings.shadow_ttl);
        for config in configs.values() {
            for (_, device) in config.devices() {
                let ttl = match device.properties.get("ttl") {
                    Some(raw) => Some(parse_duration(raw, settings.shadow_ttl).map_err(|source| {
                        BootstrapError::Ttl {
                            device_sn: device.device_sn.clone(),
                            source,
                        }
                    })?),
                    None => None,
                };
                shadow.add_device_with_ttl(&device.device_sn, &device.model_name, ttl);
            }
        }

        let (tx, script_rx) = mpsc::unbounded_channel();
        let mut scripts = HashMap::new();
        for (key, dir) in &dirs {
            let Some(path) = &dir.script else { continue };
            let sandbox = ScriptSandbox::load(key, path, cache.clone(), tx.clone()).map_err(|source| {
                BootstrapError::Script {
                    key: key.clone(),
                    source,
                }
            })?;
            scripts.insert(key.clone(), Arc::new(sandbox));
        }

        Ok(Self {
            dirs,
            registry,
            shadow,
            scripts,
            script_rx,
            virtual_mode: settings.virtual_mode,
            sweep_every: settings.sweep_every,
        })
    }

    /// 启动插件、流水线与定时任务。任一插件失败时销毁已启动的插件。
    async fn launch(
        self,
        publisher: Arc<dyn Publisher>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Epoch, BootstrapError> {
        let background = TaskSet::new();
        let (callback, notifier) = spawn_notifier(sink);
        background.push(notifier);
        self.shadow.set_online_change_callback(callback);

        let pipeline = Arc::new(ReceivePipeline::new(
            self.registry.clone(),
            self.shadow.clone(),
            publisher,
        ));
        background.push(pipeline.spawn_script_drain(self.script_rx));

        let configs: Vec<Arc<DeviceConfig>> = self.registry.configs().map(|(_, c)| c.clone()).collect();
        for config in configs {
            let key = config.key.clone();
            let ctx = PluginContext {
                config,
                registry: self.registry.clone(),
                shadow: self.shadow.clone(),
                script: self.scripts.get(&key).cloned(),
                on_receive: pipeline.clone(),
                virtual_mode: self.virtual_mode,
            };
            match initialize_plugin(&ctx).await {
                Ok(plugin) => self.registry.add_running_plugin(key, plugin),
                Err(source) => {
                    destroy_plugins(&self.registry).await;
                    background.abort_all();
                    return Err(BootstrapError::Plugin { key, source });
                }
            }
        }

        let sender = DeviceSender::new(self.registry.clone(), self.shadow.clone());
        let scheduler = match Scheduler::start(&sender, &self.scripts, &pipeline) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                destroy_plugins(&self.registry).await;
                background.abort_all();
                return Err(e.into());
            }
        };
        background.push(self.shadow.spawn_sweeper(self.sweep_every));

        info!(
            target: "gw.bootstrap",
            connectors = self.dirs.len(),
            devices = self.registry.devices().len(),
            scripts = self.scripts.len(),
            tasks = scheduler.len(),
            "configuration started"
        );
        Ok(Epoch {
            dirs: self.dirs,
            registry: self.registry,
            shadow: self.shadow,
            pipeline,
            dispatcher: CommandDispatcher::new(sender),
            scheduler,
            background,
        })
    }
}

/// 网关：持有当前 Epoch 并串行化重载。
pub struct Gateway {
    settings: GatewaySettings,
    publisher: Arc<dyn Publisher>,
    sink: Arc<dyn NotificationSink>,
    cache: PluginCache,
    cell: Arc<EpochCell>,
    reload_lock: Mutex<()>,
}

impl Gateway {
    /// 加载配置目录并启动首个 Epoch。
    ///
    /// `cell` 由调用方预先创建，以便上行桥接在网关启动前就能引用命令入口。
    pub async fn start(
        settings: GatewaySettings,
        publisher: Arc<dyn Publisher>,
        sink: Arc<dyn NotificationSink>,
        cache: PluginCache,
        cell: Arc<EpochCell>,
    ) -> Result<Self, BootstrapError> {
        let dirs = load_device_configs(&settings.config_dir)?;
        let epoch = Staged::prepare(dirs, &settings, &cache)?
            .launch(publisher.clone(), sink.clone())
            .await?;
        cell.replace(Some(Arc::new(epoch)));
        Ok(Self {
            settings,
            publisher,
            sink,
            cache,
            cell,
            reload_lock: Mutex::new(()),
        })
    }

    pub fn current(&self) -> Option<Arc<Epoch>> {
        self.cell.get()
    }

    pub fn commands(&self) -> Arc<EpochCell> {
        self.cell.clone()
    }

    /// 跨 Epoch 共享的脚本缓存。
    pub fn cache(&self) -> &PluginCache {
        &self.cache
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// 重新读取配置目录并替换当前 Epoch。
    pub async fn reload(&self) -> Result<Arc<Epoch>, BootstrapError> {
        let _guard = self.reload_lock.lock().await;
        self.reload_locked().await
    }

    /// 写入单个驱动目录的配置并重载；重载失败时恢复配置文件。
    pub async fn update_config(&self, config: &DeviceConfig) -> Result<Arc<Epoch>, BootstrapError> {
        let _guard = self.reload_lock.lock().await;
        let previous = write_device_config(&self.settings.config_dir, config)?;
        match self.reload_locked().await {
            Ok(epoch) => Ok(epoch),
            Err(e) => {
                if let Err(restore) = restore_device_config(&self.settings.config_dir, &config.key, previous) {
                    error!(target: "gw.bootstrap", key = %config.key, error = %restore, "config restore failed");
                }
                Err(e)
            }
        }
    }

    async fn reload_locked(&self) -> Result<Arc<Epoch>, BootstrapError> {
        let dirs = load_device_configs(&self.settings.config_dir)?;
        let staged = Staged::prepare(dirs, &self.settings, &self.cache)?;

        // 监听端口与物理链路独占，新插件启动前必须先释放旧的
        let previous = self.cell.replace(None);
        if let Some(old) = &previous {
            old.destroy().await;
        }

        match staged.launch(self.publisher.clone(), self.sink.clone()).await {
            Ok(epoch) => {
                let epoch = Arc::new(epoch);
                self.cell.replace(Some(epoch.clone()));
                info!(target: "gw.bootstrap", "configuration reloaded");
                Ok(epoch)
            }
            Err(e) => {
                warn!(target: "gw.bootstrap", error = %e, "reload failed, restarting previous configuration");
                if let Some(old) = previous {
                    self.restart(old.dirs.clone()).await;
                }
                Err(e)
            }
        }
    }

    async fn restart(&self, dirs: BTreeMap<String, ConnectorDir>) {
        let relaunched = match Staged::prepare(dirs, &self.settings, &self.cache) {
            Ok(staged) => staged.launch(self.publisher.clone(), self.sink.clone()).await,
            Err(e) => Err(e),
        };
        match relaunched {
            Ok(epoch) => {
                self.cell.replace(Some(Arc::new(epoch)));
            }
            Err(e) => {
                error!(target: "gw.bootstrap", error = %e, "previous configuration could not be restarted");
            }
        }
    }

    /// 进程退出前销毁当前 Epoch。
    pub async fn shutdown(&self) {
        let _guard = self.reload_lock.lock().await;
        if let Some(epoch) = self.cell.replace(None) {
            epoch.destroy().await;
        }
        info!(target: "gw.bootstrap", "gateway stopped");
    }
}
