//! CoreCache：单个配置周期内的物模型/设备/点位注册表。
//!
//! 结构在 [`CoreCache::build`] 时一次性确定，之后只读；运行中的插件在构建完成后
//! 通过 [`CoreCache::add_running_plugin`] 登记，周期结束时由 [`CoreCache::take_running_plugins`] 取回。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use domain::{Device, DeviceConfig, Point};

use crate::error::StorageError;

/// 注册表中的物模型（附带所属驱动目录与协议）。
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub name: String,
    pub model_id: String,
    pub description: String,
    pub protocol_name: String,
    /// 所属驱动目录 key。
    pub connector_key: String,
    pub points: Vec<Point>,
}

impl Model {
    pub fn point(&self, name: &str) -> Option<&Point> {
        self.points.iter().find(|p| p.name == name)
    }
}

/// `P` 为运行中的插件类型（通常是 `dyn Plugin`）。
pub struct CoreCache<P: ?Sized> {
    configs: BTreeMap<String, Arc<DeviceConfig>>,
    models: HashMap<String, Arc<Model>>,
    devices: HashMap<String, Arc<Device>>,
    /// modelName → pointName → 在 `Model::points` 中的下标
    point_index: HashMap<String, HashMap<String, usize>>,
    running_plugins: RwLock<HashMap<String, Arc<P>>>,
}

impl<P: ?Sized> CoreCache<P> {
    /// 由全部驱动目录配置构建注册表。
    pub fn build(configs: &BTreeMap<String, DeviceConfig>) -> Result<Self, StorageError> {
        let mut models = HashMap::new();
        let mut devices = HashMap::new();
        let mut point_index = HashMap::new();

        for (key, config) in configs {
            for dm in &config.device_models {
                if models.contains_key(&dm.name) {
                    return Err(StorageError::Duplicate(format!("model {}", dm.name)));
                }
                let mut index = HashMap::new();
                for (i, point) in dm.device_points.iter().enumerate() {
                    if index.insert(point.name.clone(), i).is_some() {
                        return Err(StorageError::Duplicate(format!(
                            "point {} on model {}",
                            point.name, dm.name
                        )));
                    }
                }
                point_index.insert(dm.name.clone(), index);
                models.insert(
                    dm.name.clone(),
                    Arc::new(Model {
                        name: dm.name.clone(),
                        model_id: dm.model_id.clone(),
                        description: dm.description.clone(),
                        protocol_name: config.protocol_name.clone(),
                        connector_key: key.clone(),
                        points: dm.device_points.clone(),
                    }),
                );
            }
        }

        for config in configs.values() {
            for (dm, device) in config.devices() {
                if device.model_name != dm.name && !models.contains_key(&device.model_name) {
                    return Err(StorageError::ModelNotFound(device.model_name.clone()));
                }
                if !config.connections.contains_key(&device.connection_key) {
                    return Err(StorageError::Invalid(format!(
                        "device {} references unknown connection {}",
                        device.device_sn, device.connection_key
                    )));
                }
                if devices
                    .insert(device.device_sn.clone(), Arc::new(device.clone()))
                    .is_some()
                {
                    return Err(StorageError::Duplicate(format!(
                        "device {}",
                        device.device_sn
                    )));
                }
            }
        }

        Ok(Self {
            configs: configs
                .iter()
                .map(|(k, v)| (k.clone(), Arc::new(v.clone())))
                .collect(),
            models,
            devices,
            point_index,
            running_plugins: RwLock::new(HashMap::new()),
        })
    }

    pub fn model(&self, model_name: &str) -> Option<Arc<Model>> {
        self.models.get(model_name).cloned()
    }

    pub fn device(&self, device_sn: &str) -> Option<Arc<Device>> {
        self.devices.get(device_sn).cloned()
    }

    pub fn point_by_model(&self, model_name: &str, point_name: &str) -> Option<Point> {
        let i = *self.point_index.get(model_name)?.get(point_name)?;
        self.models.get(model_name)?.points.get(i).cloned()
    }

    pub fn point_by_device(&self, device_sn: &str, point_name: &str) -> Option<Point> {
        let device = self.devices.get(device_sn)?;
        self.point_by_model(&device.model_name, point_name)
    }

    pub fn models(&self) -> Vec<Arc<Model>> {
        self.models.values().cloned().collect()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.values().cloned().collect()
    }

    pub fn config(&self, connector_key: &str) -> Option<Arc<DeviceConfig>> {
        self.configs.get(connector_key).cloned()
    }

    pub fn configs(&self) -> impl Iterator<Item = (&String, &Arc<DeviceConfig>)> {
        self.configs.iter()
    }

    /// 设备所属驱动目录 key。
    pub fn connector_key_of(&self, device_sn: &str) -> Option<String> {
        let device = self.devices.get(device_sn)?;
        self.models
            .get(&device.model_name)
            .map(|m| m.connector_key.clone())
    }

    pub fn add_running_plugin(&self, connector_key: impl Into<String>, plugin: Arc<P>) {
        self.running_plugins
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(connector_key.into(), plugin);
    }

    /// 按设备 SN 查找插件。
    pub fn plugin(&self, device_sn: &str) -> Option<Arc<P>> {
        let key = self.connector_key_of(device_sn)?;
        self.plugin_by_key(&key)
    }

    pub fn plugin_by_model(&self, model_name: &str) -> Option<Arc<P>> {
        let model = self.models.get(model_name)?;
        self.plugin_by_key(&model.connector_key)
    }

    pub fn plugin_by_key(&self, connector_key: &str) -> Option<Arc<P>> {
        self.running_plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(connector_key)
            .cloned()
    }

    /// 周期结束时取回全部插件（同时解除注册表对插件的引用）。
    pub fn take_running_plugins(&self) -> Vec<(String, Arc<P>)> {
        self.running_plugins
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect()
    }
}
