use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// 进程级插件缓存，脚本 `setCache`/`getCache` 与 REST `/plugin/cache` 共用。
///
/// 跨配置周期保留。
#[derive(Clone, Default)]
pub struct PluginCache {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl PluginCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_entries() {
        let cache = PluginCache::new();
        let other = cache.clone();
        cache.set("token", "abc");
        assert_eq!(other.get("token").as_deref(), Some("abc"));
        assert!(other.get("missing").is_none());
    }
}
