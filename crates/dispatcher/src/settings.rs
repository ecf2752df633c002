use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::warn;

use orchestrator_domain::SettingsAccessor;

/// 配置项键名，与后台GlobalSettings保持一致
pub mod keys {
    pub const STANDARD_CONCURRENCY: &str = "standard_concurrency";
    pub const MAX_RETRIES: &str = "max_retries";
    pub const RETRY_BASE_DELAY_MS: &str = "retry_base_delay_ms";
    pub const JOB_TIMEOUT_MS: &str = "job_timeout_ms";
}

/// 访问器失效时的硬编码回退默认值
pub mod defaults {
    pub const STANDARD_CONCURRENCY: u64 = 1;
    pub const MAX_RETRIES: u64 = 2;
    pub const RETRY_BASE_DELAY_MS: u64 = 5_000;
    pub const JOB_TIMEOUT_MS: u64 = 600_000;
}

/// 一个调度周期内生效的配置快照
///
/// 每个dispatch/sweep周期都重新load一次，不缓存，
/// 运维改配置立即生效
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub standard_concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub job_timeout: Duration,
}

impl EffectiveSettings {
    pub fn load(accessor: &dyn SettingsAccessor) -> Self {
        Self {
            standard_concurrency: accessor
                .get_u64(keys::STANDARD_CONCURRENCY)
                .unwrap_or(defaults::STANDARD_CONCURRENCY)
                .max(1) as usize,
            max_retries: accessor
                .get_u64(keys::MAX_RETRIES)
                .unwrap_or(defaults::MAX_RETRIES) as u32,
            retry_base_delay: Duration::from_millis(
                accessor
                    .get_u64(keys::RETRY_BASE_DELAY_MS)
                    .unwrap_or(defaults::RETRY_BASE_DELAY_MS),
            ),
            job_timeout: Duration::from_millis(
                accessor
                    .get_u64(keys::JOB_TIMEOUT_MS)
                    .unwrap_or(defaults::JOB_TIMEOUT_MS)
                    .max(1),
            ),
        }
    }
}

impl Default for EffectiveSettings {
    fn default() -> Self {
        Self {
            standard_concurrency: defaults::STANDARD_CONCURRENCY as usize,
            max_retries: defaults::MAX_RETRIES as u32,
            retry_base_delay: Duration::from_millis(defaults::RETRY_BASE_DELAY_MS),
            job_timeout: Duration::from_millis(defaults::JOB_TIMEOUT_MS),
        }
    }
}

/// 进程内的可热改配置实现
#[derive(Default)]
pub struct InMemorySettings {
    values: RwLock<HashMap<String, u64>>,
}

impl InMemorySettings {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, key: &str, value: u64) {
        match self.values.write() {
            Ok(mut values) => {
                values.insert(key.to_string(), value);
            }
            Err(e) => warn!("写入配置 {} 失败: {}", key, e),
        }
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.write() {
            values.remove(key);
        }
    }
}

impl SettingsAccessor for InMemorySettings {
    fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.read().ok()?.get(key).copied()
    }
}
