use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use orchestrator_domain::RotationStrategy;

/// 连续失败多少次之后摘除该代理
const UNHEALTHY_THRESHOLD: u32 = 3;

/// 单个出口代理的健康记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyHealth {
    pub address: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub success_count: u64,
    /// 累积滑动均值，不是窗口均值
    pub average_latency_ms: f64,
}

impl ProxyHealth {
    fn new(address: String) -> Self {
        Self {
            address,
            healthy: true,
            consecutive_failures: 0,
            success_count: 0,
            average_latency_ms: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyPoolStats {
    pub total: usize,
    pub healthy: usize,
    pub entries: Vec<ProxyHealth>,
}

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<ProxyHealth>,
    strategy: RotationStrategy,
    /// sequential模式的游标
    cursor: usize,
}

/// 出口代理池，跟踪健康度并按策略轮换
///
/// 状态由单个互斥量保护，调用方都是调度器自己的事件处理器，
/// 锁从不跨越await持有
#[derive(Debug, Default)]
pub struct ProxyPool {
    state: Mutex<PoolState>,
}

impl ProxyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 重置代理列表与轮换策略，全部标记为健康
    pub fn configure(&self, addresses: Vec<String>, strategy: RotationStrategy) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries = addresses
            .into_iter()
            .map(|address| address.trim().to_string())
            .filter(|address| !address.is_empty())
            .map(ProxyHealth::new)
            .collect();
        state.strategy = strategy;
        state.cursor = 0;
        info!(
            "代理池已配置: {} 个代理, 轮换策略 {}",
            state.entries.len(),
            strategy.as_str()
        );
    }

    /// 按策略选出下一个健康代理
    ///
    /// 健康集合为空时fail-open：整池重置为健康再选一次，
    /// 宁可用坏代理也不让dispatch饿死
    pub fn next(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.entries.is_empty() {
            return None;
        }

        if !state.entries.iter().any(|entry| entry.healthy) {
            warn!("代理池中已无健康代理，fail-open重置为全部健康");
            for entry in &mut state.entries {
                entry.healthy = true;
                entry.consecutive_failures = 0;
            }
        }

        let healthy_indices: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.healthy)
            .map(|(index, _)| index)
            .collect();

        let picked = match state.strategy {
            RotationStrategy::Random => {
                let offset = rand::rng().random_range(0..healthy_indices.len());
                healthy_indices[offset]
            }
            RotationStrategy::Sequential => {
                let offset = state.cursor % healthy_indices.len();
                state.cursor = state.cursor.wrapping_add(1);
                healthy_indices[offset]
            }
        };

        let address = state.entries[picked].address.clone();
        debug!("选中代理: {}", address);
        Some(address)
    }

    /// 上报一次成功使用，回落失败计数并折入延迟样本
    pub fn report_success(&self, address: &str, latency_ms: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = state
            .entries
            .iter_mut()
            .find(|entry| entry.address == address)
        {
            entry.consecutive_failures = entry.consecutive_failures.saturating_sub(1);
            entry.healthy = true;
            entry.success_count += 1;
            let n = entry.success_count as f64;
            entry.average_latency_ms =
                (entry.average_latency_ms * (n - 1.0) + latency_ms as f64) / n;
        }
    }

    /// 上报一次失败，连续失败到阈值即摘除
    pub fn report_failure(&self, address: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = state
            .entries
            .iter_mut()
            .find(|entry| entry.address == address)
        {
            entry.consecutive_failures += 1;
            if entry.consecutive_failures >= UNHEALTHY_THRESHOLD && entry.healthy {
                entry.healthy = false;
                warn!(
                    "代理 {} 连续失败 {} 次，标记为不健康",
                    address, entry.consecutive_failures
                );
            }
        }
    }

    pub fn stats(&self) -> ProxyPoolStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        ProxyPoolStats {
            total: state.entries.len(),
            healthy: state.entries.iter().filter(|entry| entry.healthy).count(),
            entries: state.entries.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .is_empty()
    }
}
