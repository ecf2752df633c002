use std::time::Duration;

use rand::Rng;
use tracing::debug;

use orchestrator_domain::OrchestratorError;

/// 失败信息里的瞬时故障特征
///
/// worker抛出的错误不一定带类型，只能靠消息匹配兜底，
/// 与错误枚举自身的is_retryable判断取并集
const TRANSIENT_SIGNATURES: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "econnreset",
    "rate limit",
    "too many requests",
    "captcha",
    "verification",
    "temporarily",
];

/// 重试策略配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 最大重试次数
    pub max_retries: u32,
    /// 基础退避间隔
    pub base_delay: Duration,
    /// 退避间隔上限
    pub max_delay: Duration,
    /// 随机抖动占指数间隔的比例（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(5_000),
            max_delay: Duration::from_millis(300_000), // 5分钟
            jitter_factor: 0.1,
        }
    }
}

/// 无状态的重试决策，与失败的attempt同步内联调用
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// 判断第attempt次失败后是否还应重试
    ///
    /// 超过max_retries一律不重试；瞬时类错误（网络、超时、限流、
    /// 验证挑战）可重试，请求畸形或目标不支持永不重试
    pub fn should_retry(&self, error: &OrchestratorError, attempt: u32, max_retries: u32) -> bool {
        if attempt > max_retries {
            debug!("attempt {} 已超过最大重试次数 {}，不再重试", attempt, max_retries);
            return false;
        }
        is_transient(error)
    }

    /// 计算第attempt次重试前的等待时长
    ///
    /// min(base * 2^(attempt-1) + jitter, max)，抖动只加不减，
    /// 重试永远不会早于无抖动的指数计划
    pub fn delay_for(&self, attempt: u32, base_delay: Duration) -> Duration {
        let base_ms = base_delay.as_millis() as u64;
        let max_ms = self.config.max_delay.as_millis() as u64;

        let shift = attempt.saturating_sub(1).min(20);
        let exponential_ms = base_ms.saturating_mul(1u64 << shift);

        let jitter_bound = (exponential_ms as f64 * self.config.jitter_factor) as u64;
        let jitter_ms = if jitter_bound > 0 {
            rand::rng().random_range(0..=jitter_bound)
        } else {
            0
        };

        Duration::from_millis(exponential_ms.saturating_add(jitter_ms).min(max_ms))
    }
}

/// 错误是否属于瞬时故障
pub fn is_transient(error: &OrchestratorError) -> bool {
    if error.is_retryable() {
        return true;
    }
    let message = error.to_string().to_lowercase();
    TRANSIENT_SIGNATURES
        .iter()
        .any(|signature| message.contains(signature))
}
