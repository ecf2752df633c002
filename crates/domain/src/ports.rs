//! 对外协作者的端口定义
//!
//! 调度器不关心抓取如何实现、事件如何投递、配置存在哪里，
//! 全部通过这里的trait注入，测试时可以替换

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::entities::{ScrapeOutcome, ScrapeRequest};
use crate::errors::OrchestratorResult;
use crate::events::JobEvent;

/// 单次执行的上下文，调度器每次dispatch构造一份
#[derive(Clone)]
pub struct ScrapeJobContext {
    pub job_id: Uuid,
    /// 本次是第几次attempt（首次为1）
    pub attempt: u32,
    pub request: ScrapeRequest,
    /// 本次分配到的出口代理
    pub proxy: Option<String>,
    /// worker通过它上报抓取进度
    pub progress: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for ScrapeJobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrapeJobContext")
            .field("job_id", &self.job_id)
            .field("attempt", &self.attempt)
            .field("request", &self.request)
            .field("proxy", &self.proxy)
            .finish()
    }
}

/// 抓取执行器，每次dispatch恰好调用一次execute
///
/// 持久化（Running/Success/Failed落库）由worker的实现方负责，
/// 不在调度器内部做
#[async_trait]
pub trait ScrapeWorker: Send + Sync {
    async fn execute(&self, ctx: ScrapeJobContext) -> OrchestratorResult<ScrapeOutcome>;
}

/// 事件接收端，fire-and-forget
pub trait EventSink: Send + Sync {
    fn notify(&self, event: JobEvent);
}

/// worker侧的进度上报句柄
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: u8, message: Option<String>);
}

/// 命名数值配置的访问端口
///
/// 调度器每个周期都重新读取，不做缓存，运维改配置无需重启；
/// 读不到时由调用处回退到硬编码默认值
pub trait SettingsAccessor: Send + Sync {
    fn get_u64(&self, key: &str) -> Option<u64>;
}
