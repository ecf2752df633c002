//! 抓取任务编排引擎
//!
//! 进程内的抓取任务编排：双车道优先级队列、指数退避重试、
//! 僵尸任务检测与代理池轮换。对外只暴露OrchestratorController
//! 一个门面，worker与事件投递由调用方注入。
//!
//! 典型用法：用OrchestratorBuilder组装各个部件，start()之后
//! 通过controller提交与查询任务，进程退出前shutdown()。

pub mod logging;

pub use orchestrator_dispatcher::{
    EffectiveSettings, InMemorySettings, JobStatusSummary, OrchestratorController, ProxyHealth,
    ProxyPool, ProxyPoolStats, RetryConfig, RetryPolicy, SchedulerTimings, ScrapeScheduler,
};
pub use orchestrator_domain::{
    EventSink, JobEvent, JobSnapshot, JobState, OrchestratorError, OrchestratorResult, Platform,
    ProgressSink, RotationStrategy, ScrapeJobContext, ScrapeOutcome, ScrapeRequest, ScrapeWorker,
    SettingsAccessor, Tier,
};

use std::sync::Arc;

use tracing::info;

/// 编排引擎的组装器
///
/// worker和事件出口必须注入，其余部件缺省即可用
pub struct OrchestratorBuilder {
    worker: Option<Arc<dyn ScrapeWorker>>,
    events: Option<Arc<dyn EventSink>>,
    settings: Option<Arc<dyn SettingsAccessor>>,
    proxy_pool: Option<Arc<ProxyPool>>,
    retry: RetryPolicy,
    timings: SchedulerTimings,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            worker: None,
            events: None,
            settings: None,
            proxy_pool: None,
            retry: RetryPolicy::default(),
            timings: SchedulerTimings::default(),
        }
    }

    pub fn worker(mut self, worker: Arc<dyn ScrapeWorker>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsAccessor>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn proxy_pool(mut self, proxy_pool: Arc<ProxyPool>) -> Self {
        self.proxy_pool = Some(proxy_pool);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timings(mut self, timings: SchedulerTimings) -> Self {
        self.timings = timings;
        self
    }

    /// 组装controller，worker或事件出口缺失即报配置错误
    pub fn build(self) -> OrchestratorResult<OrchestratorController> {
        let worker = self
            .worker
            .ok_or_else(|| OrchestratorError::config_error("缺少ScrapeWorker实现"))?;
        let events = self
            .events
            .ok_or_else(|| OrchestratorError::config_error("缺少EventSink实现"))?;
        let settings: Arc<dyn SettingsAccessor> = match self.settings {
            Some(settings) => settings,
            None => InMemorySettings::new(),
        };
        let proxy_pool = self.proxy_pool.unwrap_or_default();

        let scheduler = ScrapeScheduler::new(
            worker,
            events,
            settings,
            proxy_pool,
            self.retry,
            self.timings,
        )?;
        info!("编排引擎组装完成");
        Ok(OrchestratorController::new(scheduler))
    }
}
