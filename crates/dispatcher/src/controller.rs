use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use orchestrator_domain::{JobSnapshot, OrchestratorResult, ScrapeRequest};

use crate::proxy_pool::ProxyPoolStats;
use crate::scheduler::ScrapeScheduler;

/// 按状态分桶的任务计数
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStatusSummary {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStatusSummary {
    pub fn total(&self) -> usize {
        self.waiting + self.active + self.delayed + self.completed + self.failed
    }

    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }

    /// 还会产生活动的任务数（非终态）
    pub fn in_flight(&self) -> usize {
        self.waiting + self.active + self.delayed
    }
}

/// 编排引擎对外的唯一门面
///
/// 上层（API handler、后台任务）只通过它与调度器交互，
/// 拿到的都是只读快照，从不泄露内部可变状态
#[derive(Clone)]
pub struct OrchestratorController {
    scheduler: Arc<ScrapeScheduler>,
}

impl OrchestratorController {
    pub fn new(scheduler: Arc<ScrapeScheduler>) -> Self {
        Self { scheduler }
    }

    /// 启动后台调度循环
    pub fn start(&self) {
        self.scheduler.start();
    }

    /// 停止调度并中止在途执行
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    /// 提交抓取请求，成功即返回任务id
    pub fn submit(&self, request: ScrapeRequest) -> OrchestratorResult<Uuid> {
        self.scheduler.submit(request)
    }

    /// 取消等待中的任务，Active任务不可抢占，返回false
    pub fn cancel(&self, job_id: Uuid) -> bool {
        self.scheduler.cancel(job_id)
    }

    /// 按外部关联键取消，找不到映射时返回false
    pub fn cancel_by_correlation(&self, correlation_id: i64) -> bool {
        match self.scheduler.job_id_by_correlation(correlation_id) {
            Some(job_id) => {
                info!(
                    "按关联键 {} 取消任务 {}",
                    correlation_id, job_id
                );
                self.scheduler.cancel(job_id)
            }
            None => false,
        }
    }

    pub fn get_status(&self, job_id: Uuid) -> Option<JobSnapshot> {
        self.scheduler.snapshot(job_id)
    }

    pub fn get_status_by_correlation(&self, correlation_id: i64) -> Option<JobSnapshot> {
        self.scheduler.snapshot_by_correlation(correlation_id)
    }

    pub fn get_stats(&self) -> JobStatusSummary {
        self.scheduler.stats()
    }

    pub fn list_active(&self) -> Vec<JobSnapshot> {
        self.scheduler.list_active()
    }

    pub fn proxy_pool_stats(&self) -> ProxyPoolStats {
        self.scheduler.proxy_pool().stats()
    }
}
