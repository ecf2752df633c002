use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::value_objects::{Platform, Tier};

/// 任务生命周期状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    #[serde(rename = "WAITING")]
    Waiting,
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "DELAYED")]
    Delayed,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Active)
    }
}

/// 抓取请求载荷，提交后不可变
///
/// 原始来源是调用方的动态字段，这里收敛为强类型结构，
/// 在submit时一次性校验。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeRequest {
    /// 目标视频/帖子URL
    pub target_url: String,
    /// 由URL推断出的平台
    pub platform: Platform,
    /// 发起请求的租户标识
    pub requester_id: String,
    /// 套餐层级，premium进入优先车道
    pub tier: Tier,
    /// 外部关联键（历史记录id），调用方用它查询状态
    pub correlation_id: Option<i64>,
    /// 本次抓取的评论数上限
    pub max_comments: u32,
    /// 调用方指定的代理，优先于代理池
    pub proxy_override: Option<String>,
    /// 是否携带用户Cookie执行
    pub use_cookie: bool,
}

impl ScrapeRequest {
    pub fn new<S: Into<String>>(target_url: S, requester_id: S, tier: Tier) -> OrchestratorResult<Self> {
        let target_url = target_url.into();
        let platform = Platform::from_url(&target_url).ok_or_else(|| {
            OrchestratorError::invalid_request(format!("无法识别的目标URL: {target_url}"))
        })?;
        Ok(Self {
            target_url,
            platform,
            requester_id: requester_id.into(),
            tier,
            correlation_id: None,
            max_comments: 500,
            proxy_override: None,
            use_cookie: false,
        })
    }

    pub fn with_correlation_id(mut self, correlation_id: i64) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_max_comments(mut self, max_comments: u32) -> Self {
        self.max_comments = max_comments;
        self
    }

    /// 提交时的一次性校验，失败的请求永远不会入队
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.target_url.trim().is_empty() {
            return Err(OrchestratorError::invalid_request("目标URL为空"));
        }
        match Platform::from_url(&self.target_url) {
            Some(platform) if platform == self.platform => {}
            Some(platform) => {
                return Err(OrchestratorError::invalid_request(format!(
                    "URL平台 {} 与声明的平台 {} 不一致",
                    platform.as_str(),
                    self.platform.as_str()
                )));
            }
            None => {
                return Err(OrchestratorError::invalid_request(format!(
                    "无法识别的目标URL: {}",
                    self.target_url
                )));
            }
        }
        if self.requester_id.trim().is_empty() {
            return Err(OrchestratorError::invalid_request("租户标识为空"));
        }
        if self.max_comments == 0 {
            return Err(OrchestratorError::invalid_request("max_comments 必须大于0"));
        }
        Ok(())
    }
}

/// 一次抓取的执行结果摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub total_comments: u32,
    pub message: Option<String>,
}

impl ScrapeOutcome {
    pub fn new(total_comments: u32) -> Self {
        Self {
            total_comments,
            message: None,
        }
    }
}

/// 任务记录，由调度器的任务表独占持有
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub request: ScrapeRequest,
    pub state: JobState,
    /// 0-100，Active期间单调不减
    pub progress: u8,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    /// 每次进入Active都会重新打点，僵尸检测量的是本次attempt的年龄
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub outcome: Option<ScrapeOutcome>,
}

impl JobRecord {
    pub fn new(request: ScrapeRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            state: JobState::Waiting,
            progress: 0,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            failure_reason: None,
            outcome: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
    pub fn is_successful(&self) -> bool {
        matches!(self.state, JobState::Completed)
    }

    /// 进入Active，无论第几次attempt都重新打startedAt
    pub fn mark_active(&mut self) {
        self.state = JobState::Active;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, outcome: ScrapeOutcome) {
        self.state = JobState::Completed;
        self.progress = 100;
        self.finished_at = Some(Utc::now());
        self.outcome = Some(outcome);
    }

    pub fn mark_failed<S: Into<String>>(&mut self, reason: S) {
        self.state = JobState::Failed;
        self.finished_at = Some(Utc::now());
        self.failure_reason = Some(reason.into());
    }

    /// 进入退避等待，等计时器到点再回到Waiting
    pub fn mark_delayed(&mut self) {
        self.state = JobState::Delayed;
        self.retry_count += 1;
    }

    pub fn mark_waiting(&mut self) {
        self.state = JobState::Waiting;
    }

    /// 当前attempt的序号（首次执行为1）
    pub fn attempt_number(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn execution_duration_ms(&self) -> Option<i64> {
        if let (Some(started), Some(finished)) = (self.started_at, self.finished_at) {
            Some((finished - started).num_milliseconds())
        } else {
            None
        }
    }
}

/// 对外暴露的只读投影，门面层只持有它，从不直接持有JobRecord
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub state: JobState,
    pub progress: u8,
    pub retry_count: u32,
    pub tier: Tier,
    pub platform: Platform,
    pub target_url: String,
    pub requester_id: String,
    pub correlation_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub outcome: Option<ScrapeOutcome>,
}

impl From<&JobRecord> for JobSnapshot {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id,
            state: job.state,
            progress: job.progress,
            retry_count: job.retry_count,
            tier: job.request.tier,
            platform: job.request.platform,
            target_url: job.request.target_url.clone(),
            requester_id: job.request.requester_id.clone(),
            correlation_id: job.request.correlation_id,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            failure_reason: job.failure_reason.clone(),
            outcome: job.outcome.clone(),
        }
    }
}
