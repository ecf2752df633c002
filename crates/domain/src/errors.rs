use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("抓取请求无效: {0}")]
    InvalidRequest(String),
    #[error("任务不存在: id={id}")]
    JobNotFound { id: Uuid },
    #[error("网络连接失败: {0}")]
    Network(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("触发平台限流: {0}")]
    RateLimited(String),
    #[error("遇到人机验证挑战: {0}")]
    BotChallenge(String),
    #[error("目标不受支持或不存在: {0}")]
    UnsupportedTarget(String),
    #[error("抓取执行失败: {0}")]
    WorkerFailed(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("数据序列化错误: {0}")]
    Serialization(String),
    #[error("系统内部错误: {0}")]
    Internal(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
        Self::InvalidRequest(msg.into())
    }
    pub fn job_not_found(id: Uuid) -> Self {
        Self::JobNotFound { id }
    }
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }
    pub fn worker_failed<S: Into<String>>(msg: S) -> Self {
        Self::WorkerFailed(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 瞬时故障，重试可能成功
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Network(_)
                | OrchestratorError::Timeout(_)
                | OrchestratorError::RateLimited(_)
                | OrchestratorError::BotChallenge(_)
        )
    }
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Internal(_) | OrchestratorError::Configuration(_)
        )
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}
