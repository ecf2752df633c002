//! 任务事件
//!
//! 调度器对外推送的事件定义，投递方式由EventSink的实现决定，
//! fire-and-forget，不确认也不重放

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    Started {
        job_id: Uuid,
        correlation_id: Option<i64>,
        attempt: u32,
        occurred_at: DateTime<Utc>,
    },
    Progress {
        job_id: Uuid,
        correlation_id: Option<i64>,
        percent: u8,
        message: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    Completed {
        job_id: Uuid,
        correlation_id: Option<i64>,
        total_comments: u32,
        message: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    Failed {
        job_id: Uuid,
        correlation_id: Option<i64>,
        reason: String,
        retryable: bool,
        occurred_at: DateTime<Utc>,
    },
    QueuePosition {
        job_id: Uuid,
        correlation_id: Option<i64>,
        position: usize,
        occurred_at: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Started { job_id, .. } => *job_id,
            JobEvent::Progress { job_id, .. } => *job_id,
            JobEvent::Completed { job_id, .. } => *job_id,
            JobEvent::Failed { job_id, .. } => *job_id,
            JobEvent::QueuePosition { job_id, .. } => *job_id,
        }
    }

    pub fn correlation_id(&self) -> Option<i64> {
        match self {
            JobEvent::Started { correlation_id, .. } => *correlation_id,
            JobEvent::Progress { correlation_id, .. } => *correlation_id,
            JobEvent::Completed { correlation_id, .. } => *correlation_id,
            JobEvent::Failed { correlation_id, .. } => *correlation_id,
            JobEvent::QueuePosition { correlation_id, .. } => *correlation_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::Started { .. } => "started",
            JobEvent::Progress { .. } => "progress",
            JobEvent::Completed { .. } => "completed",
            JobEvent::Failed { .. } => "failed",
            JobEvent::QueuePosition { .. } => "queuePosition",
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            JobEvent::Started { occurred_at, .. } => *occurred_at,
            JobEvent::Progress { occurred_at, .. } => *occurred_at,
            JobEvent::Completed { occurred_at, .. } => *occurred_at,
            JobEvent::Failed { occurred_at, .. } => *occurred_at,
            JobEvent::QueuePosition { occurred_at, .. } => *occurred_at,
        }
    }
}
