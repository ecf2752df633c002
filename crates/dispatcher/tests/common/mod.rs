//! 集成测试共用的桩实现
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use orchestrator_dispatcher::{
    InMemorySettings, ProxyPool, RetryPolicy, SchedulerTimings, ScrapeScheduler,
};
use orchestrator_domain::{
    EventSink, JobEvent, OrchestratorError, OrchestratorResult, ScrapeJobContext, ScrapeOutcome,
    ScrapeWorker,
};

/// 单次execute的预设剧本
pub enum Script {
    Succeed(u32),
    /// 耗时指定时长后才成功
    SucceedAfter(Duration, u32),
    /// 先按步骤上报进度再成功
    SucceedWithProgress(Vec<u8>, u32),
    Fail(OrchestratorError),
    /// 永不落定，用来触发僵尸检测
    Hang,
}

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub job_id: Uuid,
    pub attempt: u32,
    pub proxy: Option<String>,
    pub requester_id: String,
}

/// 按预设剧本执行的抓取桩，剧本耗尽后默认成功返回0条
#[derive(Default)]
pub struct MockScrapeWorker {
    scripts: Mutex<VecDeque<Script>>,
    executions: Mutex<Vec<ExecutionRecord>>,
    work_duration: Mutex<Option<Duration>>,
}

impl MockScrapeWorker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .push_back(script);
    }

    /// 让每次execute都先耗时指定时长再按剧本落定
    pub fn set_work_duration(&self, duration: Duration) {
        *self.work_duration.lock().unwrap() = Some(duration);
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.executions.lock().unwrap().clone()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }
}

#[async_trait]
impl ScrapeWorker for MockScrapeWorker {
    async fn execute(&self, ctx: ScrapeJobContext) -> OrchestratorResult<ScrapeOutcome> {
        self.executions.lock().unwrap().push(ExecutionRecord {
            job_id: ctx.job_id,
            attempt: ctx.attempt,
            proxy: ctx.proxy.clone(),
            requester_id: ctx.request.requester_id.clone(),
        });

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Succeed(0));
        let work = *self.work_duration.lock().unwrap();
        if let Some(duration) = work {
            tokio::time::sleep(duration).await;
        }

        match script {
            Script::Succeed(total) => Ok(ScrapeOutcome::new(total)),
            Script::SucceedAfter(duration, total) => {
                tokio::time::sleep(duration).await;
                Ok(ScrapeOutcome::new(total))
            }
            Script::SucceedWithProgress(steps, total) => {
                for percent in steps {
                    ctx.progress.report(percent, None);
                }
                Ok(ScrapeOutcome::new(total))
            }
            Script::Fail(error) => Err(error),
            Script::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// 把收到的事件原样记下来供断言
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<JobEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds_for(&self, job_id: Uuid) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.job_id() == job_id)
            .map(|event| event.kind())
            .collect()
    }

    pub fn last_failed_for(&self, job_id: Uuid) -> Option<(String, bool)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|event| match event {
                JobEvent::Failed {
                    job_id: id,
                    reason,
                    retryable,
                    ..
                } if *id == job_id => Some((reason.clone(), *retryable)),
                _ => None,
            })
    }
}

impl EventSink for RecordingEventSink {
    fn notify(&self, event: JobEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct Harness {
    pub scheduler: Arc<ScrapeScheduler>,
    pub worker: Arc<MockScrapeWorker>,
    pub events: Arc<RecordingEventSink>,
    pub settings: Arc<InMemorySettings>,
    pub proxy_pool: Arc<ProxyPool>,
}

/// 组装一套不启动后台循环的调度器，各轮扫描由测试手动驱动
pub fn harness_with_timings(timings: SchedulerTimings) -> Harness {
    let worker = MockScrapeWorker::new();
    let events = RecordingEventSink::new();
    let settings = InMemorySettings::new();
    let proxy_pool = Arc::new(ProxyPool::new());
    let scheduler = ScrapeScheduler::new(
        worker.clone(),
        events.clone(),
        settings.clone(),
        proxy_pool.clone(),
        RetryPolicy::default(),
        timings,
    )
    .unwrap();
    Harness {
        scheduler,
        worker,
        events,
        settings,
        proxy_pool,
    }
}

pub fn harness() -> Harness {
    harness_with_timings(SchedulerTimings::default())
}
