use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use orchestrator_domain::{
    EventSink, JobEvent, JobRecord, JobSnapshot, JobState, OrchestratorError, OrchestratorResult,
    ProgressSink, ScrapeJobContext, ScrapeOutcome, ScrapeRequest, ScrapeWorker, SettingsAccessor,
};

use crate::controller::JobStatusSummary;
use crate::proxy_pool::ProxyPool;
use crate::retry_policy::RetryPolicy;
use crate::settings::EffectiveSettings;

/// 调度循环的节奏配置
///
/// 僵尸检测间隔必须小于宽限期，否则无法保证及时发现
#[derive(Debug, Clone)]
pub struct SchedulerTimings {
    /// dispatch定时触发间隔
    pub dispatch_interval: Duration,
    /// 僵尸任务扫描间隔
    pub zombie_sweep_interval: Duration,
    /// 终态任务清理间隔
    pub cleanup_interval: Duration,
    /// 超过 job_timeout + grace 仍未落定视为僵尸
    pub zombie_grace: Duration,
    /// 终态任务在任务表里的保留时长
    pub retention: Duration,
}

impl Default for SchedulerTimings {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_secs(1),
            zombie_sweep_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            zombie_grace: Duration::from_secs(60),
            retention: Duration::from_secs(3600), // 1小时
        }
    }
}

impl SchedulerTimings {
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.zombie_sweep_interval >= self.zombie_grace {
            return Err(OrchestratorError::config_error(format!(
                "僵尸检测间隔 {:?} 必须小于宽限期 {:?}",
                self.zombie_sweep_interval, self.zombie_grace
            )));
        }
        Ok(())
    }
}

/// 正在执行的attempt的运行时记录
struct ActiveRun {
    handle: JoinHandle<()>,
    /// 本次attempt的起点，僵尸检测量的是它的年龄
    started: Instant,
    premium: bool,
    requester_id: String,
}

/// 调度器的全部可变状态，只在锁内访问，锁从不跨越await
#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<Uuid, JobRecord>,
    premium_lane: VecDeque<Uuid>,
    standard_lane: VecDeque<Uuid>,
    active: HashMap<Uuid, ActiveRun>,
    /// 优先车道的每租户并发上限为1，记录当前占位的租户
    active_premium_identities: HashSet<String>,
    correlations: HashMap<i64, Uuid>,
}

/// 已决定启动、待派发给worker的任务
struct DispatchedJob {
    id: Uuid,
    attempt: u32,
    premium: bool,
    requester_id: String,
    correlation_id: Option<i64>,
    request: ScrapeRequest,
}

/// 抓取任务调度器核心
///
/// 双FIFO车道（premium/standard），premium即时派发但每租户
/// 最多一个并发，standard受全局并发上限约束。配置每个周期
/// 重新读取，改动无需重启进程。
///
/// 进程内、尽力而为：任务表只在内存里，崩溃即丢失。
pub struct ScrapeScheduler {
    worker: Arc<dyn ScrapeWorker>,
    events: Arc<dyn EventSink>,
    settings: Arc<dyn SettingsAccessor>,
    proxy_pool: Arc<ProxyPool>,
    retry: RetryPolicy,
    timings: SchedulerTimings,
    state: Mutex<SchedulerState>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl ScrapeScheduler {
    pub fn new(
        worker: Arc<dyn ScrapeWorker>,
        events: Arc<dyn EventSink>,
        settings: Arc<dyn SettingsAccessor>,
        proxy_pool: Arc<ProxyPool>,
        retry: RetryPolicy,
        timings: SchedulerTimings,
    ) -> OrchestratorResult<Arc<Self>> {
        timings.validate()?;
        Ok(Arc::new(Self {
            worker,
            events,
            settings,
            proxy_pool,
            retry,
            timings,
            state: Mutex::new(SchedulerState::default()),
            loops: Mutex::new(Vec::new()),
        }))
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 启动三个定时循环，生命周期归start/shutdown管
    pub fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        if !loops.is_empty() {
            warn!("调度循环已在运行，忽略重复start");
            return;
        }

        let scheduler = Arc::clone(self);
        let dispatch_interval = self.timings.dispatch_interval;
        loops.push(tokio::spawn(async move {
            let mut tick = interval(dispatch_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                scheduler.dispatch_pass().await;
            }
        }));

        let scheduler = Arc::clone(self);
        let sweep_interval = self.timings.zombie_sweep_interval;
        loops.push(tokio::spawn(async move {
            let mut tick = interval(sweep_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                scheduler.zombie_sweep().await;
            }
        }));

        let scheduler = Arc::clone(self);
        let cleanup_interval = self.timings.cleanup_interval;
        loops.push(tokio::spawn(async move {
            let mut tick = interval(cleanup_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                scheduler.cleanup_pass();
            }
        }));

        info!(
            "调度器已启动: dispatch每{:?}, 僵尸检测每{:?}, 清理每{:?}",
            self.timings.dispatch_interval,
            self.timings.zombie_sweep_interval,
            self.timings.cleanup_interval
        );
    }

    /// 停止定时循环并中止在途的执行
    pub fn shutdown(&self) {
        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        for handle in loops.drain(..) {
            handle.abort();
        }
        let mut guard = self.state();
        let s = &mut *guard;
        for (_, run) in s.active.drain() {
            run.handle.abort();
        }
        s.active_premium_identities.clear();
        info!("调度器已停止");
    }

    /// 提交一个抓取请求，立即返回任务id，入队从不阻塞
    ///
    /// 校验失败同步报错，不入队也不重试。需在tokio运行时内调用：
    /// 提交后会异步触发一轮即时dispatch。
    pub fn submit(self: &Arc<Self>, request: ScrapeRequest) -> OrchestratorResult<Uuid> {
        request.validate()?;

        let job = JobRecord::new(request);
        let job_id = job.id;
        let correlation_id = job.request.correlation_id;
        let premium = job.request.tier.is_premium();

        let position = {
            let mut guard = self.state();
            let s = &mut *guard;
            if let Some(correlation) = correlation_id {
                s.correlations.insert(correlation, job_id);
            }
            let lane = if premium {
                &mut s.premium_lane
            } else {
                &mut s.standard_lane
            };
            lane.push_back(job_id);
            let position = lane.len();
            s.jobs.insert(job_id, job);
            position
        };

        info!(
            "任务 {} 已提交，进入{}车道，排位 {}",
            job_id,
            if premium { "优先" } else { "普通" },
            position
        );
        self.events.notify(JobEvent::QueuePosition {
            job_id,
            correlation_id,
            position,
            occurred_at: Utc::now(),
        });

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.dispatch_pass().await;
        });

        Ok(job_id)
    }

    /// 取消一个仍在等待的任务
    ///
    /// 只对Waiting有效；Active任务没有协作式取消令牌，无法抢占，
    /// 返回false且状态不变——这是记录在案的设计局限，不是bug
    pub fn cancel(&self, job_id: Uuid) -> bool {
        let mut events = Vec::new();
        let cancelled = {
            let mut guard = self.state();
            let s = &mut *guard;
            match s.jobs.get_mut(&job_id) {
                Some(job) if job.state == JobState::Waiting => {
                    if job.request.tier.is_premium() {
                        s.premium_lane.retain(|id| *id != job_id);
                    } else {
                        s.standard_lane.retain(|id| *id != job_id);
                    }
                    job.mark_failed("cancelled");
                    events.push(JobEvent::Failed {
                        job_id,
                        correlation_id: job.request.correlation_id,
                        reason: "cancelled".to_string(),
                        retryable: false,
                        occurred_at: Utc::now(),
                    });
                    info!("任务 {} 已在等待队列中取消", job_id);
                    true
                }
                Some(job) => {
                    debug!("任务 {} 当前状态 {:?} 不允许取消", job_id, job.state);
                    false
                }
                None => false,
            }
        };
        for event in events {
            self.events.notify(event);
        }
        cancelled
    }

    /// 单轮派发：先清优先车道（每租户一个并发），再按全局
    /// 并发上限清普通车道，二者都保持FIFO
    pub async fn dispatch_pass(self: &Arc<Self>) {
        let effective = EffectiveSettings::load(self.settings.as_ref());
        let mut dispatched: Vec<DispatchedJob> = Vec::new();

        {
            let mut guard = self.state();
            let s = &mut *guard;

            // 优先车道：被同租户占位挡住的任务回插到队首而不是队尾，
            // 保持跨租户的FIFO顺序，同时单个吵闹租户无法饿死别人
            let mut blocked: VecDeque<Uuid> = VecDeque::new();
            while let Some(id) = s.premium_lane.pop_front() {
                let requester_id = match s.jobs.get(&id) {
                    Some(job) if job.state == JobState::Waiting => job.request.requester_id.clone(),
                    _ => continue,
                };
                if s.active_premium_identities.contains(&requester_id) {
                    blocked.push_back(id);
                    continue;
                }
                s.active_premium_identities.insert(requester_id.clone());
                if let Some(job) = s.jobs.get_mut(&id) {
                    job.mark_active();
                    dispatched.push(DispatchedJob {
                        id,
                        attempt: job.attempt_number(),
                        premium: true,
                        requester_id,
                        correlation_id: job.request.correlation_id,
                        request: job.request.clone(),
                    });
                }
            }
            s.premium_lane = blocked;

            // 普通车道：单一共享并发上限，每周期从配置重新读取
            let mut active_standard = s.active.values().filter(|run| !run.premium).count()
                + dispatched.iter().filter(|job| !job.premium).count();
            while active_standard < effective.standard_concurrency {
                let Some(id) = s.standard_lane.pop_front() else {
                    break;
                };
                let Some(job) = s.jobs.get_mut(&id) else {
                    continue;
                };
                if job.state != JobState::Waiting {
                    continue;
                }
                job.mark_active();
                dispatched.push(DispatchedJob {
                    id,
                    attempt: job.attempt_number(),
                    premium: false,
                    requester_id: job.request.requester_id.clone(),
                    correlation_id: job.request.correlation_id,
                    request: job.request.clone(),
                });
                active_standard += 1;
            }
        }

        for job in dispatched {
            self.launch(job, effective.job_timeout);
        }
    }

    /// 把一个已标记Active的任务真正派发给worker执行
    fn launch(self: &Arc<Self>, job: DispatchedJob, job_timeout: Duration) {
        let (proxy, proxy_from_pool) = match job.request.proxy_override.clone() {
            Some(address) => (Some(address), false),
            None => {
                let picked = self.proxy_pool.next();
                let from_pool = picked.is_some();
                (picked, from_pool)
            }
        };

        info!(
            "任务 {} 开始第 {} 次执行 (代理: {})",
            job.id,
            job.attempt,
            proxy.as_deref().unwrap_or("无")
        );
        self.events.notify(JobEvent::Started {
            job_id: job.id,
            correlation_id: job.correlation_id,
            attempt: job.attempt,
            occurred_at: Utc::now(),
        });

        let ctx = ScrapeJobContext {
            job_id: job.id,
            attempt: job.attempt,
            request: job.request,
            proxy: proxy.clone(),
            progress: Arc::new(SchedulerProgressSink {
                scheduler: Arc::downgrade(self),
                job_id: job.id,
            }),
        };

        let scheduler = Arc::clone(self);
        let job_id = job.id;
        let handle = tokio::spawn(async move {
            let clock = Instant::now();
            let result = match tokio::time::timeout(job_timeout, scheduler.worker.execute(ctx)).await
            {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(OrchestratorError::timeout(format!(
                    "scrape timed out after {}ms",
                    job_timeout.as_millis()
                ))),
            };
            let latency_ms = clock.elapsed().as_millis() as u64;
            scheduler
                .on_worker_settled(job_id, result, proxy, proxy_from_pool, latency_ms)
                .await;
        });

        // worker极快落定时任务可能已经离开Active，此时直接丢弃句柄；
        // 落定侧的记账不依赖这里的插入是否来得及
        let mut guard = self.state();
        let s = &mut *guard;
        match s.jobs.get(&job.id) {
            Some(record) if record.state == JobState::Active => {
                s.active.insert(
                    job.id,
                    ActiveRun {
                        handle,
                        started: Instant::now(),
                        premium: job.premium,
                        requester_id: job.requester_id,
                    },
                );
            }
            _ => {}
        }
    }

    /// 执行落定后的统一出口：成功、退避重试或终态失败
    ///
    /// 占位的释放只看任务自己的tier和requester_id，不依赖active表里
    /// 是否已经登记了本次运行：worker可能在launch回锁插入ActiveRun
    /// 之前就落定
    async fn on_worker_settled(
        self: &Arc<Self>,
        job_id: Uuid,
        result: OrchestratorResult<ScrapeOutcome>,
        proxy: Option<String>,
        proxy_from_pool: bool,
        latency_ms: u64,
    ) {
        let effective = EffectiveSettings::load(self.settings.as_ref());
        let mut events: Vec<JobEvent> = Vec::new();
        let mut pool_report: Option<(String, bool)> = None;
        let mut retry_delay: Option<Duration> = None;

        {
            let mut guard = self.state();
            let s = &mut *guard;
            s.active.remove(&job_id);
            let Some(job) = s.jobs.get_mut(&job_id) else {
                return;
            };
            if job.state != JobState::Active {
                // 僵尸清扫已经处理过它，迟到的结果直接忽略
                debug!("任务 {} 已不在Active状态，忽略迟到的执行结果", job_id);
                return;
            }
            if job.request.tier.is_premium() {
                s.active_premium_identities.remove(&job.request.requester_id);
            }
            let correlation_id = job.request.correlation_id;

            match result {
                Ok(outcome) => {
                    info!(
                        "任务 {} 抓取成功，共 {} 条评论",
                        job_id, outcome.total_comments
                    );
                    events.push(JobEvent::Completed {
                        job_id,
                        correlation_id,
                        total_comments: outcome.total_comments,
                        message: outcome.message.clone(),
                        occurred_at: Utc::now(),
                    });
                    job.mark_completed(outcome);
                    if proxy_from_pool {
                        if let Some(address) = &proxy {
                            pool_report = Some((address.clone(), true));
                        }
                    }
                }
                Err(error) => {
                    let attempt = job.attempt_number();
                    if proxy_from_pool && is_proxy_attributable(&error) {
                        if let Some(address) = &proxy {
                            pool_report = Some((address.clone(), false));
                        }
                    }
                    if self.retry.should_retry(&error, attempt, effective.max_retries) {
                        job.mark_delayed();
                        let delay = self
                            .retry
                            .delay_for(job.retry_count, effective.retry_base_delay);
                        warn!(
                            "任务 {} 第 {} 次执行失败: {}，{}ms后重试",
                            job_id,
                            attempt,
                            error,
                            delay.as_millis()
                        );
                        retry_delay = Some(delay);
                    } else {
                        let reason = error.to_string();
                        error!(
                            "任务 {} 终态失败 (attempt {}/{}): {}",
                            job_id,
                            attempt,
                            effective.max_retries + 1,
                            reason
                        );
                        job.mark_failed(reason.clone());
                        events.push(JobEvent::Failed {
                            job_id,
                            correlation_id,
                            reason,
                            retryable: false,
                            occurred_at: Utc::now(),
                        });
                    }
                }
            }
        }

        if let Some((address, success)) = pool_report {
            if success {
                self.proxy_pool.report_success(&address, latency_ms);
            } else {
                self.proxy_pool.report_failure(&address);
            }
        }
        for event in events {
            self.events.notify(event);
        }

        if let Some(delay) = retry_delay {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                scheduler.requeue_after_backoff(job_id).await;
            });
        }

        // 有任务落定就释放了并发额度，立即再派发一轮
        self.dispatch_pass().await;
    }

    /// 退避计时器到点，回到原车道队尾重新排队
    async fn requeue_after_backoff(self: &Arc<Self>, job_id: Uuid) {
        let mut events = Vec::new();
        {
            let mut guard = self.state();
            let s = &mut *guard;
            let Some(job) = s.jobs.get_mut(&job_id) else {
                return;
            };
            if job.state != JobState::Delayed {
                return;
            }
            job.mark_waiting();
            let lane = if job.request.tier.is_premium() {
                &mut s.premium_lane
            } else {
                &mut s.standard_lane
            };
            lane.push_back(job_id);
            debug!(
                "任务 {} 退避结束，第 {} 次重试重新入队，排位 {}",
                job_id,
                job.retry_count,
                lane.len()
            );
            events.push(JobEvent::QueuePosition {
                job_id,
                correlation_id: job.request.correlation_id,
                position: lane.len(),
                occurred_at: Utc::now(),
            });
        }
        for event in events {
            self.events.notify(event);
        }
        self.dispatch_pass().await;
    }

    /// 僵尸任务清扫
    ///
    /// 超时竞速兜不住的情况（worker既不resolve也不reject，比如
    /// 挂死的外部进程）由这条独立的扫描兜底：超过 timeout + grace
    /// 仍未落定的Active任务强制置为失败并中止其执行
    pub async fn zombie_sweep(self: &Arc<Self>) {
        let effective = EffectiveSettings::load(self.settings.as_ref());
        let threshold = effective.job_timeout + self.timings.zombie_grace;
        let mut events = Vec::new();
        let mut forced = false;

        {
            let mut guard = self.state();
            let s = &mut *guard;
            let ids: Vec<Uuid> = s.active.keys().copied().collect();
            for id in ids {
                let elapsed = match s.active.get(&id) {
                    Some(run) => run.started.elapsed(),
                    None => continue,
                };
                let job_active = s
                    .jobs
                    .get(&id)
                    .map(|job| job.state == JobState::Active)
                    .unwrap_or(false);
                if !job_active {
                    // 落定竞态留下的残留条目，顺手清掉
                    if let Some(run) = s.active.remove(&id) {
                        if run.premium {
                            s.active_premium_identities.remove(&run.requester_id);
                        }
                    }
                    continue;
                }
                if elapsed <= threshold {
                    continue;
                }
                if let Some(run) = s.active.remove(&id) {
                    run.handle.abort();
                    if run.premium {
                        s.active_premium_identities.remove(&run.requester_id);
                    }
                }
                if let Some(job) = s.jobs.get_mut(&id) {
                    let reason = format!(
                        "timed out after {}ms without settling",
                        elapsed.as_millis()
                    );
                    warn!(
                        "检测到僵尸任务 {}: 已运行 {}ms 仍未落定，强制置为失败",
                        id,
                        elapsed.as_millis()
                    );
                    job.mark_failed(reason.clone());
                    events.push(JobEvent::Failed {
                        job_id: id,
                        correlation_id: job.request.correlation_id,
                        reason,
                        retryable: true,
                        occurred_at: Utc::now(),
                    });
                    forced = true;
                }
            }
        }

        for event in events {
            self.events.notify(event);
        }
        if forced {
            self.dispatch_pass().await;
        }
    }

    /// 按保留期清理终态任务，约束任务表的内存占用
    pub fn cleanup_pass(&self) {
        let retention = chrono::Duration::from_std(self.timings.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let cutoff = Utc::now() - retention;

        let mut guard = self.state();
        let s = &mut *guard;
        let before = s.jobs.len();
        s.jobs.retain(|_, job| {
            !(job.is_finished() && job.finished_at.map(|at| at < cutoff).unwrap_or(false))
        });
        let jobs = &s.jobs;
        s.correlations.retain(|_, id| jobs.contains_key(id));
        let removed = before - s.jobs.len();
        if removed > 0 {
            debug!("清理了 {} 个超过保留期的终态任务", removed);
        }
    }

    /// worker进度上报入口，Active期间单调不减
    fn update_progress(&self, job_id: Uuid, percent: u8, message: Option<String>) {
        let mut event = None;
        {
            let mut guard = self.state();
            let Some(job) = guard.jobs.get_mut(&job_id) else {
                return;
            };
            if job.state != JobState::Active {
                return;
            }
            let clamped = percent.min(100);
            if clamped > job.progress {
                job.progress = clamped;
                event = Some(JobEvent::Progress {
                    job_id,
                    correlation_id: job.request.correlation_id,
                    percent: clamped,
                    message,
                    occurred_at: Utc::now(),
                });
            }
        }
        if let Some(event) = event {
            self.events.notify(event);
        }
    }

    pub fn snapshot(&self, job_id: Uuid) -> Option<JobSnapshot> {
        self.state().jobs.get(&job_id).map(JobSnapshot::from)
    }

    pub fn snapshot_by_correlation(&self, correlation_id: i64) -> Option<JobSnapshot> {
        let guard = self.state();
        let job_id = guard.correlations.get(&correlation_id)?;
        guard.jobs.get(job_id).map(JobSnapshot::from)
    }

    pub fn job_id_by_correlation(&self, correlation_id: i64) -> Option<Uuid> {
        self.state().correlations.get(&correlation_id).copied()
    }

    pub fn list_active(&self) -> Vec<JobSnapshot> {
        self.state()
            .jobs
            .values()
            .filter(|job| job.state == JobState::Active)
            .map(JobSnapshot::from)
            .collect()
    }

    pub fn stats(&self) -> JobStatusSummary {
        let guard = self.state();
        let mut summary = JobStatusSummary::default();
        for job in guard.jobs.values() {
            match job.state {
                JobState::Waiting => summary.waiting += 1,
                JobState::Active => summary.active += 1,
                JobState::Delayed => summary.delayed += 1,
                JobState::Completed => summary.completed += 1,
                JobState::Failed => summary.failed += 1,
            }
        }
        summary
    }

    pub fn proxy_pool(&self) -> &Arc<ProxyPool> {
        &self.proxy_pool
    }
}

/// 代理是否应当为这次失败背锅
///
/// 验证挑战是目标站点针对行为的判定，不计入代理健康度
fn is_proxy_attributable(error: &OrchestratorError) -> bool {
    matches!(
        error,
        OrchestratorError::Network(_)
            | OrchestratorError::Timeout(_)
            | OrchestratorError::RateLimited(_)
    )
}

/// 把worker的进度回调桥接回调度器
struct SchedulerProgressSink {
    scheduler: Weak<ScrapeScheduler>,
    job_id: Uuid,
}

impl ProgressSink for SchedulerProgressSink {
    fn report(&self, percent: u8, message: Option<String>) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.update_progress(self.job_id, percent, message);
        }
    }
}
