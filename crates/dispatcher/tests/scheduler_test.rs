//! 调度器端到端行为测试
//!
//! 全部跑在暂停时钟上，退避与超时由tokio自动推进，
//! 后台循环不启动，各轮扫描由测试手动驱动

mod common;

use std::time::Duration;

use orchestrator_dispatcher::settings::keys;
use orchestrator_dispatcher::SchedulerTimings;
use orchestrator_domain::{JobState, OrchestratorError, RotationStrategy, ScrapeRequest, Tier};

use common::{harness, harness_with_timings, Script};

fn standard_request(url: &str, requester: &str) -> ScrapeRequest {
    ScrapeRequest::new(url.to_string(), requester.to_string(), Tier::Standard).unwrap()
}

fn premium_request(url: &str, requester: &str) -> ScrapeRequest {
    ScrapeRequest::new(url.to_string(), requester.to_string(), Tier::Premium).unwrap()
}

/// 轮询等待条件成立，暂停时钟下sleep会被自动快进
async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..600 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("等待超时: {what}");
}

#[tokio::test(start_paused = true)]
async fn test_single_standard_job_completes_with_progress() {
    let h = harness();
    h.worker
        .script(Script::SucceedWithProgress(vec![25, 80], 42));

    let job_id = h
        .scheduler
        .submit(standard_request(
            "https://www.tiktok.com/@a/video/1",
            "user-1",
        ))
        .unwrap();

    wait_for(
        || {
            h.scheduler
                .snapshot(job_id)
                .map(|s| s.state == JobState::Completed)
                .unwrap_or(false)
        },
        "任务完成",
    )
    .await;

    let snapshot = h.scheduler.snapshot(job_id).unwrap();
    assert_eq!(snapshot.progress, 100);
    assert_eq!(snapshot.retry_count, 0);
    assert_eq!(snapshot.outcome.unwrap().total_comments, 42);
    assert!(snapshot.started_at.is_some());
    assert!(snapshot.finished_at.is_some());

    let kinds = h.events.kinds_for(job_id);
    assert_eq!(
        kinds,
        vec![
            "queuePosition",
            "started",
            "progress",
            "progress",
            "completed"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_premium_same_identity_is_serialized() {
    let h = harness();
    h.worker.script(Script::Hang);
    h.worker.script(Script::Succeed(1));

    let first = h
        .scheduler
        .submit(premium_request("https://www.tiktok.com/@a/video/1", "vip-1"))
        .unwrap();
    let second = h
        .scheduler
        .submit(premium_request("https://www.tiktok.com/@a/video/2", "vip-1"))
        .unwrap();

    wait_for(|| h.worker.execution_count() == 1, "首个任务开始执行").await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    // 同租户的第二个任务被占位挡住，不会并发执行
    assert_eq!(h.worker.execution_count(), 1);
    assert_eq!(h.worker.executions()[0].job_id, first);
    assert_eq!(
        h.scheduler.snapshot(second).unwrap().state,
        JobState::Waiting
    );

    // 另一个租户不受影响，立即派发
    let other = h
        .scheduler
        .submit(premium_request("https://www.tiktok.com/@b/video/3", "vip-2"))
        .unwrap();
    wait_for(|| h.worker.execution_count() == 2, "其他租户任务执行").await;
    assert_eq!(h.worker.executions()[1].job_id, other);

    h.scheduler.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_premium_blocked_job_keeps_lane_position() {
    let h = harness();
    h.worker
        .script(Script::SucceedAfter(Duration::from_secs(3), 1));

    // A1占住租户A，A2被挡，其他租户照常派发，A3排在A2之后
    let a1 = h
        .scheduler
        .submit(premium_request("https://www.tiktok.com/@a/video/1", "vip-a"))
        .unwrap();
    let a2 = h
        .scheduler
        .submit(premium_request("https://www.tiktok.com/@a/video/2", "vip-a"))
        .unwrap();
    let b1 = h
        .scheduler
        .submit(premium_request("https://www.tiktok.com/@b/video/1", "vip-b"))
        .unwrap();
    let c1 = h
        .scheduler
        .submit(premium_request("https://www.tiktok.com/@c/video/1", "vip-c"))
        .unwrap();
    let a3 = h
        .scheduler
        .submit(premium_request("https://www.tiktok.com/@a/video/3", "vip-a"))
        .unwrap();

    wait_for(|| h.worker.execution_count() == 3, "其他租户照常派发").await;
    assert_eq!(
        h.scheduler.snapshot(a2).unwrap().state,
        JobState::Waiting
    );

    // A1完成后，A2必须先于更晚提交的A3派发
    wait_for(
        || {
            h.scheduler
                .snapshot(a3)
                .map(|s| s.state == JobState::Completed)
                .unwrap_or(false)
        },
        "全部任务完成",
    )
    .await;
    let order: Vec<_> = h.worker.executions().iter().map(|e| e.job_id).collect();
    assert_eq!(order, vec![a1, b1, c1, a2, a3]);
}

// 多线程运行时下worker可能在launch回锁登记ActiveRun之前就落定，
// 占位若靠登记记录来释放就会泄漏，后续同租户任务永远Waiting
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_premium_identity_released_when_worker_settles_instantly() {
    let h = harness();

    for i in 0..300 {
        let job_id = h
            .scheduler
            .submit(premium_request(
                &format!("https://www.tiktok.com/@a/video/{i}"),
                "vip-1",
            ))
            .unwrap();

        let mut completed = false;
        for _ in 0..2_000 {
            if h.scheduler
                .snapshot(job_id)
                .map(|s| s.state == JobState::Completed)
                .unwrap_or(false)
            {
                completed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(
            completed,
            "第{}个任务卡在 {:?}，统计 {:?}",
            i,
            h.scheduler.snapshot(job_id).map(|s| s.state),
            h.scheduler.stats()
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_standard_lane_respects_hot_reloaded_concurrency() {
    let h = harness();
    h.settings.set(keys::STANDARD_CONCURRENCY, 2);
    for _ in 0..3 {
        h.worker.script(Script::Hang);
    }

    for i in 0..3 {
        h.scheduler
            .submit(standard_request(
                &format!("https://www.tiktok.com/@a/video/{i}"),
                "user-1",
            ))
            .unwrap();
    }

    wait_for(|| h.worker.execution_count() == 2, "前两个任务开始执行").await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let stats = h.scheduler.stats();
    assert_eq!(stats.active, 2);
    assert_eq!(stats.waiting, 1);

    // 上调并发上限，下一轮dispatch立即放行第三个任务
    h.settings.set(keys::STANDARD_CONCURRENCY, 3);
    h.scheduler.dispatch_pass().await;
    wait_for(|| h.worker.execution_count() == 3, "第三个任务放行").await;

    h.scheduler.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retry_until_success() {
    let h = harness();
    h.worker
        .script(Script::Fail(OrchestratorError::timeout("deadline exceeded")));
    h.worker
        .script(Script::Fail(OrchestratorError::network("connection reset")));
    h.worker.script(Script::Succeed(7));

    let job_id = h
        .scheduler
        .submit(standard_request(
            "https://www.facebook.com/watch?v=1",
            "user-1",
        ))
        .unwrap();

    wait_for(
        || {
            h.scheduler
                .snapshot(job_id)
                .map(|s| s.state == JobState::Completed)
                .unwrap_or(false)
        },
        "重试后完成",
    )
    .await;

    assert_eq!(h.worker.execution_count(), 3);
    let attempts: Vec<u32> = h.worker.executions().iter().map(|e| e.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let snapshot = h.scheduler.snapshot(job_id).unwrap();
    assert_eq!(snapshot.retry_count, 2);
    assert_eq!(snapshot.outcome.unwrap().total_comments, 7);

    // 每次重新入队都推一次排位，每次attempt都推一次started
    let kinds = h.events.kinds_for(job_id);
    assert_eq!(kinds.iter().filter(|k| **k == "started").count(), 3);
    assert_eq!(kinds.iter().filter(|k| **k == "queuePosition").count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_is_terminal_failure() {
    let h = harness();
    for _ in 0..3 {
        h.worker
            .script(Script::Fail(OrchestratorError::timeout("deadline exceeded")));
    }

    let job_id = h
        .scheduler
        .submit(standard_request(
            "https://www.tiktok.com/@a/video/1",
            "user-1",
        ))
        .unwrap();

    wait_for(
        || {
            h.scheduler
                .snapshot(job_id)
                .map(|s| s.state == JobState::Failed)
                .unwrap_or(false)
        },
        "重试耗尽后失败",
    )
    .await;

    // max_retries=2，总共恰好3次attempt
    assert_eq!(h.worker.execution_count(), 3);
    let (reason, retryable) = h.events.last_failed_for(job_id).unwrap();
    assert!(reason.contains("超时"));
    assert!(!retryable);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_does_not_retry() {
    let h = harness();
    h.worker.script(Script::Fail(OrchestratorError::worker_failed(
        "selector .comment-list not found",
    )));

    let job_id = h
        .scheduler
        .submit(standard_request(
            "https://www.tiktok.com/@a/video/1",
            "user-1",
        ))
        .unwrap();

    wait_for(
        || {
            h.scheduler
                .snapshot(job_id)
                .map(|s| s.state == JobState::Failed)
                .unwrap_or(false)
        },
        "永久失败",
    )
    .await;

    assert_eq!(h.worker.execution_count(), 1);
    let (_, retryable) = h.events.last_failed_for(job_id).unwrap();
    assert!(!retryable);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_only_affects_waiting_jobs() {
    let h = harness();
    h.worker.script(Script::Hang);

    let active = h
        .scheduler
        .submit(standard_request(
            "https://www.tiktok.com/@a/video/1",
            "user-1",
        ))
        .unwrap();
    let waiting = h
        .scheduler
        .submit(standard_request(
            "https://www.tiktok.com/@a/video/2",
            "user-1",
        ))
        .unwrap();

    wait_for(|| h.worker.execution_count() == 1, "首个任务占住并发").await;

    assert!(h.scheduler.cancel(waiting));
    let snapshot = h.scheduler.snapshot(waiting).unwrap();
    assert_eq!(snapshot.state, JobState::Failed);
    assert_eq!(snapshot.failure_reason.as_deref(), Some("cancelled"));
    let (reason, retryable) = h.events.last_failed_for(waiting).unwrap();
    assert_eq!(reason, "cancelled");
    assert!(!retryable);

    // Active任务不可抢占，重复取消也幂等地返回false
    assert!(!h.scheduler.cancel(active));
    assert!(!h.scheduler.cancel(waiting));
    assert!(!h.scheduler.cancel(uuid::Uuid::new_v4()));
    assert_eq!(
        h.scheduler.snapshot(active).unwrap().state,
        JobState::Active
    );

    h.scheduler.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_zombie_sweep_force_fails_stuck_job() {
    let h = harness_with_timings(SchedulerTimings {
        zombie_sweep_interval: Duration::from_secs(1),
        zombie_grace: Duration::from_secs(2),
        ..Default::default()
    });
    h.worker.script(Script::Hang);

    let job_id = h
        .scheduler
        .submit(standard_request(
            "https://www.tiktok.com/@a/video/1",
            "user-1",
        ))
        .unwrap();
    wait_for(|| h.worker.execution_count() == 1, "任务开始执行").await;

    // 运行5秒后把超时阈值热改为1秒，阈值+宽限=3秒 < 已运行时长
    tokio::time::sleep(Duration::from_secs(5)).await;
    h.settings.set(keys::JOB_TIMEOUT_MS, 1_000);
    h.scheduler.zombie_sweep().await;

    let snapshot = h.scheduler.snapshot(job_id).unwrap();
    assert_eq!(snapshot.state, JobState::Failed);
    assert!(snapshot
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("timed out after"));
    let (_, retryable) = h.events.last_failed_for(job_id).unwrap();
    assert!(retryable);

    // 强制失败释放了并发额度，后续任务可以正常派发
    h.worker.script(Script::Succeed(3));
    let next = h
        .scheduler
        .submit(standard_request(
            "https://www.tiktok.com/@a/video/2",
            "user-1",
        ))
        .unwrap();
    wait_for(
        || {
            h.scheduler
                .snapshot(next)
                .map(|s| s.state == JobState::Completed)
                .unwrap_or(false)
        },
        "后续任务完成",
    )
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_worker_timeout_race_produces_retryable_failure() {
    let h = harness();
    // worker耗时超过job_timeout，超时竞速先落定
    h.settings.set(keys::JOB_TIMEOUT_MS, 1_000);
    h.worker.set_work_duration(Duration::from_secs(10));
    for _ in 0..3 {
        h.worker.script(Script::Succeed(1));
    }

    let job_id = h
        .scheduler
        .submit(standard_request(
            "https://www.tiktok.com/@a/video/1",
            "user-1",
        ))
        .unwrap();

    wait_for(
        || {
            h.scheduler
                .snapshot(job_id)
                .map(|s| s.state == JobState::Failed)
                .unwrap_or(false)
        },
        "超时重试耗尽",
    )
    .await;

    // 每次attempt都被超时打断，3次后进入终态
    assert_eq!(h.worker.execution_count(), 3);
    let snapshot = h.scheduler.snapshot(job_id).unwrap();
    assert!(snapshot
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("timed out after 1000ms"));
}

#[tokio::test(start_paused = true)]
async fn test_proxy_from_pool_flows_into_worker_context() {
    let h = harness();
    h.proxy_pool.configure(
        vec!["p1:8080".into(), "p2:8080".into()],
        RotationStrategy::Sequential,
    );
    h.worker.script(Script::Succeed(1));

    let job_id = h
        .scheduler
        .submit(standard_request(
            "https://www.tiktok.com/@a/video/1",
            "user-1",
        ))
        .unwrap();
    wait_for(
        || {
            h.scheduler
                .snapshot(job_id)
                .map(|s| s.state == JobState::Completed)
                .unwrap_or(false)
        },
        "任务完成",
    )
    .await;

    assert_eq!(h.worker.executions()[0].proxy.as_deref(), Some("p1:8080"));
    let stats = h.proxy_pool.stats();
    let p1 = stats
        .entries
        .iter()
        .find(|e| e.address == "p1:8080")
        .unwrap();
    assert_eq!(p1.success_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_proxy_override_bypasses_pool() {
    let h = harness();
    h.proxy_pool
        .configure(vec!["p1:8080".into()], RotationStrategy::Sequential);
    h.worker.script(Script::Succeed(1));

    let mut request = standard_request("https://www.tiktok.com/@a/video/1", "user-1");
    request.proxy_override = Some("custom:3128".into());
    let job_id = h.scheduler.submit(request).unwrap();
    wait_for(
        || {
            h.scheduler
                .snapshot(job_id)
                .map(|s| s.state == JobState::Completed)
                .unwrap_or(false)
        },
        "任务完成",
    )
    .await;

    assert_eq!(h.worker.executions()[0].proxy.as_deref(), Some("custom:3128"));
    // 自带代理的结果不回报池
    assert_eq!(h.proxy_pool.stats().entries[0].success_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_network_failures_demote_pool_proxy() {
    let h = harness();
    h.proxy_pool
        .configure(vec!["p1:8080".into()], RotationStrategy::Sequential);
    for _ in 0..3 {
        h.worker
            .script(Script::Fail(OrchestratorError::network("connection reset")));
    }

    let job_id = h
        .scheduler
        .submit(standard_request(
            "https://www.tiktok.com/@a/video/1",
            "user-1",
        ))
        .unwrap();
    wait_for(
        || {
            h.scheduler
                .snapshot(job_id)
                .map(|s| s.state == JobState::Failed)
                .unwrap_or(false)
        },
        "重试耗尽",
    )
    .await;

    // 3次网络失败正好到摘除阈值
    let stats = h.proxy_pool.stats();
    assert_eq!(stats.healthy, 0);
    assert_eq!(stats.entries[0].consecutive_failures, 3);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_keeps_jobs_within_retention() {
    let h = harness();
    h.worker.script(Script::Succeed(1));

    let correlation = 42;
    let job_id = h
        .scheduler
        .submit(
            standard_request("https://www.tiktok.com/@a/video/1", "user-1")
                .with_correlation_id(correlation),
        )
        .unwrap();
    wait_for(
        || {
            h.scheduler
                .snapshot(job_id)
                .map(|s| s.state == JobState::Completed)
                .unwrap_or(false)
        },
        "任务完成",
    )
    .await;

    // 保留期内清理不动它
    h.scheduler.cleanup_pass();
    assert!(h.scheduler.snapshot(job_id).is_some());
    assert!(h.scheduler.snapshot_by_correlation(correlation).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_submit_rejects_invalid_request() {
    let h = harness();
    let mut request = standard_request("https://www.tiktok.com/@a/video/1", "user-1");
    request.max_comments = 0;
    assert!(h.scheduler.submit(request).is_err());
    assert_eq!(h.scheduler.stats().total(), 0);
    assert!(h.events.events().is_empty());
}
