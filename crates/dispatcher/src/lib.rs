//! 抓取任务调度器
//!
//! 双车道优先级队列、重试退避、僵尸任务检测与代理轮换的
//! 进程内实现，对外只暴露controller这一层门面。

pub mod controller;
pub mod proxy_pool;
pub mod retry_policy;
pub mod scheduler;
pub mod settings;

pub use controller::*;
pub use proxy_pool::*;
pub use retry_policy::*;
pub use scheduler::*;
pub use settings::*;
