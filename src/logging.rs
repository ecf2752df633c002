//! 日志初始化
//!
//! RUST_LOG优先生效，未设置时回落到调用方给的默认级别

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化全局日志订阅器，进程入口调用一次
///
/// format支持 json / pretty / compact，重复初始化会报错
pub fn init_logging(default_level: &str, format: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let base = tracing_subscriber::registry().with(filter);

    let fmt = tracing_subscriber::fmt::layer();
    match format {
        "json" => base.with(fmt.json()).try_init(),
        "pretty" => base.with(fmt.pretty()).try_init(),
        "compact" => base.with(fmt.compact()).try_init(),
        other => {
            return Err(anyhow::anyhow!(
                "未知的日志格式 {other}，可选 json / pretty / compact"
            ))
        }
    }
    .map_err(|e| anyhow::anyhow!("日志订阅器初始化失败: {e}"))?;

    Ok(())
}
