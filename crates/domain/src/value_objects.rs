use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;

/// 用户套餐层级，决定任务进入哪条等待车道
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Tier {
    #[serde(rename = "free")]
    Standard,
    #[serde(rename = "premium")]
    Premium,
}

impl Tier {
    pub fn is_premium(&self) -> bool {
        matches!(self, Tier::Premium)
    }
}

/// 支持的抓取平台
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Platform {
    #[serde(rename = "tiktok")]
    TikTok,
    #[serde(rename = "facebook")]
    Facebook,
}

impl Platform {
    /// 根据URL判断平台
    pub fn from_url(url: &str) -> Option<Platform> {
        let lower = url.to_lowercase();
        if lower.contains("tiktok.com") || lower.contains("douyin.com") {
            Some(Platform::TikTok)
        } else if lower.contains("facebook.com")
            || lower.contains("fb.watch")
            || lower.contains("fb.com")
        {
            Some(Platform::Facebook)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::TikTok => "tiktok",
            Platform::Facebook => "facebook",
        }
    }
}

/// 代理轮换策略，取值与后台设置 proxy_rotation 保持一致
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    #[serde(rename = "random")]
    #[default]
    Random,
    #[serde(rename = "sequential")]
    Sequential,
}

impl RotationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStrategy::Random => "random",
            RotationStrategy::Sequential => "sequential",
        }
    }
}

impl FromStr for RotationStrategy {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "random" => Ok(RotationStrategy::Random),
            "sequential" => Ok(RotationStrategy::Sequential),
            other => Err(OrchestratorError::config_error(format!(
                "Invalid rotation strategy: {other}"
            ))),
        }
    }
}
