//! 监控管线错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 WatchError 决定 FallbackTone / LogAndContinue / ForceExpire / UseDefault / KeepEarliest。

use std::time::Duration;

use thiserror::Error;

/// 音频输出错误（素材缺失、播放器失败）
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Sound asset not found: {0}")]
    AssetMissing(String),

    #[error("Player command failed: {0}")]
    PlayerFailed(String),

    #[error("Audio I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// 外部通知渠道错误
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notifier disabled")]
    Disabled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Channel rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// 管线运行过程中可能出现的错误；任何一种都不应让其它区域停止处理
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Timer for zone {zone_id} orphaned (no refresh for {silent:?})")]
    OrphanedTimer { zone_id: String, silent: Duration },

    #[error("Zone {0} silent beyond its state timeout")]
    StaleZone(String),

    #[error("No grace period configured for zone {0}")]
    MissingGrace(String),

    #[error("Invalid phase plan: {0}")]
    InvalidPhasePlan(String),

    #[error("Config error: {0}")]
    Config(String),

    /// 同一区域出现第二个计时器：程序缺陷信号
    #[error("Duplicate timer for zone {0}")]
    DuplicateTimer(String),

    #[error("Journal error: {0}")]
    Journal(String),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 素材不可用时改放合成音
    FallbackTone,
    /// 记录日志后继续当前周期
    LogAndContinue,
    /// 强制过期并清理陈旧状态
    ForceExpire,
    /// 回退到文档化的默认值
    UseDefault,
    /// 保留最早的计时器，丢弃重复项
    KeepEarliest,
}
